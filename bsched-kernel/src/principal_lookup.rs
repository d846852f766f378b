// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A narrow read-only view onto the CPU pipeline's suspended-principal
//! table: look up the principal in the local instance registry; if
//! missing, set result no-principal-found. Kept as a trait so
//! `bsched-net` can depend on it without depending on all of
//! `bsched-cpu`.

use crate::id::KernelId;

pub trait PrincipalLookup: Send + Sync {
    fn principal_exists(&self, id: KernelId) -> bool;
}
