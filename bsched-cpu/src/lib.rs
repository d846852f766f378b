// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The CPU pipeline: a worker pool dispatching kernels via `act`/`react`
//! and performing the generic commit/forwarding logic whenever a kernel's
//! result goes terminal.

mod pipeline;
mod principal_table;

pub use pipeline::CpuPipeline;
pub use principal_table::{PrincipalTable, ReactOutcome};
