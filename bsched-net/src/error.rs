// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Socket pipeline failures (`transport`/`unknown-type` rows).
//! Every variant here is handled the same way by the reactor: the
//! offending connection is closed and recovery runs.

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] bsched_wire::WireError),
}
