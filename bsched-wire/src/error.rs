// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bsched_kernel::RegistryError;

/// Wire-level failures. Every variant is treated by the socket pipeline
/// as a transport error: the connection is closed and recovery runs.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("i/o error on framed stream: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown kernel type-id on the wire: {0}")]
    UnknownType(u32),

    #[error("malformed socket address tag: {0}")]
    BadAddressTag(u8),

    #[error("packet exceeds maximum frame size ({0} bytes)")]
    FrameTooLarge(u32),

    #[error("kernel registry error: {0}")]
    Registry(#[from] RegistryError),
}
