// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Terminal (and not-yet-terminal) outcome of a kernel, wire-encoded as a
/// `u16`. `Undefined` transitions monotonically to a
/// terminal code on `commit` and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum ResultCode {
    #[default]
    Undefined = 0,
    Success = 1,
    EndpointNotConnected = 2,
    NoUpstreamAvailable = 3,
    NoPrincipalFound = 4,
    Error = 5,
}

impl ResultCode {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ResultCode::Undefined)
    }

    pub fn from_wire(code: u16) -> Self {
        match code {
            0 => ResultCode::Undefined,
            1 => ResultCode::Success,
            2 => ResultCode::EndpointNotConnected,
            3 => ResultCode::NoUpstreamAvailable,
            4 => ResultCode::NoPrincipalFound,
            _ => ResultCode::Error,
        }
    }

    pub fn to_wire(self) -> u16 {
        self as u16
    }

    /// Process exit code for a terminating root kernel:
    /// a non-success result's integer value becomes the exit code.
    pub fn exit_code(self) -> i32 {
        match self {
            ResultCode::Success => 0,
            other => other as i32,
        }
    }
}
