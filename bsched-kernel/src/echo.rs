// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The one demonstrative kernel type shipped by this crate:
//! `EchoKernel{n: u32}`, wire type-id 1001. User crates register
//! their own kernel types the same way via [`crate::KernelRegistry::register`].

use std::any::Any;
use std::io::{self, Read, Write};

use crate::dispatcher::Dispatcher;
use crate::kernel::{Kernel, KernelHeader};
use crate::result::ResultCode;

pub const ECHO_KERNEL_WIRE_TYPE: u16 = 1001;

#[derive(Debug, Clone)]
pub struct EchoKernel {
    pub header: KernelHeader,
    pub n: u32,
}

impl EchoKernel {
    pub fn new(n: u32) -> Self {
        EchoKernel {
            header: KernelHeader::default(),
            n,
        }
    }
}

impl Kernel for EchoKernel {
    fn header(&self) -> &KernelHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut KernelHeader {
        &mut self.header
    }

    fn wire_type(&self) -> u16 {
        ECHO_KERNEL_WIRE_TYPE
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    /// Always just succeeds; the CPU pipeline's generic terminal-result
    /// handling (`finish_terminal`) decides from there whether that
    /// means shutting down the process (a pure local root), routing the
    /// reply back over the wire (arrived via `moves-upstream` from a
    /// peer, `source` is set), or handing the result to a local parent.
    /// `act()` never makes that routing decision itself — a kernel with
    /// a routing flag that means it should leave this node is shipped
    /// out by `Dispatcher::send`/`upstream` before it ever reaches here.
    fn act(&mut self, _dispatcher: &dyn Dispatcher) {
        self.header.result = ResultCode::Success;
    }

    /// Back at the origin once the remote copy replies: `child` is the
    /// echoed-back kernel; its `n` becomes the process exit code.
    fn react(&mut self, child: Box<dyn Kernel>, dispatcher: &dyn Dispatcher) {
        if let Some(echo) = child.as_any().downcast_ref::<EchoKernel>() {
            dispatcher.graceful_shutdown(echo.n as i32);
        } else {
            dispatcher.graceful_shutdown(ResultCode::Error.exit_code());
        }
    }

    fn write_payload(&self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(&self.n.to_be_bytes())
    }

    /// A successful echo's exit code is its own `n`, not the generic
    /// `ResultCode::Success` value: this is what lets a bare root
    /// `EchoKernel{moves-upstream}` surface the value it carried all the
    /// way back at the origin node, where `finish_terminal` sees only a
    /// freshly wire-decoded copy of itself and no separate principal to
    /// react on (see `bsched-cpu`'s `finish_terminal`).
    fn exit_code(&self) -> i32 {
        match self.header.result {
            ResultCode::Success => self.n as i32,
            other => other.exit_code(),
        }
    }
}

pub fn read_echo_kernel(header: KernelHeader, input: &mut dyn Read) -> io::Result<Box<dyn Kernel>> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(Box::new(EchoKernel {
        header,
        n: u32::from_be_bytes(buf),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trips() {
        let k = EchoKernel::new(42);
        let mut buf = Vec::new();
        k.write_payload(&mut buf).unwrap();
        let mut cursor: &[u8] = &buf;
        let decoded = read_echo_kernel(KernelHeader::default(), &mut cursor).unwrap();
        let echo = decoded.as_any().downcast_ref::<EchoKernel>().unwrap();
        assert_eq!(echo.n, 42);
    }
}
