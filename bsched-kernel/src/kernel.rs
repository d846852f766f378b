// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io::{self, Read, Write};

use crate::dispatcher::Dispatcher;
use crate::endpoint::Endpoint;
use crate::flags::KernelFlags;
use crate::id::KernelId;
use crate::result::ResultCode;

/// The common header every kernel carries on the wire:
/// `[u8 flags][u64 identity][u16 result_code][u64 principal_id]
/// [socket_address source][socket_address destination]`.
///
/// `parent_id` is not wire-encoded here: when `flags.CARRIES_PARENT` is
/// set the parent kernel is a second, nested packet,
/// decoded by the framed stream and attached via [`Kernel::set_parent`]
/// rather than carried as a plain id in the header.
#[derive(Debug, Clone, Default)]
pub struct KernelHeader {
    pub identity: KernelId,
    pub parent_id: Option<KernelId>,
    pub principal_id: Option<KernelId>,
    pub source: Option<Endpoint>,
    pub destination: Option<Endpoint>,
    pub result: ResultCode,
    pub flags: KernelFlags,
}

impl KernelHeader {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none() && self.principal_id.is_none()
    }
}

/// The unit of scheduling and message transport.
///
/// A `Kernel` is executed via `act` (first dispatch) or `react` (a
/// subordinate's reply arriving at its principal). Both are handed a
/// [`Dispatcher`] so they can call back into the runtime (`send`,
/// `upstream`, `commit`) without the kernel crate depending on the
/// pipelines that implement those operations.
pub trait Kernel: Send {
    fn header(&self) -> &KernelHeader;
    fn header_mut(&mut self) -> &mut KernelHeader;

    /// Stable wire type-id, used by the registry and the framed stream.
    fn wire_type(&self) -> u16;

    /// Downcasting hook so a principal's `react` can recover the concrete
    /// type of a completed subordinate kernel: `react`
    /// receives the completed child and typically needs its payload, not
    /// just its header.
    fn as_any(&self) -> &dyn std::any::Any;

    /// Invoked when this kernel is dispatched with no principal set:
    /// the kernel's own logic runs.
    fn act(&mut self, dispatcher: &dyn Dispatcher);

    /// Invoked on the principal when a subordinate kernel with a result
    /// completes: `child` is the completed kernel.
    fn react(&mut self, child: Box<dyn Kernel>, dispatcher: &dyn Dispatcher);

    /// Serializes this kernel's payload only (the header is written
    /// separately by the framed stream). Default: no payload.
    fn write_payload(&self, _out: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }

    /// The process exit code this kernel's completion produces when it
    /// terminates as a root (no principal, no parent, arrived from
    /// nowhere). Defaults to the terminal `ResultCode`'s own integer
    /// value; a concrete kernel overrides this to surface a
    /// payload-specific value instead (see [`crate::EchoKernel`], whose
    /// own `n` becomes the exit code on success, not just `0`).
    fn exit_code(&self) -> i32 {
        self.header().result.exit_code()
    }
}

/// A reader function registered per type-id: deserializes a kernel's
/// payload given an already-decoded header.
pub type KernelReaderFn = fn(header: KernelHeader, input: &mut dyn Read) -> io::Result<Box<dyn Kernel>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_header_is_root() {
        let header = KernelHeader::default();
        assert!(header.is_root());
    }

    #[test]
    fn header_with_parent_is_not_root() {
        let mut header = KernelHeader::default();
        header.parent_id = Some(KernelId(1));
        assert!(!header.is_root());
    }
}
