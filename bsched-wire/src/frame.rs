// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The framed kernel stream: a length-prefixed packet
//! codec layered over any `Read + Write` byte stream, buffered with
//! `bytes::BytesMut` the way `datadog-ipc`'s `BlockingTransport` buffers
//! its `LengthDelimitedCodec` frames (`datadog-ipc/src/transport/
//! blocking.rs`), adapted from that async/tarpc-specific transport to a
//! plain blocking/non-blocking `std::io` stream carrying kernels.
//!
//! Wire packet layout: `[u32 length_including_header][u16
//! type_id][kernel body]`, where `length_including_header` counts every
//! byte following the length field itself (type-id, header, payload, and
//! any nested carries-parent packet). Kernel body: `[u8 flags][u64
//! identity][u16 result_code][u64 principal_id][socket_address
//! source][socket_address destination][payload]`.

use std::io::{self, Cursor, Read, Write};

use bytes::{Buf, BufMut, BytesMut};

use bsched_kernel::{Kernel, KernelFlags, KernelHeader, KernelId, KernelRegistry, ResultCode};

use crate::addr::{read_endpoint, write_endpoint};
use crate::error::WireError;

/// Maximum accepted packet size. A packet larger than this is treated as
/// framing corruption (a transport error) rather than an
/// unbounded allocation.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

const LENGTH_PREFIX_LEN: usize = 4;
const TYPE_ID_LEN: usize = 2;

/// Smallest possible kernel body: type-id, flags, identity, result,
/// principal-id, and the two address tags (an address can encode as
/// just a one-byte "none" tag) — nothing shorter can be a real frame.
const MIN_KERNEL_BODY_LEN: u32 = 23;

/// A bidirectional, buffered framed kernel codec over `S`.
///
/// `read_kernel` never performs I/O itself: it only inspects bytes
/// already buffered by [`FramedStream::fill`]. This split exists so the
/// socket pipeline's reactor can call `fill` once per readable-event and
/// then drain every complete packet already buffered without blocking:
/// fill the framed stream, then loop `read_kernel()` while packets are
/// available.
pub struct FramedStream<S> {
    stream: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S> FramedStream<S>
where
    S: Read + Write,
{
    pub fn new(stream: S) -> Self {
        FramedStream {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Reads as many bytes as the underlying stream currently has
    /// available into the internal read buffer. A `WouldBlock` error from
    /// a non-blocking stream is not an error here: it just means nothing
    /// new arrived this turn.
    pub fn fill(&mut self) -> io::Result<usize> {
        let mut total = 0;
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    if total == 0 {
                        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"));
                    }
                    break;
                }
                Ok(n) => {
                    self.read_buf.put_slice(&chunk[..n]);
                    total += n;
                    if n < chunk.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Serializes `k` into the outgoing buffer: type-id, header, payload, and — if
    /// `CARRIES_PARENT` is set — the parent kernel framed recursively in
    /// the same packet, sans its own outer length prefix. Does not touch
    /// the socket; call [`FramedStream::flush`] to push bytes out.
    pub fn write_kernel(&mut self, k: &dyn Kernel, parent: Option<&dyn Kernel>) -> Result<(), WireError> {
        let mut body = Vec::new();
        write_kernel_body(&mut body, k)?;
        if k.header().flags.contains(KernelFlags::CARRIES_PARENT) {
            let parent = parent.expect("CARRIES_PARENT set but no parent kernel supplied");
            write_kernel_body(&mut body, parent)?;
        }

        if body.len() as u64 > MAX_FRAME_LEN as u64 {
            return Err(WireError::FrameTooLarge(body.len() as u32));
        }

        self.write_buf.put_u32(body.len() as u32);
        self.write_buf.put_slice(&body);
        Ok(())
    }

    /// Pushes buffered outgoing bytes to the stream. Returns the number
    /// of bytes actually written; a partial write leaves the remainder
    /// buffered for the next call.
    pub fn flush(&mut self) -> io::Result<usize> {
        let mut total = 0;
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => break,
                Ok(n) => {
                    self.write_buf.advance(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        let _ = self.stream.flush();
        Ok(total)
    }

    /// Decodes the next complete packet already buffered, reconstructing
    /// the kernel (and, if `CARRIES_PARENT`, its embedded parent) via
    /// `registry`. Returns `Ok(None)` if no complete packet is buffered
    /// yet — including the case of a partially-written packet, which
    /// must never be observed as a corrupted kernel.
    pub fn read_kernel(
        &mut self,
        registry: &KernelRegistry,
    ) -> Result<Option<(Box<dyn Kernel>, Option<Box<dyn Kernel>>)>, WireError> {
        loop {
            if self.read_buf.len() < LENGTH_PREFIX_LEN {
                return Ok(None);
            }
            let len = u32::from_be_bytes(self.read_buf[..LENGTH_PREFIX_LEN].try_into().unwrap());
            if len > MAX_FRAME_LEN {
                return Err(WireError::FrameTooLarge(len));
            }
            let total = LENGTH_PREFIX_LEN + len as usize;
            if self.read_buf.len() < total {
                return Ok(None);
            }

            // A length prefix that survived truncation (the bytes after it
            // got cut, but the prefix itself still claims the original
            // size) looks exactly like a valid frame on its own: every
            // field read below succeeds, just against the wrong bytes. The
            // only place that shows up is the frame immediately after —
            // its length/type get read from whatever bytes the corrupted
            // frame didn't actually own. Peek it, when enough is buffered
            // to, before trusting `total`.
            if !self.next_frame_is_plausible(total, registry) {
                if let Some(offset) = self.find_resync_offset(registry) {
                    self.read_buf.advance(offset);
                    continue;
                }
                // No better boundary anywhere in the buffered data — fall
                // through and decode at face value. This keeps a lone
                // well-formed frame followed by a genuinely unknown type
                // decoding normally; the unknown type surfaces as its own
                // error on the next call, same as today.
            }

            self.read_buf.advance(LENGTH_PREFIX_LEN);
            let packet = self.read_buf.split_to(len as usize);
            let mut cursor = Cursor::new(&packet[..]);

            let (kernel, consumed_flags) = read_kernel_body(&mut cursor, registry)?;
            let parent = if consumed_flags.contains(KernelFlags::CARRIES_PARENT) {
                let (parent_kernel, _) = read_kernel_body(&mut cursor, registry)?;
                Some(parent_kernel)
            } else {
                None
            };

            return Ok(Some((kernel, parent)));
        }
    }

    /// Whether the frame that would start right after a tentative frame
    /// ending at `total` looks like a real boundary. Not enough buffered
    /// yet to check counts as plausible — the common case is simply one
    /// packet buffered so far, and there is nothing to contradict it with.
    fn next_frame_is_plausible(&self, total: usize, registry: &KernelRegistry) -> bool {
        let lookahead = LENGTH_PREFIX_LEN + TYPE_ID_LEN;
        if self.read_buf.len() < total + lookahead {
            return true;
        }
        plausible_boundary_at(&self.read_buf, total, registry)
    }

    /// Scans the buffered bytes for the first offset (after the current,
    /// already-rejected one) whose length prefix and following type-id
    /// both look like a genuine frame start, and reports how far to
    /// discard to reach it. `None` means nothing recognizable was found
    /// in what's buffered so far.
    fn find_resync_offset(&self, registry: &KernelRegistry) -> Option<usize> {
        let window = LENGTH_PREFIX_LEN + TYPE_ID_LEN;
        if self.read_buf.len() < window {
            return None;
        }
        let last_offset = self.read_buf.len() - window;
        (1..=last_offset).find(|&offset| plausible_boundary_at(&self.read_buf, offset, registry))
    }

    /// Flushes queued output and, if a partial packet sits at the front
    /// of the read buffer with no way to complete it from data already
    /// read, leaves it in place for the next `fill`. Draining complete
    /// packets is handled by repeated `read_kernel` calls; `sync` just
    /// guarantees the write side is not left buffered indefinitely.
    pub fn sync(&mut self) -> io::Result<()> {
        self.flush()?;
        Ok(())
    }

    pub fn has_buffered_output(&self) -> bool {
        !self.write_buf.is_empty()
    }
}

fn write_kernel_body(out: &mut Vec<u8>, k: &dyn Kernel) -> Result<(), WireError> {
    let header = k.header();
    out.write_all(&k.wire_type().to_be_bytes())?;
    out.write_all(&header.flags.bits().to_be_bytes())?;
    out.write_all(&header.identity.0.to_be_bytes())?;
    out.write_all(&header.result.to_wire().to_be_bytes())?;
    out.write_all(&header.principal_id.map(|id| id.0).unwrap_or(0).to_be_bytes())?;
    write_endpoint(out, header.source.as_ref())?;
    write_endpoint(out, header.destination.as_ref())?;
    k.write_payload(out)?;
    Ok(())
}

/// Whether `buf[offset..]` begins with a length prefix and type-id that
/// could plausibly be a real frame: the length within the range any
/// kernel body can actually have, and the type-id one the registry
/// actually knows about.
fn plausible_boundary_at(buf: &[u8], offset: usize, registry: &KernelRegistry) -> bool {
    let len = u32::from_be_bytes(buf[offset..offset + LENGTH_PREFIX_LEN].try_into().unwrap());
    if !(MIN_KERNEL_BODY_LEN..=MAX_FRAME_LEN).contains(&len) {
        return false;
    }
    let type_start = offset + LENGTH_PREFIX_LEN;
    let type_id =
        u16::from_be_bytes(buf[type_start..type_start + TYPE_ID_LEN].try_into().unwrap()) as u32;
    registry.lookup_by_id(type_id).is_some()
}

fn read_kernel_body(
    cursor: &mut Cursor<&[u8]>,
    registry: &KernelRegistry,
) -> Result<(Box<dyn Kernel>, KernelFlags), WireError> {
    let mut type_id_buf = [0u8; 2];
    cursor.read_exact(&mut type_id_buf)?;
    let type_id = u16::from_be_bytes(type_id_buf) as u32;

    let mut flags_buf = [0u8; 1];
    cursor.read_exact(&mut flags_buf)?;
    let flags = KernelFlags::from_bits_truncate(flags_buf[0]);

    let mut identity_buf = [0u8; 8];
    cursor.read_exact(&mut identity_buf)?;
    let identity = KernelId(u64::from_be_bytes(identity_buf));

    let mut result_buf = [0u8; 2];
    cursor.read_exact(&mut result_buf)?;
    let result = ResultCode::from_wire(u16::from_be_bytes(result_buf));

    let mut principal_buf = [0u8; 8];
    cursor.read_exact(&mut principal_buf)?;
    let principal_raw = u64::from_be_bytes(principal_buf);
    let principal_id = if principal_raw == 0 { None } else { Some(KernelId(principal_raw)) };

    let source = read_endpoint(cursor)?;
    let destination = read_endpoint(cursor)?;

    let header = KernelHeader {
        identity,
        parent_id: None,
        principal_id,
        source,
        destination,
        result,
        flags,
    };

    let kernel = registry.read_object(type_id, header, cursor)?;
    Ok((kernel, flags))
}
