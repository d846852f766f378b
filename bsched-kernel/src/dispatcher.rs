// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The callback interface a kernel's `act`/`react` uses to reach back into
//! the runtime without `bsched-kernel` depending on the pipeline crates
//! that implement it: `send`, `upstream`, `commit`, and friends.

use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::kernel::Kernel;

/// Implemented by `bsched-core::Factory`. Kept as a trait object here so
/// that `bsched-kernel` has no dependency on the pipelines, mirroring
/// the façade's role as a named, explicitly constructed/destroyed handle
/// passed into user code rather than ambient global state.
///
/// `commit` itself (transitioning a kernel's result from
/// `Undefined` to a terminal code, then routing it back to its principal
/// or recording the process exit code) is *not* a method here: by the
/// time a kernel's `act`/`react` returns, the owning pipeline still holds
/// the `Box<dyn Kernel>` that method borrowed `&mut self` from, so only
/// the pipeline — not the kernel itself — is in a position to hand that
/// box onward. A kernel commits simply by writing a terminal
/// [`crate::result::ResultCode`] into its own header; the CPU pipeline
/// performs the forwarding/termination dance generically for every
/// kernel that reaches a terminal result (see `bsched-cpu`'s dispatch
/// loop). What kernels actively *call* on this trait is the subset of
/// the façade API that needs ownership of a *new* kernel they just
/// constructed (`send`, `send_remote`, `upstream`), or that needs no
/// kernel at all (`graceful_shutdown`).
pub trait Dispatcher: Send + Sync {
    /// Enqueues `k` on the local CPU pipeline — unless `k` is still
    /// awaiting its first dispatch and carries a routing flag that means
    /// it should leave this node instead (the submitter-path routing
    /// decision of spec §4.4), in which case it is handed to
    /// [`Dispatcher::send_remote`] instead. See [`Self::send_local`] for
    /// the unconditional form used once that decision has already been
    /// made.
    fn send(&self, k: Box<dyn Kernel>);

    /// Unconditionally enqueues `k` on the local CPU pipeline, bypassing
    /// the routing decision [`Self::send`] applies to a fresh kernel.
    /// Used by the socket pipeline and the CPU pipeline's own
    /// terminal-result handling, which have either already made that
    /// routing decision themselves or are delivering a kernel that
    /// already completed its trip over the wire — its routing flags at
    /// that point are leftover history, not a fresh instruction, and
    /// re-evaluating them would just hand it straight back to
    /// `send_remote` forever.
    fn send_local(&self, k: Box<dyn Kernel>);

    /// Enqueues `k` on the socket pipeline for network routing.
    fn send_remote(&self, k: Box<dyn Kernel>);

    /// Sets `child.parent := parent.identity` and sends `child`.
    fn upstream(&self, parent_id: crate::id::KernelId, child: Box<dyn Kernel>);

    /// Sets the process exit code and stops every pipeline. Used directly
    /// by a root kernel that commits outside the generic principal/parent
    /// forwarding path (see [`crate::EchoKernel`]).
    fn graceful_shutdown(&self, code: i32);

    /// Registers an already-running kernel directly into the CPU
    /// pipeline's suspended-principal table under its own identity,
    /// without invoking `act()` on it.
    ///
    /// Used exactly once, by the socket pipeline's receive path, when a
    /// decoded kernel carries its parent embedded in the same wire frame
    /// (carries-parent: the embedded parent is deserialized as a fresh
    /// kernel and grafted by identity, not by pointer): the parent's
    /// identity was assigned before it left its origin node and is
    /// already present in the child's `principal_id` header field, so
    /// once this call returns, the ordinary dispatch path (`principal_id`
    /// set means `principal.react(child)`) finds it without any further
    /// wiring.
    fn register_principal(&self, kernel: Box<dyn Kernel>);

    /// Schedules `k` on the timer pipeline to wake `after` from now,
    /// forwarded through the standard dispatch path once it fires. Used
    /// by the discovery state machine to arm both the exhausted-scan
    /// backoff and the post-acceptance re-probe.
    fn schedule_after(&self, k: Box<dyn Kernel>, after: Duration);

    /// Notifies the runtime that the peer connection to `endpoint`
    /// closed. Called by the socket pipeline's teardown path once
    /// per closed connection, independently of whatever in-flight kernels
    /// that connection's recovery already bounced back to their senders.
    fn peer_disconnected(&self, endpoint: Endpoint);
}
