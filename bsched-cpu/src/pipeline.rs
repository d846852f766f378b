// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The CPU pipeline: an unbounded concurrent queue feeding N worker
//! threads, each invoking `act`/`react` on dequeued kernels and
//! generically performing the commit/forwarding logic once a kernel's
//! result goes terminal.
//!
//! Workers use `crossbeam_channel` for the ready queue rather than a
//! hand-rolled mutex+condvar queue, matching this corpus's preference
//! (`libdd-profiling::exporter_manager::ExporterManager` hands work to a
//! worker thread the same way). Kernels are drained in small batches per
//! wake-up (a pop-until-empty iterator grounded on
//! `original_source/src/bscheduler/base/queue_popper.hh`) purely as a
//! throughput detail — dispatch order within the channel stays FIFO.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use tracing::warn;

use bsched_kernel::{Dispatcher, IdGenerator, Kernel, KernelFlags, KernelId, PrincipalLookup, ResultCode};

use crate::principal_table::{mark_no_principal_found, ReactOutcome};
use crate::PrincipalTable;

/// Kernels drained from the ready queue in one worker wake-up before
/// re-checking the channel.
const BATCH_SIZE: usize = 32;

pub struct CpuPipeline {
    sender: Sender<Box<dyn Kernel>>,
    principals: Arc<PrincipalTable>,
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    ids: Arc<IdGenerator>,
}

impl CpuPipeline {
    /// Starts `num_workers` worker threads (default: `available_parallelism`
    /// when `num_workers == 0`). `dispatcher` is the same
    /// façade handle passed to every kernel's `act`/`react`.
    pub fn start(num_workers: usize, dispatcher: Arc<dyn Dispatcher>) -> Self {
        let num_workers = if num_workers == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            num_workers
        };

        let (sender, receiver) = crossbeam_channel::unbounded::<Box<dyn Kernel>>();
        let principals = Arc::new(PrincipalTable::new());
        let running = Arc::new(AtomicBool::new(true));
        let ids = Arc::new(IdGenerator::new());

        let mut workers = Vec::with_capacity(num_workers);
        for index in 0..num_workers {
            let receiver = receiver.clone();
            let principals = Arc::clone(&principals);
            let running = Arc::clone(&running);
            let dispatcher = Arc::clone(&dispatcher);
            let handle = std::thread::Builder::new()
                .name(format!("bsched-cpu-{index}"))
                .spawn(move || worker_loop(receiver, principals, running, dispatcher))
                .expect("failed to spawn CPU pipeline worker");
            workers.push(handle);
        }

        CpuPipeline {
            sender,
            principals,
            running,
            workers,
            ids,
        }
    }

    /// Enqueues `k` for dispatch. Assigns a local
    /// identity if the kernel doesn't have one yet, so that `act()` can
    /// always read its own id to pass to `upstream`.
    pub fn submit(&self, mut k: Box<dyn Kernel>) {
        if !k.header().identity.is_assigned() {
            k.header_mut().identity = self.ids.next_id();
        }
        // The channel is unbounded and the send side never blocks, so
        // this only fails if every worker has already exited (shutdown).
        let _ = self.sender.send(k);
    }

    pub fn principal_lookup(&self) -> Arc<dyn PrincipalLookup> {
        Arc::clone(&self.principals) as Arc<dyn PrincipalLookup>
    }

    /// Suspends `k` directly under its own identity — grafting an
    /// embedded parent by identity, not by pointer — bypassing
    /// `act()`. See [`bsched_kernel::Dispatcher::register_principal`].
    pub fn register_principal(&self, k: Box<dyn Kernel>) {
        let id = k.header().identity;
        debug_assert!(id.is_assigned(), "a carried parent must already have a wire identity");
        self.principals.suspend(id, k);
    }

    /// Removes a suspended principal outright so it can be embedded into
    /// a `CARRIES_PARENT` child bound for another node. See
    /// [`PrincipalTable::take`].
    pub fn take_principal(&self, id: KernelId) -> Option<Box<dyn Kernel>> {
        self.principals.take(id)
    }

    pub fn suspended_count(&self) -> usize {
        self.principals.len()
    }

    /// Cooperative shutdown: clears the running flag and
    /// drops the sender so every worker's `recv()` unblocks with a
    /// disconnect error and the loop exits at its next turn.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn join(&mut self) {
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    receiver: Receiver<Box<dyn Kernel>>,
    principals: Arc<PrincipalTable>,
    running: Arc<AtomicBool>,
    dispatcher: Arc<dyn Dispatcher>,
) {
    while running.load(Ordering::SeqCst) {
        let first = match receiver.recv_timeout(std::time::Duration::from_millis(200)) {
            Ok(k) => k,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        };
        dispatch_one(first, &principals, dispatcher.as_ref());
        for _ in 1..BATCH_SIZE {
            match receiver.try_recv() {
                Ok(k) => dispatch_one(k, &principals, dispatcher.as_ref()),
                Err(_) => break,
            }
        }
    }
}

/// The per-kernel dispatch rule, with the `commit` forwarding logic
/// folded in (see `DESIGN.md` for why: kernels only ever get `&mut self`
/// in `act`/`react`, never ownership of themselves, so the pipeline —
/// which does hold ownership — is the only place that can perform the
/// ownership-moving half of `commit`).
fn dispatch_one(mut k: Box<dyn Kernel>, principals: &Arc<PrincipalTable>, dispatcher: &dyn Dispatcher) {
    if let Some(principal_id) = k.header().principal_id {
        match principals.react(principal_id, k, dispatcher) {
            ReactOutcome::StillSuspended => {}
            ReactOutcome::PrincipalMissing(child) => {
                finish_terminal(mark_no_principal_found(child), principals, dispatcher);
            }
            ReactOutcome::PrincipalCompleted(principal) => {
                finish_terminal(principal, principals, dispatcher);
            }
        }
        return;
    }

    if k.header().result == ResultCode::Undefined {
        let result = panic::catch_unwind(AssertUnwindSafe(|| k.act(dispatcher)));
        if let Err(panic) = result {
            warn!("kernel act() panicked, treating as a failed kernel: {panic:?}");
            k.header_mut().result = ResultCode::Error;
        }

        if k.header().result.is_terminal() {
            finish_terminal(k, principals, dispatcher);
        } else {
            let id = k.header().identity;
            debug_assert!(id.is_assigned(), "submit() must assign identity before dispatch");
            principals.suspend(id, k);
        }
    } else {
        finish_terminal(k, principals, dispatcher);
    }
}

/// `commit`, minus the part a kernel's own `act`/`react` already
/// performed by writing a terminal result into its header.
///
/// A kernel with `source` set arrived over the network and was completed
/// for the first time on *this* node (a `moves-upstream` kernel with no
/// local parent, echoed and replied by its peer). Per the generic
/// submitter-path routing rule — destination empty, copy from source —
/// that reply belongs back on the wire to whoever sent it, not to this
/// node's own exit code — only a kernel with neither a parent *nor* a
/// source is a genuine local terminating root. This refines the literal
/// reading of "principal unset and parent unset means terminating root"
/// to cohere with the generic routing rule; see `DESIGN.md`.
fn finish_terminal(mut k: Box<dyn Kernel>, principals: &Arc<PrincipalTable>, dispatcher: &dyn Dispatcher) {
    let parent_id = k.header().parent_id;
    let origin = k.header_mut().source.take();

    match (parent_id, origin) {
        (None, None) => {
            dispatcher.graceful_shutdown(k.exit_code());
        }
        (maybe_parent, Some(origin)) => {
            // Route back over the wire. If a local parent exists too
            // (a node in the middle of a longer chain), its id travels
            // along so the origin's receive-path graft can hand it to
            // whichever local principal picks this reply up next; it is
            // not otherwise meaningful to the peer receiving this packet.
            k.header_mut().principal_id = maybe_parent;
            k.header_mut().destination = Some(origin);
            k.header_mut().flags.remove(KernelFlags::MOVES_UPSTREAM);
            k.header_mut().flags.insert(KernelFlags::MOVES_DOWNSTREAM);
            dispatcher.send_remote(k);
        }
        (Some(parent_id), None) => {
            k.header_mut().principal_id = Some(parent_id);
            if principals.principal_exists(parent_id) {
                dispatcher.send_local(k);
            } else {
                warn!("kernel {parent_id} has no local principal and no source to reply to; dropping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bsched_kernel::{EchoKernel, KernelHeader};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct RecordingDispatcher {
        shutdown_code: StdMutex<Option<i32>>,
    }

    impl Dispatcher for RecordingDispatcher {
        fn send(&self, _k: Box<dyn Kernel>) {}
        fn send_local(&self, _k: Box<dyn Kernel>) {}
        fn send_remote(&self, _k: Box<dyn Kernel>) {}
        fn upstream(&self, _parent_id: KernelId, _child: Box<dyn Kernel>) {}
        fn register_principal(&self, _k: Box<dyn Kernel>) {}
        fn schedule_after(&self, _k: Box<dyn Kernel>, _after: std::time::Duration) {}
        fn peer_disconnected(&self, _endpoint: bsched_kernel::Endpoint) {}
        fn graceful_shutdown(&self, code: i32) {
            let mut slot = self.shutdown_code.lock().unwrap();
            if slot.is_none() {
                *slot = Some(code);
            }
        }
    }

    #[test]
    fn local_root_echo_exits_with_n() {
        let dispatcher = Arc::new(RecordingDispatcher {
            shutdown_code: StdMutex::new(None),
        });
        let pipeline = CpuPipeline::start(1, dispatcher.clone() as Arc<dyn Dispatcher>);
        pipeline.submit(Box::new(EchoKernel::new(42)));

        for _ in 0..50 {
            if dispatcher.shutdown_code.lock().unwrap().is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(*dispatcher.shutdown_code.lock().unwrap(), Some(42));
    }

    #[test]
    fn panic_in_act_becomes_error_result_not_a_crash() {
        struct Bomb {
            header: KernelHeader,
        }
        impl Kernel for Bomb {
            fn header(&self) -> &KernelHeader {
                &self.header
            }
            fn header_mut(&mut self) -> &mut KernelHeader {
                &mut self.header
            }
            fn wire_type(&self) -> u16 {
                42
            }
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
            fn act(&mut self, _d: &dyn Dispatcher) {
                panic!("boom");
            }
            fn react(&mut self, _c: Box<dyn Kernel>, _d: &dyn Dispatcher) {}
        }

        let dispatcher = Arc::new(RecordingDispatcher {
            shutdown_code: StdMutex::new(None),
        });
        let pipeline = CpuPipeline::start(1, dispatcher.clone() as Arc<dyn Dispatcher>);
        pipeline.submit(Box::new(Bomb {
            header: KernelHeader::default(),
        }));

        for _ in 0..50 {
            if dispatcher.shutdown_code.lock().unwrap().is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        // ResultCode::Error as i32.
        assert_eq!(*dispatcher.shutdown_code.lock().unwrap(), Some(ResultCode::Error.exit_code()));
    }
}
