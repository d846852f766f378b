// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The `Factory` façade: the process-wide handle that
//! owns all three pipelines and is the `Dispatcher` every kernel's
//! `act`/`react` is handed.
//!
//! Constructing `Factory` is circular: the pipelines need a
//! `Arc<dyn Dispatcher>` to call back into at `start()` time, but that
//! dispatcher needs to reach the very `Factory` whose pipelines it's
//! constructing. [`Arc::new_cyclic`] breaks the cycle the same way
//! `bsched-kernel::InstanceRegistry` breaks its own circular ownership: a
//! [`FactoryDispatcher`] wraps a `Weak<Factory>` rather than a strong
//! reference, so the pipelines only ever reach `Factory` through an
//! upgrade that fails harmlessly once `Factory` itself has started
//! dropping.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use tracing::warn;

use bsched_common::MutexExt;
use bsched_cpu::CpuPipeline;
use bsched_discovery::{SocketPipelineEvent, DISCOVERY_PRINCIPAL_ID};
use bsched_kernel::{
    Dispatcher, Endpoint, Kernel, KernelFlags, KernelId, KernelRegistry, PrincipalLookup, ResultCode,
};
use bsched_net::{SocketConfig, SocketPipeline};
use bsched_timer::TimerPipeline;

/// Start-up knobs for the three pipelines. `num_cpu_workers
/// == 0` asks the CPU pipeline to size itself to `available_parallelism`.
pub struct FactoryConfig {
    pub num_cpu_workers: usize,
    pub socket: SocketConfig,
}

/// Routes a kernel's `act`/`react` callbacks back into the owning
/// `Factory` without handing it a strong reference (see module docs).
struct FactoryDispatcher(Weak<Factory>);

impl Dispatcher for FactoryDispatcher {
    fn send(&self, k: Box<dyn Kernel>) {
        match self.0.upgrade() {
            Some(factory) => factory.send(k),
            None => warn!("dispatcher used after factory shutdown; dropping kernel"),
        }
    }

    fn send_local(&self, k: Box<dyn Kernel>) {
        match self.0.upgrade() {
            Some(factory) => factory.send_local(k),
            None => warn!("dispatcher used after factory shutdown; dropping kernel"),
        }
    }

    fn send_remote(&self, k: Box<dyn Kernel>) {
        match self.0.upgrade() {
            Some(factory) => factory.send_remote(k),
            None => warn!("dispatcher used after factory shutdown; dropping kernel"),
        }
    }

    fn upstream(&self, parent_id: KernelId, child: Box<dyn Kernel>) {
        match self.0.upgrade() {
            Some(factory) => factory.upstream(parent_id, child),
            None => warn!("dispatcher used after factory shutdown; dropping kernel"),
        }
    }

    fn graceful_shutdown(&self, code: i32) {
        if let Some(factory) = self.0.upgrade() {
            factory.graceful_shutdown(code);
        }
    }

    fn register_principal(&self, kernel: Box<dyn Kernel>) {
        match self.0.upgrade() {
            Some(factory) => factory.register_principal(kernel),
            None => warn!("dispatcher used after factory shutdown; dropping kernel"),
        }
    }

    fn schedule_after(&self, k: Box<dyn Kernel>, after: Duration) {
        match self.0.upgrade() {
            Some(factory) => factory.schedule_after(k, after),
            None => warn!("dispatcher used after factory shutdown; dropping kernel"),
        }
    }

    fn peer_disconnected(&self, endpoint: Endpoint) {
        if let Some(factory) = self.0.upgrade() {
            factory.peer_disconnected(endpoint);
        }
    }
}

/// The process-wide handle: a named, explicitly constructed and destroyed
/// object rather than ambient global state. Always held as `Arc<Factory>`:
/// every pipeline thread, and every
/// `FactoryDispatcher` they were handed, keeps its own clone (or a `Weak`
/// derived from one) alive for as long as it runs.
pub struct Factory {
    cpu: Mutex<CpuPipeline>,
    timer: Mutex<TimerPipeline>,
    net: Mutex<SocketPipeline>,
    registry: Arc<KernelRegistry>,
    shutdown_code: Mutex<Option<i32>>,
    shutdown_cv: Condvar,
}

impl Factory {
    /// Starts every pipeline and returns the shared handle, in
    /// start-up order: CPU, then timer, then socket. A listening-socket
    /// bind failure here is treated the same way the pipelines already
    /// treat a worker-thread spawn failure (`CpuPipeline::start`,
    /// `TimerPipeline::start`): it panics rather than threading a
    /// `Result` back through `Arc::new_cyclic`'s constructor closure,
    /// since a daemon that cannot bind its listening address at start-up
    /// has no sensible degraded mode to run in anyway.
    pub fn start(config: FactoryConfig, registry: Arc<KernelRegistry>) -> Arc<Factory> {
        Arc::new_cyclic(|weak: &Weak<Factory>| {
            let dispatcher: Arc<dyn Dispatcher> = Arc::new(FactoryDispatcher(weak.clone()));

            let cpu = CpuPipeline::start(config.num_cpu_workers, Arc::clone(&dispatcher));
            let timer = TimerPipeline::start(Arc::clone(&dispatcher));
            let principal_lookup = cpu.principal_lookup();
            let net = SocketPipeline::start(config.socket, Arc::clone(&registry), Arc::clone(&dispatcher), principal_lookup)
                .expect("failed to start socket pipeline");

            Factory {
                cpu: Mutex::new(cpu),
                timer: Mutex::new(timer),
                net: Mutex::new(net),
                registry,
                shutdown_code: Mutex::new(None),
                shutdown_cv: Condvar::new(),
            }
        })
    }

    /// `send`: enqueues on the local CPU pipeline — unless `k` is still
    /// awaiting its first dispatch (`result == Undefined`) and carries a
    /// routing flag that means it is meant to leave this node
    /// (upstream/downstream/everywhere/somewhere). The submitter-path
    /// routing decision described in spec §4.4 is made here, at the
    /// `send`/`upstream` boundary, rather than inside a kernel's own
    /// `act()`: a kernel only ever gets `&mut self` there, never
    /// ownership of itself, so it has no way to hand itself to the
    /// socket pipeline even if it wanted to (see
    /// `bsched_kernel::Dispatcher`'s module docs). Once a kernel's
    /// result has gone terminal — every completion/forwarding call this
    /// façade and the pipelines make internally — its routing flags are
    /// leftover history, not a fresh routing instruction, so those calls
    /// fall straight through to the CPU pipeline unchanged.
    pub fn send(&self, k: Box<dyn Kernel>) {
        if k.header().result == ResultCode::Undefined && Self::leaves_this_node(k.header().flags) {
            self.send_remote(k);
        } else {
            self.send_local(k);
        }
    }

    /// `send_local`: unconditionally enqueues on the local CPU pipeline.
    /// See `bsched_kernel::Dispatcher::send_local`.
    pub fn send_local(&self, k: Box<dyn Kernel>) {
        self.cpu.lock_or_panic().submit(k);
    }

    /// `send_remote`: enqueues on the socket pipeline.
    pub fn send_remote(&self, k: Box<dyn Kernel>) {
        self.net.lock_or_panic().submit(k);
    }

    /// `upstream`: sets `child.parent := parent_id`, then sends `child`
    /// through the same routing decision `send` makes.
    pub fn upstream(&self, parent_id: KernelId, mut child: Box<dyn Kernel>) {
        child.header_mut().parent_id = Some(parent_id);
        self.send(child);
    }

    /// A kernel with none of these flags set (e.g. a purely local
    /// supervisor like `bsched_discovery::Prober`) is meant to run its
    /// own `act()` on this node; one flagged to move
    /// upstream/downstream/everywhere/somewhere is meant to leave this
    /// node instead.
    fn leaves_this_node(flags: KernelFlags) -> bool {
        flags.intersects(
            KernelFlags::MOVES_UPSTREAM
                | KernelFlags::MOVES_DOWNSTREAM
                | KernelFlags::MOVES_EVERYWHERE
                | KernelFlags::MOVES_SOMEWHERE,
        )
    }

    /// Grafts an already-running kernel directly into the CPU pipeline's
    /// suspended-principal table, from which a later carries-parent packet
    /// can embed it. See `bsched_kernel::Dispatcher::register_principal`.
    pub fn register_principal(&self, kernel: Box<dyn Kernel>) {
        self.cpu.lock_or_panic().register_principal(kernel);
    }

    /// Removes a suspended principal so the socket pipeline can embed it
    /// into a `CARRIES_PARENT` packet (`upstream`).
    pub fn take_principal(&self, id: KernelId) -> Option<Box<dyn Kernel>> {
        self.cpu.lock_or_panic().take_principal(id)
    }

    /// Schedules `k` on the timer pipeline to fire `after`
    /// from now, forwarded through `send` once it wakes.
    pub fn schedule_after(&self, k: Box<dyn Kernel>, after: Duration) {
        self.timer.lock_or_panic().send_after(k, after);
    }

    /// `commit`: writes a terminal result into `k`'s header
    /// and resubmits it to the CPU pipeline. `CpuPipeline::dispatch_one`'s
    /// existing "result already terminal" branch then performs the
    /// parent/source-based forwarding this operation describes, so
    /// nothing here needs to duplicate that routing logic.
    pub fn commit(&self, mut k: Box<dyn Kernel>, code: ResultCode) {
        k.header_mut().result = code;
        self.send(k);
    }

    /// On a socket-pipeline peer-disconnect for our current principal,
    /// forwards the closed connection's endpoint to
    /// the discovery state machine as an ordinary kernel addressed to its
    /// well-known principal id, so `Discoverer::react` picks it up
    /// through the same generic dispatch rule as everything else it
    /// reacts to. Non-IP endpoints (unix-socket peers) never participate
    /// in discovery and are ignored.
    fn peer_disconnected(&self, endpoint: Endpoint) {
        let Endpoint::Ip(addr) = endpoint else { return };
        let mut event = Box::new(SocketPipelineEvent::disconnected(addr));
        event.header_mut().principal_id = Some(DISCOVERY_PRINCIPAL_ID);
        self.send(event);
    }

    /// `graceful_shutdown`: records the process exit code on
    /// first call (later calls are no-ops) and wakes any thread blocked
    /// in [`Factory::wait`].
    pub fn graceful_shutdown(&self, code: i32) {
        let mut slot = self.shutdown_code.lock_or_panic();
        if slot.is_none() {
            *slot = Some(code);
            self.shutdown_cv.notify_all();
        }
    }

    /// Blocks until `graceful_shutdown` has been called, then stops and
    /// joins every pipeline in the reverse of start-up order,
    /// returning the process exit code.
    pub fn wait(&self) -> i32 {
        let mut slot = self.shutdown_code.lock_or_panic();
        while slot.is_none() {
            slot = self.shutdown_cv.wait(slot).unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        let code = slot.expect("loop only exits once a code is set");
        drop(slot);

        self.net.lock_or_panic().stop();
        self.timer.lock_or_panic().stop();
        self.cpu.lock_or_panic().stop();

        self.net.lock_or_panic().join();
        self.timer.lock_or_panic().join();
        self.cpu.lock_or_panic().join();

        code
    }

    pub fn principal_lookup(&self) -> Arc<dyn PrincipalLookup> {
        self.cpu.lock_or_panic().principal_lookup()
    }

    pub fn registry(&self) -> &Arc<KernelRegistry> {
        &self.registry
    }

    /// A `Dispatcher` handle callers outside any kernel's `act`/`react`
    /// can use to submit a root kernel from ordinary application code.
    /// Holds only a `Weak` back-reference, mirroring every
    /// other dispatcher this façade hands out.
    pub fn dispatcher(self: &Arc<Self>) -> Arc<dyn Dispatcher> {
        Arc::new(FactoryDispatcher(Arc::downgrade(self)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bsched_kernel::EchoKernel;
    use bsched_net::{BindSpec, SocketConfig};
    use std::net::SocketAddr;
    use std::time::Duration as StdDuration;

    fn loopback_config() -> FactoryConfig {
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        FactoryConfig {
            num_cpu_workers: 1,
            socket: SocketConfig {
                binds: vec![BindSpec {
                    bind,
                    ifnet: "127.0.0.0/8".parse().unwrap(),
                }],
                use_localhost: true,
            },
        }
    }

    #[test]
    fn local_root_echo_shuts_down_with_its_own_n() {
        let registry = Arc::new(KernelRegistry::new());
        let factory = Factory::start(loopback_config(), registry);

        factory.send(Box::new(EchoKernel::new(7)));
        let code = factory.wait();
        assert_eq!(code, 7);
    }

    #[test]
    fn commit_routes_a_root_kernel_to_shutdown() {
        let registry = Arc::new(KernelRegistry::new());
        let factory = Factory::start(loopback_config(), registry);

        let echo = Box::new(EchoKernel::new(0));
        factory.commit(echo, ResultCode::Success);
        let code = factory.wait();
        assert_eq!(code, 0);
    }

    #[test]
    fn schedule_after_forwards_once_it_fires() {
        let registry = Arc::new(KernelRegistry::new());
        let factory = Factory::start(loopback_config(), registry);

        factory.schedule_after(Box::new(EchoKernel::new(11)), StdDuration::from_millis(20));
        let code = factory.wait();
        assert_eq!(code, 11);
    }
}
