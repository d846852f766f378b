// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The timer pipeline: a single thread over a min-heap
//! keyed by each kernel's scheduled wake time. `std::collections::BinaryHeap`
//! is a max-heap, so the `Ord` impl below reverses the comparison — the
//! direct analogue of `original_source/src/factory/ppl/compare_time.hh`'s
//! small time-comparator, expressed here as an `Ord` impl on a
//! tuple-struct rather than a free comparator function. The timer and
//! socket pipelines use `std::sync::{Mutex, Condvar}` / `mio::Poll`
//! directly rather than `crossbeam_channel`, because both need an
//! explicit deadline/poll-driven wakeup that a plain channel `recv()`
//! can't express.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::trace;

use bsched_common::MutexExt;
use bsched_kernel::{Dispatcher, Kernel};

struct TimerEntry {
    at: Instant,
    seq: u64,
    kernel: Box<dyn Kernel>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) yields the earliest
        // deadline first; `seq` breaks ties in submission order.
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    running: bool,
}

pub struct TimerPipeline {
    state: Arc<Mutex<TimerState>>,
    cv: Arc<Condvar>,
    seq: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl TimerPipeline {
    pub fn start(dispatcher: Arc<dyn Dispatcher>) -> Self {
        let state = Arc::new(Mutex::new(TimerState {
            heap: BinaryHeap::new(),
            running: true,
        }));
        let cv = Arc::new(Condvar::new());
        let seq = Arc::new(AtomicU64::new(0));

        let worker_state = Arc::clone(&state);
        let worker_cv = Arc::clone(&cv);
        let worker = std::thread::Builder::new()
            .name("bsched-timer".to_string())
            .spawn(move || worker_loop(worker_state, worker_cv, dispatcher))
            .expect("failed to spawn timer pipeline thread");

        TimerPipeline {
            state,
            cv,
            seq,
            worker: Some(worker),
        }
    }

    /// Schedules `k` to wake at an absolute instant.
    pub fn send_at(&self, k: Box<dyn Kernel>, at: Instant) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        let mut state = self.state.lock_or_panic();
        state.heap.push(TimerEntry { at, seq, kernel: k });
        drop(state);
        self.cv.notify_one();
    }

    /// Schedules `k` to wake `after` from now.
    pub fn send_after(&self, k: Box<dyn Kernel>, after: Duration) {
        self.send_at(k, Instant::now() + after);
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock_or_panic().heap.len()
    }

    /// Stops the worker: remaining kernels are leaked
    /// (never delivered), which is acceptable at process exit.
    pub fn stop(&mut self) {
        {
            let mut state = self.state.lock_or_panic();
            state.running = false;
        }
        self.cv.notify_all();
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TimerPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(state: Arc<Mutex<TimerState>>, cv: Arc<Condvar>, dispatcher: Arc<dyn Dispatcher>) {
    loop {
        let mut guard = state.lock_or_panic();
        loop {
            if !guard.running {
                return;
            }
            match guard.heap.peek() {
                None => {
                    guard = cv.wait(guard).unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some(top) => {
                    let now = Instant::now();
                    if top.at <= now {
                        break;
                    }
                    let timeout = top.at - now;
                    let (next_guard, _timeout_result) =
                        cv.wait_timeout(guard, timeout).unwrap_or_else(|poisoned| poisoned.into_inner());
                    guard = next_guard;
                }
            }
        }

        let entry = guard.heap.pop().expect("peeked an entry just above");
        drop(guard);

        trace!(identity = %entry.kernel.header().identity, "timer fired, forwarding to dispatch");
        // A woken kernel is removed and forwarded to the CPU pipeline via
        // the standard dispatch path.
        dispatcher.send(entry.kernel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bsched_kernel::{EchoKernel, Kernel as _, KernelHeader, KernelId};
    use std::sync::Mutex as StdMutex;

    struct RecordingDispatcher {
        fired: StdMutex<Vec<u32>>,
    }

    impl Dispatcher for RecordingDispatcher {
        fn send(&self, k: Box<dyn Kernel>) {
            if let Some(echo) = k.as_any().downcast_ref::<EchoKernel>() {
                self.fired.lock().unwrap().push(echo.n);
            }
        }
        fn send_local(&self, k: Box<dyn Kernel>) {
            self.send(k);
        }
        fn send_remote(&self, _k: Box<dyn Kernel>) {}
        fn upstream(&self, _parent_id: KernelId, _child: Box<dyn Kernel>) {}
        fn register_principal(&self, _k: Box<dyn Kernel>) {}
        fn schedule_after(&self, _k: Box<dyn Kernel>, _after: std::time::Duration) {}
        fn peer_disconnected(&self, _endpoint: bsched_kernel::Endpoint) {}
        fn graceful_shutdown(&self, _code: i32) {}
    }

    #[test]
    fn fires_in_deadline_order_even_when_submitted_out_of_order() {
        let dispatcher = Arc::new(RecordingDispatcher {
            fired: StdMutex::new(Vec::new()),
        });
        let mut timers = TimerPipeline::start(dispatcher.clone() as Arc<dyn Dispatcher>);

        let base = Instant::now() + Duration::from_millis(50);
        timers.send_at(Box::new(EchoKernel::new(3)), base + Duration::from_millis(30));
        timers.send_at(Box::new(EchoKernel::new(1)), base);
        timers.send_at(Box::new(EchoKernel::new(2)), base + Duration::from_millis(10));

        std::thread::sleep(Duration::from_millis(200));
        timers.stop();
        timers.join();

        assert_eq!(*dispatcher.fired.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn stop_leaks_remaining_kernels_without_panicking() {
        let dispatcher = Arc::new(RecordingDispatcher {
            fired: StdMutex::new(Vec::new()),
        });
        let mut timers = TimerPipeline::start(dispatcher.clone() as Arc<dyn Dispatcher>);
        timers.send_after(Box::new(EchoKernel::new(99)), Duration::from_secs(60));
        assert_eq!(timers.pending_count(), 1);
        timers.stop();
        timers.join();
        assert!(dispatcher.fired.lock().unwrap().is_empty());
    }

    #[test]
    fn header_default_has_no_scheduling_leak() {
        // Sanity: constructing a kernel doesn't itself touch the timer.
        let k = EchoKernel::new(1);
        assert_eq!(k.header().identity, KernelId::UNASSIGNED);
        let _ = KernelHeader::default();
    }
}
