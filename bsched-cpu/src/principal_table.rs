// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Suspended-principal table (grounded on
//! `original_source/src/factory/kernel/act.hh`'s `kernel->principal()`
//! check): a kernel whose `act()` returns without a terminal result is
//! registered here under its own identity so that a later kernel
//! addressed to it by `principal_id` (a local subordinate's reply, or an
//! inbound message like the discovery protocol's `probe`) can be
//! delivered via `react`.
//!
//! Access to one principal's slot is serialized through its own mutex:
//! taking the kernel out of the slot for the duration of `react` means
//! two workers can never call `react` on the same principal concurrently,
//! matching the single-threaded-object assumption the original C++
//! dispatch loop (`act.hh`) relied on even though this pipeline runs a
//! pool of worker threads.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::warn;

use bsched_common::MutexExt;
use bsched_kernel::{Dispatcher, Kernel, KernelFlags, KernelId, PrincipalLookup, ResultCode};

type Slot = Arc<Mutex<Option<Box<dyn Kernel>>>>;

#[derive(Default)]
pub struct PrincipalTable {
    slots: Mutex<HashMap<KernelId, Slot>>,
}

pub enum ReactOutcome {
    /// No principal registered under this id (`no-principal-found`); the
    /// child is handed back for generic terminal handling with that
    /// result code.
    PrincipalMissing(Box<dyn Kernel>),
    /// The principal reacted and remains suspended: still awaiting more
    /// children, a long-lived supervisor like a discovery state machine
    /// that never completes, or one flagged `do-not-delete` that went
    /// terminal anyway and had that completion suppressed.
    StillSuspended,
    /// The principal's own result went terminal as a consequence of this
    /// reaction; it is handed back so the caller can run the generic
    /// commit/forwarding logic on it too.
    PrincipalCompleted(Box<dyn Kernel>),
}

impl PrincipalTable {
    pub fn new() -> Self {
        PrincipalTable::default()
    }

    pub fn suspend(&self, id: KernelId, kernel: Box<dyn Kernel>) {
        self.slots
            .lock_or_panic()
            .insert(id, Arc::new(Mutex::new(Some(kernel))));
    }

    pub fn len(&self) -> usize {
        self.slots.lock_or_panic().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns a suspended principal outright, without
    /// reacting it to anything (used on `upstream`'s carries-parent
    /// path: the principal is about to be embedded whole into a child
    /// kernel bound for another node, so it leaves this table entirely
    /// rather than staying suspended here under an id the remote node is
    /// about to reuse).
    pub fn take(&self, id: KernelId) -> Option<Box<dyn Kernel>> {
        let slot = self.slots.lock_or_panic().remove(&id)?;
        slot.lock_or_panic().take()
    }

    pub fn react(&self, principal_id: KernelId, child: Box<dyn Kernel>, dispatcher: &dyn Dispatcher) -> ReactOutcome {
        let slot = self.slots.lock_or_panic().get(&principal_id).cloned();
        let Some(slot) = slot else {
            return ReactOutcome::PrincipalMissing(child);
        };

        let mut guard = slot.lock_or_panic();
        let Some(mut principal) = guard.take() else {
            // Concurrent react on the same principal should be impossible
            // (the slot mutex serializes it); treat re-entrancy as
            // missing rather than panicking on a production path.
            return ReactOutcome::PrincipalMissing(child);
        };

        // Isolated the same way `act` is: a panicking `react` becomes an
        // `Error` result on the principal rather than taking down the
        // worker thread.
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| principal.react(child, dispatcher))) {
            warn!("kernel react() panicked, treating principal as failed: {panic:?}");
            principal.header_mut().result = ResultCode::Error;
        }

        // `do-not-delete` suppresses the eager cleanup a terminal result
        // would otherwise trigger: the principal stays suspended under its
        // id instead of being handed off for commit, so it keeps reacting
        // to further children rather than being torn down the first time
        // its own result happens to go terminal.
        if principal.header().result.is_terminal() && !principal.header().flags.contains(KernelFlags::DO_NOT_DELETE) {
            drop(guard);
            self.slots.lock_or_panic().remove(&principal_id);
            ReactOutcome::PrincipalCompleted(principal)
        } else {
            *guard = Some(principal);
            ReactOutcome::StillSuspended
        }
    }
}

impl PrincipalLookup for PrincipalTable {
    fn principal_exists(&self, id: KernelId) -> bool {
        self.slots.lock_or_panic().contains_key(&id)
    }
}

/// Helper shared by the generic dispatch fallback: build a
/// `no-principal-found` copy of `child` ready for the normal terminal
/// path.
pub fn mark_no_principal_found(mut child: Box<dyn Kernel>) -> Box<dyn Kernel> {
    child.header_mut().result = ResultCode::NoPrincipalFound;
    child
}
