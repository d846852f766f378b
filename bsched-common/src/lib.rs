// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ambient utilities shared by every bscheduler crate: a poison-panicking
//! mutex helper, logging setup, and the peer-cache file format.

pub mod log;
pub mod peer_cache;

use std::sync::{Mutex, MutexGuard};

/// Extension trait for `Mutex` that panics on a poisoned lock instead of
/// threading `Result` through every call site.
///
/// Every lock in this workspace is held only across a short critical
/// section (never across a blocking I/O call), so poisoning means a prior
/// critical section panicked with the lock held — a bug worth crashing
/// loudly on rather than silently tolerating.
pub trait MutexExt<T> {
    fn lock_or_panic(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[inline(always)]
    #[track_caller]
    fn lock_or_panic(&self) -> MutexGuard<'_, T> {
        #[allow(clippy::unwrap_used)]
        self.lock().unwrap()
    }
}
