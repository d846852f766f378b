// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Principal-id -> live kernel lookup used by the socket pipeline's
//! receive path: look up the principal in the local instance registry;
//! if missing, set result no-principal-found.
//!
//! Holds `Weak` references only: a kernel's canonical owner is always a
//! pipeline queue or send-buffer, never this registry.

use std::collections::HashMap;
use std::sync::{Mutex, Weak};

use crate::id::KernelId;
use bsched_common::MutexExt;

pub struct InstanceRegistry<T> {
    inner: Mutex<HashMap<KernelId, Weak<T>>>,
}

impl<T> Default for InstanceRegistry<T> {
    fn default() -> Self {
        InstanceRegistry {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> InstanceRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: KernelId, handle: Weak<T>) {
        self.inner.lock_or_panic().insert(id, handle);
    }

    pub fn remove(&self, id: KernelId) {
        self.inner.lock_or_panic().remove(&id);
    }

    /// Looks up `id`, pruning the entry if its referent has already been
    /// dropped (the registry does not keep anything alive).
    pub fn lookup(&self, id: KernelId) -> Option<std::sync::Arc<T>> {
        let mut inner = self.inner.lock_or_panic();
        match inner.get(&id).and_then(Weak::upgrade) {
            Some(strong) => Some(strong),
            None => {
                inner.remove(&id);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock_or_panic().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
