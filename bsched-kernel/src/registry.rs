// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide kernel type registry: maps a stable
//! wire type-id to a reader function that deserializes that kernel's
//! payload, and supports lookup by runtime type for the local
//! serialization path.

use std::any::TypeId;
use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use crate::kernel::{Kernel, KernelHeader, KernelReaderFn};

pub type WireTypeId = u32;

/// Reader function for a registered kernel type: given the already-decoded
/// header and the remaining payload bytes, reconstructs the kernel.
pub type KernelReader = KernelReaderFn;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("kernel type-id {0} is already registered")]
    DuplicateId(WireTypeId),
    #[error("runtime type is already registered under a different id")]
    DuplicateRuntimeType,
    #[error("no kernel type registered for wire id {0}")]
    UnknownType(WireTypeId),
}

#[derive(Clone, Copy)]
pub struct TypeDescriptor {
    pub id: WireTypeId,
    pub reader: KernelReader,
}

impl std::fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeDescriptor").field("id", &self.id).finish()
    }
}

/// Maps wire type-ids and runtime `TypeId`s to [`TypeDescriptor`]s.
/// Registration happens once at daemon start-up — the registry is
/// write-only during start-up and read-only thereafter; after that point
/// lookups only ever read.
#[derive(Default)]
pub struct KernelRegistry {
    inner: RwLock<Inner>,
    next_auto_id: AtomicU32,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<WireTypeId, TypeDescriptor>,
    by_runtime_type: HashMap<TypeId, WireTypeId>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        KernelRegistry {
            inner: RwLock::new(Inner::default()),
            next_auto_id: AtomicU32::new(1 << 20),
        }
    }

    /// Registers `T` under `id` (or an auto-generated id if `id` is
    /// `None`, drawn from a monotonic counter). Rejects a
    /// conflicting id or a runtime type already registered under a
    /// different id, leaving the registry unmodified on failure.
    pub fn register<T: 'static>(
        &self,
        id: Option<WireTypeId>,
        reader: KernelReader,
    ) -> Result<WireTypeId, RegistryError> {
        let type_id = TypeId::of::<T>();
        let mut inner = self.inner.write().expect("registry lock poisoned");

        if inner.by_runtime_type.contains_key(&type_id) {
            return Err(RegistryError::DuplicateRuntimeType);
        }

        let resolved_id = id.unwrap_or_else(|| self.next_auto_id.fetch_add(1, Ordering::Relaxed));

        if inner.by_id.contains_key(&resolved_id) {
            return Err(RegistryError::DuplicateId(resolved_id));
        }

        inner.by_id.insert(
            resolved_id,
            TypeDescriptor {
                id: resolved_id,
                reader,
            },
        );
        inner.by_runtime_type.insert(type_id, resolved_id);
        Ok(resolved_id)
    }

    pub fn lookup_by_id(&self, id: WireTypeId) -> Option<TypeDescriptor> {
        self.inner.read().expect("registry lock poisoned").by_id.get(&id).copied()
    }

    pub fn lookup_by_runtime_type(&self, type_id: TypeId) -> Option<TypeDescriptor> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let id = *inner.by_runtime_type.get(&type_id)?;
        inner.by_id.get(&id).copied()
    }

    /// Reads a kernel whose type-id and header have already been decoded
    /// by the framed stream.
    pub fn read_object(
        &self,
        id: WireTypeId,
        header: KernelHeader,
        input: &mut dyn Read,
    ) -> Result<Box<dyn Kernel>, RegistryError> {
        let descriptor = self.lookup_by_id(id).ok_or(RegistryError::UnknownType(id))?;
        (descriptor.reader)(header, input).map_err(|_| RegistryError::UnknownType(id))
    }
}
