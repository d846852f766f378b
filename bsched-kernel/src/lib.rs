// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The kernel entity: identity, flags, result codes, the dispatcher
//! interface kernels use to talk back to the runtime, and the process-wide
//! type registry that maps wire type-ids to readers.

mod dispatcher;
mod echo;
mod endpoint;
mod flags;
mod id;
mod instance_registry;
mod kernel;
mod principal_lookup;
mod registry;
mod result;

pub use dispatcher::Dispatcher;
pub use echo::{read_echo_kernel, EchoKernel, ECHO_KERNEL_WIRE_TYPE};
pub use endpoint::{Endpoint, VirtualAddress};
pub use flags::KernelFlags;
pub use id::{IdGenerator, KernelId};
pub use instance_registry::InstanceRegistry;
pub use kernel::{Kernel, KernelHeader, KernelReaderFn};
pub use principal_lookup::PrincipalLookup;
pub use registry::{KernelReader, KernelRegistry, RegistryError, TypeDescriptor, WireTypeId};
pub use result::ResultCode;
