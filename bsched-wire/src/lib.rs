// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The framed kernel stream and wire packet codec:
//! length-prefixed packets carrying a kernel header plus type-specific
//! payload, with recursive nesting for kernels that carry their parent.

mod addr;
mod error;
mod frame;

pub use addr::{read_endpoint, write_endpoint};
pub use error::WireError;
pub use frame::{FramedStream, MAX_FRAME_LEN};
