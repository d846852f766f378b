// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The socket pipeline: peer connections, routing between
//! listening servers and the rest of the fabric, and the error type for
//! transport/wire failures on this side.

mod error;
mod listener;
mod peer;
mod reactor;

pub use error::NetError;
pub use listener::ListeningServer;
pub use peer::{ConnectionState, PeerConnection, Transport};
pub use reactor::{BindSpec, SocketConfig, SocketPipeline};
