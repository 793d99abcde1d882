// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Hierarchical task network for accelerator fleet management.
//!
//! Peers form a fixed tree: one controller at the root, agents below it and workers at the
//! leaves. Each peer serves its children over gRPC and holds a single persistent link to its
//! parent. A message is addressed to a [`Position`]; every hop classifies the destination
//! against its own position and either delivers it locally, forwards it to the child that
//! announced a route toward it, or passes it up to its parent. No peer knows the full topology.
//!
//! The application-facing API is [`NetworkInstance`].

pub mod config;
pub mod error;
pub mod frame;
pub mod logging;
pub mod message;
pub mod position;
pub mod routing;

mod admission;
mod downstream;
mod network;
mod pool;
mod upstream;

pub mod proto {
    tonic::include_proto!("tasknet.v1");
}

pub use config::{ConfigError, NetworkConfig, NetworkConfigBuilder};
pub use error::{NetError, NetResult, SendError};
pub use message::{Ack, AckCode, Body, Header, Message, OutboundMessage};
pub use network::{NetworkInstance, NetworkStatus};
pub use position::{BROADCAST_RANK, Position, Role};
pub use routing::{Classification, Origin, classify};
