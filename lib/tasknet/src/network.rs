// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The network instance: one peer of the task network.
//!
//! [`NetworkInstance`] is what the hosting application holds. It frames outgoing messages, owns
//! the local delivery buffer and ties the downstream and upstream endpoints to one
//! [`CancellationToken`]. Every ingress path, whether an application send, a transfer from a
//! child or a frame pushed by the parent, goes through the same [`Router::dispatch`].
//!
//! ```rust,ignore
//! let config = NetworkConfig::builder()
//!     .role(Role::Worker)
//!     .server_rank("3")
//!     .process_rank("0")
//!     .parent_addr("10.0.0.7:9601")
//!     .build()?;
//! let network = NetworkInstance::start(config).await?;
//! let ack = network
//!     .send_sync(OutboundMessage::new(controller, "fault", Body::new("report", "npu 2 down")))
//!     .await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use validator::Validate;

use crate::admission::AdmissionFilter;
use crate::config::NetworkConfig;
use crate::downstream::{DownstreamEndpoint, service};
use crate::error::{NetError, NetResult, SendError};
use crate::frame;
use crate::message::{Ack, Message, OutboundMessage};
use crate::pool::WorkerPool;
use crate::position::Position;
use crate::routing::{Classification, Origin, classify};
use crate::upstream::UpstreamEndpoint;

/// Longest wait for each background component during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Dispatches classified frames to local delivery or to one of the endpoints.
pub(crate) struct Router {
    position: Position,
    local_tx: flume::Sender<Message>,
    deliver_timeout: Duration,
    downstream: Option<Arc<DownstreamEndpoint>>,
    upstream: Option<Arc<UpstreamEndpoint>>,
    destroyed: AtomicBool,
}

impl Router {
    pub fn downstream(&self) -> Option<&Arc<DownstreamEndpoint>> {
        self.downstream.as_ref()
    }

    pub fn upstream(&self) -> Option<&Arc<UpstreamEndpoint>> {
        self.upstream.as_ref()
    }

    /// Classify a normalized frame and route it.
    pub async fn dispatch(&self, message: Message, origin: Origin) -> NetResult<Ack> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(NetError::Shutdown);
        }
        let classification = classify(&self.position, &message.header.dst);
        debug!(
            target: "fleet_tasknet::router",
            uuid = %message.header.uuid,
            dst = %message.header.dst,
            %origin,
            ?classification,
            "routing frame"
        );
        self.route(message, classification, origin).await
    }

    async fn route(
        &self,
        message: Message,
        classification: Classification,
        origin: Origin,
    ) -> NetResult<Ack> {
        match classification {
            Classification::Local => self.deliver_local(message).await,
            Classification::TowardChildren => match &self.downstream {
                Some(downstream) => downstream.send(message).await,
                None => Err(NetError::NoRoute(message.header.dst)),
            },
            // a frame from the parent must never be sent back up
            Classification::TowardParentOrPeers if origin == Origin::FromAbove => {
                Err(NetError::IllegalDestination {
                    dst: message.header.dst,
                    reason: "frame from parent addressed upward",
                })
            }
            Classification::TowardParentOrPeers => match &self.upstream {
                Some(upstream) => upstream.send(message).await,
                None => Err(NetError::NoRoute(message.header.dst)),
            },
            Classification::Illegal => Err(NetError::frame(format!(
                "{} is not a valid destination from {}",
                message.header.dst, self.position
            ))),
        }
    }

    async fn deliver_local(&self, message: Message) -> NetResult<Ack> {
        let uuid = message.header.uuid.clone();
        match tokio::time::timeout(self.deliver_timeout, self.local_tx.send_async(message)).await {
            Ok(Ok(())) => Ok(Ack::ok(uuid, self.position.clone())),
            Ok(Err(_)) => Err(NetError::Shutdown),
            Err(_) => Err(NetError::ReceiverBusy),
        }
    }
}

/// Point-in-time view of a network instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkStatus {
    pub position: Position,
    pub listen_addr: Option<SocketAddr>,
    /// None when the instance has no parent.
    pub upstream_ready: Option<bool>,
    pub children: Vec<Position>,
    pub routes: usize,
    pub shut_down: bool,
}

pub struct NetworkInstance {
    router: Arc<Router>,
    inbox: flume::Receiver<Message>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    pool: WorkerPool,
    local_addr: Option<SocketAddr>,
    server: Mutex<Option<JoinHandle<anyhow::Result<()>>>>,
}

impl NetworkInstance {
    /// Validate `config`, bind the listener (if any) and start joining the parent (if any).
    ///
    /// Returns once the listener is serving. Joining the parent continues in the background;
    /// use [`ready`](Self::ready) to wait for it.
    pub async fn start(config: NetworkConfig) -> anyhow::Result<Self> {
        config
            .validate()
            .context("invalid network configuration")?;
        let position = config.position();

        let listener = match config.listen_addr {
            Some(addr) => Some(
                TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("failed to bind {addr}"))?,
            ),
            None => None,
        };
        let local_addr = listener
            .as_ref()
            .map(TcpListener::local_addr)
            .transpose()
            .context("listener has no local address")?;

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let pool = WorkerPool::new(config.pool_size());
        let (local_tx, inbox) = flume::bounded(config.recv_buffer());

        let router = Arc::new_cyclic(|weak| {
            let downstream = listener.as_ref().map(|_| {
                Arc::new(DownstreamEndpoint::new(
                    position.clone(),
                    config.max_children,
                    config.ack_timeout(),
                    cancel.child_token(),
                    pool.clone(),
                    tracker.clone(),
                    weak.clone(),
                ))
            });
            let upstream = config.parent_addr.as_deref().map(|parent| {
                Arc::new(UpstreamEndpoint::new(
                    position.clone(),
                    parent,
                    config.ack_timeout(),
                    config.retry_delay(),
                    cancel.child_token(),
                    tracker.clone(),
                    weak.clone(),
                ))
            });
            Router {
                position: position.clone(),
                local_tx,
                deliver_timeout: config.deliver_timeout(),
                downstream,
                upstream,
                destroyed: AtomicBool::new(false),
            }
        });

        let server = match (listener, router.downstream.clone()) {
            (Some(listener), Some(downstream)) => Some(tokio::spawn(service::serve(
                listener,
                downstream,
                AdmissionFilter::new(config.admission_rate, config.admission_burst),
                cancel.child_token(),
            ))),
            _ => None,
        };
        if let Some(upstream) = &router.upstream {
            upstream.start();
        }

        info!(
            target: "fleet_tasknet::network",
            %position,
            listen = ?local_addr,
            parent = ?config.parent_addr,
            "network instance started"
        );

        Ok(Self {
            router,
            inbox,
            cancel,
            tracker,
            pool,
            local_addr,
            server: Mutex::new(server),
        })
    }

    pub fn position(&self) -> &Position {
        &self.router.position
    }

    /// Address children connect to, with the actual port when an ephemeral one was requested.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Send and wait for the destination's ack.
    pub async fn send_sync(&self, message: OutboundMessage) -> Result<Ack, SendError> {
        self.send(message, true).await
    }

    /// Send and return once the first hop has accepted the frame.
    pub async fn send_async(&self, message: OutboundMessage) -> Result<Ack, SendError> {
        self.send(message, false).await
    }

    async fn send(&self, outbound: OutboundMessage, sync: bool) -> Result<Ack, SendError> {
        let uuid = outbound.uuid.clone();
        let position = self.position().clone();
        let message = outbound.into_message(position.clone(), sync);
        let message = match frame::normalize(message) {
            Ok(message) => message,
            Err(e) => return Err(SendError::new(e, uuid, position)),
        };

        let uuid = message.header.uuid.clone();
        self.router
            .dispatch(message, Origin::Local)
            .await
            .map_err(|e| SendError::new(e, uuid, position))
    }

    /// Next message addressed to this peer, or None once the instance is shut down.
    pub async fn receive(&self) -> Option<Message> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            message = self.inbox.recv_async() => message.ok(),
        }
    }

    /// Wait until the link to the parent is ready. Returns false if the instance shuts down first.
    ///
    /// Instances without a parent are ready immediately.
    pub async fn ready(&self) -> bool {
        let Some(upstream) = &self.router.upstream else {
            return !self.cancel.is_cancelled();
        };
        let mut ready = upstream.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            ready = ready.wait_for(|ready| *ready) => ready.is_ok(),
        }
    }

    pub fn status(&self) -> NetworkStatus {
        let downstream = self.router.downstream.as_ref();
        NetworkStatus {
            position: self.position().clone(),
            listen_addr: self.local_addr,
            upstream_ready: self.router.upstream.as_ref().map(|upstream| upstream.is_ready()),
            children: downstream.map(|d| d.children()).unwrap_or_default(),
            routes: downstream.map(|d| d.route_count()).unwrap_or_default(),
            shut_down: self.router.destroyed.load(Ordering::Acquire),
        }
    }

    /// Stop every component. Later calls return immediately.
    pub async fn shutdown(&self) {
        if self.router.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(target: "fleet_tasknet::network", position = %self.position(), "shutting down");

        self.pool.stop();
        self.cancel.cancel();

        if let Some(upstream) = &self.router.upstream {
            upstream.close().await;
        }
        if let Some(downstream) = &self.router.downstream {
            downstream.close();
        }

        let server = self.server.lock().take();
        if let Some(server) = server {
            match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!(target: "fleet_tasknet::network", "server exited with error: {e:#}"),
                Ok(Err(e)) => warn!(target: "fleet_tasknet::network", "server task failed: {e}"),
                Err(_) => warn!(target: "fleet_tasknet::network", "server did not stop within {SHUTDOWN_GRACE:?}"),
            }
        }

        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, async {
            self.tracker.wait().await;
            self.pool.wait().await;
        })
        .await
        .is_err()
        {
            warn!(target: "fleet_tasknet::network", "background tasks still running after {SHUTDOWN_GRACE:?}");
        }
        info!(target: "fleet_tasknet::network", position = %self.position(), "shut down");
    }
}

impl Drop for NetworkInstance {
    fn drop(&mut self) {
        self.router.destroyed.store(true, Ordering::Release);
        self.pool.stop();
        self.cancel.cancel();
    }
}
