// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Client side of a peer: the single link to its parent.
//!
//! One supervisor task owns the link lifecycle. Each cycle joins the parent (channel plus
//! `Register`), announces routes, opens the persistent stream and then runs the receive loop
//! until the stream fails or a reset is requested. Only while a cycle is in its receive loop is
//! the endpoint ready; sends issued at any other time fail with `ServerNotReady`.
//!
//! Resets are requested by cancelling the scope of the current link. Requests carry the link
//! generation they observed, so a failure seen on an old link cannot tear down its successor.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Response, Status, Streaming};
use tracing::{debug, info, trace, warn};

use crate::error::{NetError, NetResult};
use crate::frame;
use crate::message::{Ack, Message, frame_identity};
use crate::network::Router;
use crate::position::{Position, insert_identity};
use crate::proto::{self, task_net_client::TaskNetClient};
use crate::routing::Origin;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Acks queued toward the parent before the receive loop waits.
const ACK_BUFFER: usize = 64;

/// Join attempts between repeated warnings while the parent is unreachable.
const WARN_EVERY: u64 = 30;

#[derive(Clone)]
struct Link {
    generation: u64,
    client: TaskNetClient<Channel>,
    scope: CancellationToken,
}

/// A stream opened by a successful rebuild.
struct Attached {
    generation: u64,
    scope: CancellationToken,
    inbound: Streaming<proto::Message>,
    acks: mpsc::Sender<proto::Ack>,
}

pub(crate) struct UpstreamEndpoint {
    position: Position,
    parent_addr: String,
    ack_timeout: Duration,
    retry_delay: Duration,
    scope: CancellationToken,
    link: RwLock<Option<Link>>,
    generation: AtomicU64,
    ready: watch::Sender<bool>,
    tracker: TaskTracker,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    router: Weak<Router>,
}

impl UpstreamEndpoint {
    pub fn new(
        position: Position,
        parent_addr: &str,
        ack_timeout: Duration,
        retry_delay: Duration,
        scope: CancellationToken,
        tracker: TaskTracker,
        router: Weak<Router>,
    ) -> Self {
        let parent_addr = parent_addr.trim();
        let parent_addr = if parent_addr.contains("://") {
            parent_addr.to_string()
        } else {
            format!("http://{parent_addr}")
        };
        Self {
            position,
            parent_addr,
            ack_timeout,
            retry_delay,
            scope,
            link: RwLock::new(None),
            generation: AtomicU64::new(0),
            ready: watch::Sender::new(false),
            tracker,
            supervisor: Mutex::new(None),
            router,
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    /// Launch the supervisor. Later calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_none() {
            *supervisor = Some(tokio::spawn(self.clone().supervise()));
        }
    }

    /// Stop the supervisor and drop the link.
    pub async fn close(&self) {
        self.scope.cancel();
        self.reset();
        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            if tokio::time::timeout(self.ack_timeout, supervisor).await.is_err() {
                warn!(target: "fleet_tasknet::upstream", "supervisor did not stop in time");
            }
        }
    }

    /// Send `message` to the parent.
    ///
    /// Synchronous messages return the parent's ack. Asynchronous messages are handed to a
    /// background task and acknowledged locally.
    pub async fn send(self: &Arc<Self>, message: Message) -> NetResult<Ack> {
        let link = self.current_link()?;
        if message.header.sync {
            return self.transfer(link, message).await;
        }

        let uuid = message.header.uuid.clone();
        let endpoint = self.clone();
        self.tracker.spawn(async move {
            let uuid = message.header.uuid.clone();
            if let Err(e) = endpoint.transfer(link, message).await {
                debug!(target: "fleet_tasknet::upstream", %uuid, code = %e.code(), "async transfer failed: {e}");
            }
        });
        Ok(Ack::ok(uuid, self.position.clone()))
    }

    /// Relay a route announcement from a child.
    pub async fn discover(&self, proxy: Position, path: Vec<Position>) -> NetResult<Ack> {
        let Link {
            generation,
            mut client,
            ..
        } = self.current_link()?;
        let request = route_request(proxy, path);
        let result = self.unary("", client.discover_route(Request::new(request))).await;
        if matches!(result, Err(NetError::SendLost { .. })) {
            self.request_reset(generation);
        }
        result
    }

    fn current_link(&self) -> NetResult<Link> {
        if !self.is_ready() {
            return Err(NetError::NotReady("upstream link"));
        }
        self.link
            .read()
            .clone()
            .ok_or(NetError::NotReady("upstream link"))
    }

    async fn transfer(&self, link: Link, message: Message) -> NetResult<Ack> {
        let Link {
            generation,
            mut client,
            ..
        } = link;
        let uuid = message.header.uuid.clone();
        let result = self
            .unary(&uuid, client.transfer_message(Request::new(message.into())))
            .await;
        if matches!(result, Err(NetError::SendLost { .. })) {
            self.request_reset(generation);
        }
        result
    }

    /// Run one unary call bounded by the ack timeout and the endpoint scope.
    async fn unary<F>(&self, uuid: &str, call: F) -> NetResult<Ack>
    where
        F: Future<Output = Result<Response<proto::Ack>, Status>>,
    {
        let response = tokio::select! {
            _ = self.scope.cancelled() => return Err(NetError::Shutdown),
            response = tokio::time::timeout(self.ack_timeout, call) => response,
        };
        match response {
            Err(_) => Err(NetError::AckTimeout {
                uuid: uuid.to_string(),
                target: self.parent_addr.clone(),
                timeout: self.ack_timeout,
            }),
            Ok(Err(status)) => Err(self.status_error(status)),
            Ok(Ok(response)) => Ack::try_from(response.into_inner())?.into_result(),
        }
    }

    fn status_error(&self, status: Status) -> NetError {
        match status.code() {
            Code::ResourceExhausted => NetError::AdmissionDenied,
            // a frame over the size limit is refused by either codec; the link itself is fine
            Code::OutOfRange => NetError::frame(status.message()),
            _ => NetError::send_lost(&self.parent_addr, status.message()),
        }
    }

    /// Tear down the link observed at `generation`, if it is still current.
    fn request_reset(&self, generation: u64) {
        let link = self.link.read();
        if let Some(link) = link.as_ref().filter(|link| link.generation == generation) {
            debug!(target: "fleet_tasknet::upstream", generation, "link reset requested");
            link.scope.cancel();
        }
    }

    fn reset(&self) {
        self.ready.send_replace(false);
        if let Some(link) = self.link.write().take() {
            link.scope.cancel();
        }
    }

    /// Sleep for the retry delay. Returns true if the endpoint was closed meanwhile.
    async fn pause(&self) -> bool {
        tokio::select! {
            _ = self.scope.cancelled() => true,
            _ = tokio::time::sleep(self.retry_delay) => false,
        }
    }

    async fn supervise(self: Arc<Self>) {
        info!(target: "fleet_tasknet::upstream", position = %self.position, parent = %self.parent_addr, "upstream supervisor started");
        while let Some(attached) = self.rebuild().await {
            let generation = attached.generation;
            self.receive_loop(attached).await;
            self.reset();
            if self.scope.is_cancelled() {
                break;
            }
            warn!(target: "fleet_tasknet::upstream", generation, parent = %self.parent_addr, "link to parent lost, rebuilding");
            if self.pause().await {
                break;
            }
        }
        self.reset();
        info!(target: "fleet_tasknet::upstream", position = %self.position, "upstream supervisor stopped");
    }

    /// Join, announce and attach. Returns None once the endpoint is closed.
    async fn rebuild(&self) -> Option<Attached> {
        self.reset();
        loop {
            let mut client = self.join().await?;
            let attached = match self.announce(&mut client).await {
                Ok(()) => self.open_stream(&mut client).await,
                Err(e) => Err(e),
            };
            match attached {
                Ok((inbound, acks)) => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                    let scope = self.scope.child_token();
                    *self.link.write() = Some(Link {
                        generation,
                        client,
                        scope: scope.clone(),
                    });
                    self.ready.send_replace(true);
                    info!(target: "fleet_tasknet::upstream", generation, parent = %self.parent_addr, "link to parent ready");
                    return Some(Attached {
                        generation,
                        scope,
                        inbound,
                        acks,
                    });
                }
                Err(NetError::Shutdown) => return None,
                Err(e) => {
                    warn!(target: "fleet_tasknet::upstream", parent = %self.parent_addr, "link setup failed: {e}");
                    if self.pause().await {
                        return None;
                    }
                }
            }
        }
    }

    /// Connect and register, retrying until it succeeds or the endpoint closes.
    async fn join(&self) -> Option<TaskNetClient<Channel>> {
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            match self.try_join().await {
                Ok(client) => {
                    info!(target: "fleet_tasknet::upstream", parent = %self.parent_addr, attempt, "registered with parent");
                    return Some(client);
                }
                Err(NetError::Shutdown) => return None,
                Err(e) if attempt == 1 || attempt % WARN_EVERY == 0 => {
                    warn!(target: "fleet_tasknet::upstream", parent = %self.parent_addr, attempt, "join failed: {e}");
                }
                Err(e) => {
                    debug!(target: "fleet_tasknet::upstream", parent = %self.parent_addr, attempt, "join failed: {e}");
                }
            }
            if self.pause().await {
                return None;
            }
        }
    }

    async fn try_join(&self) -> NetResult<TaskNetClient<Channel>> {
        let endpoint = Endpoint::from_shared(self.parent_addr.clone())
            .map_err(|e| NetError::send_lost(&self.parent_addr, e))?
            .tcp_nodelay(true)
            .connect_timeout(CONNECT_TIMEOUT);
        let channel = tokio::select! {
            _ = self.scope.cancelled() => return Err(NetError::Shutdown),
            channel = endpoint.connect() => channel.map_err(|e| NetError::send_lost(&self.parent_addr, e))?,
        };

        let mut client = TaskNetClient::new(channel)
            .max_decoding_message_size(frame::MAX_FRAME_LEN)
            .max_encoding_message_size(frame::MAX_FRAME_LEN);
        self.unary(
            "",
            client.register(Request::new(self.position.clone().into())),
        )
        .await?;
        Ok(client)
    }

    /// Announce this peer's reachable positions to the parent.
    ///
    /// A leaf retries its own announcement until the parent accepts it; a transport failure
    /// aborts the cycle instead. A non-leaf re-announces every descendant it still routes to,
    /// one attempt each.
    async fn announce(&self, client: &mut TaskNetClient<Channel>) -> NetResult<()> {
        if self.position.role.is_leaf() {
            loop {
                let request = route_request(self.position.clone(), vec![self.position.clone()]);
                match self.unary("", client.discover_route(Request::new(request))).await {
                    Ok(_) => {
                        debug!(target: "fleet_tasknet::upstream", parent = %self.parent_addr, "route announced");
                        return Ok(());
                    }
                    Err(e @ (NetError::Shutdown | NetError::SendLost { .. })) => return Err(e),
                    Err(e) => {
                        debug!(target: "fleet_tasknet::upstream", code = %e.code(), "route announcement refused: {e}");
                    }
                }
                if self.pause().await {
                    return Err(NetError::Shutdown);
                }
            }
        }

        let descendants: Vec<Position> = self
            .router
            .upgrade()
            .and_then(|router| router.downstream().map(|downstream| downstream.routes()))
            .unwrap_or_default()
            .into_iter()
            .map(|(dest, _)| dest)
            .collect();
        for dest in descendants {
            let request = route_request(
                self.position.clone(),
                vec![dest.clone(), self.position.clone()],
            );
            match self.unary("", client.discover_route(Request::new(request))).await {
                Ok(_) => trace!(target: "fleet_tasknet::upstream", %dest, "route re-announced"),
                Err(NetError::Shutdown) => return Err(NetError::Shutdown),
                Err(e) => debug!(target: "fleet_tasknet::upstream", %dest, "route re-announcement failed: {e}"),
            }
        }
        Ok(())
    }

    async fn open_stream(
        &self,
        client: &mut TaskNetClient<Channel>,
    ) -> NetResult<(Streaming<proto::Message>, mpsc::Sender<proto::Ack>)> {
        let (acks, acks_rx) = mpsc::channel(ACK_BUFFER);
        let mut request = Request::new(ReceiverStream::new(acks_rx));
        insert_identity(request.metadata_mut(), &self.position)?;

        let response = tokio::select! {
            _ = self.scope.cancelled() => return Err(NetError::Shutdown),
            response = tokio::time::timeout(self.ack_timeout, client.attach_stream(request)) => response,
        };
        match response {
            Ok(Ok(response)) => Ok((response.into_inner(), acks)),
            Ok(Err(status)) => Err(self.status_error(status)),
            Err(_) => Err(NetError::send_lost(&self.parent_addr, "stream open timed out")),
        }
    }

    /// Route every frame the parent pushes down until the link fails or is reset.
    async fn receive_loop(&self, attached: Attached) {
        let Attached {
            generation,
            scope,
            mut inbound,
            acks,
        } = attached;

        loop {
            let frame = tokio::select! {
                biased;
                _ = scope.cancelled() => break,
                frame = inbound.message() => frame,
            };
            let raw = match frame {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    info!(target: "fleet_tasknet::upstream", generation, "parent closed the stream");
                    break;
                }
                Err(status) => {
                    warn!(target: "fleet_tasknet::upstream", generation, "stream from parent failed: {status}");
                    break;
                }
            };

            let (uuid, sync) = frame_identity(&raw);
            let Some(router) = self.router.upgrade() else {
                break;
            };
            let result = match Message::try_from(raw).and_then(frame::normalize) {
                Ok(message) => router.dispatch(message, Origin::FromAbove).await,
                Err(e) => Err(e),
            };
            let ack = result.unwrap_or_else(|e| {
                debug!(target: "fleet_tasknet::upstream", %uuid, code = %e.code(), "frame from parent failed: {e}");
                e.to_ack(uuid, self.position.clone())
            });

            if sync && !self.return_ack(&acks, ack).await {
                warn!(target: "fleet_tasknet::upstream", generation, "failed to return ack to parent");
                break;
            }
        }
    }

    /// Queue `ack` toward the parent within the ack timeout. False means the stream is unusable.
    async fn return_ack(&self, acks: &mpsc::Sender<proto::Ack>, ack: Ack) -> bool {
        let sent = tokio::time::timeout(self.ack_timeout, acks.send(ack.into())).await;
        matches!(sent, Ok(Ok(())))
    }
}

fn route_request(proxy: Position, path: Vec<Position>) -> proto::RouteRequest {
    proto::RouteRequest {
        proxy: Some(proxy.into()),
        path: path.into_iter().map(Into::into).collect(),
    }
}
