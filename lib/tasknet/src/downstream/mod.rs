// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Server side of a peer: the children registered below it.
//!
//! The endpoint owns two tables. The peer table binds each registered child to its live
//! [`PeerEntry`]; the [`RouteTable`] maps every descendant learned through route discovery to
//! the child leading toward it. Routes only ever point at registered children: a child whose
//! stream ends on its own is evicted together with every route through it.

mod entry;
mod routes;
pub(crate) mod service;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::Status;
use tracing::{debug, info, warn};

use crate::error::{NetError, NetResult};
use crate::message::{Ack, AckCode, Message};
use crate::network::Router;
use crate::pool::WorkerPool;
use crate::position::Position;
use crate::proto;

use entry::{OutboundFrame, PeerEntry};
use routes::RouteTable;

/// Frames queued toward one child before senders wait.
const STREAM_BUFFER: usize = 64;

pub(crate) type OutboundStream = Pin<Box<dyn Stream<Item = OutboundFrame> + Send>>;

pub(crate) struct DownstreamEndpoint {
    position: Position,
    max_children: usize,
    ack_timeout: Duration,
    scope: CancellationToken,
    peers: RwLock<HashMap<Position, Arc<PeerEntry>>>,
    routes: RouteTable,
    generation: AtomicU64,
    pool: WorkerPool,
    tracker: TaskTracker,
    router: Weak<Router>,
}

impl DownstreamEndpoint {
    pub fn new(
        position: Position,
        max_children: usize,
        ack_timeout: Duration,
        scope: CancellationToken,
        pool: WorkerPool,
        tracker: TaskTracker,
        router: Weak<Router>,
    ) -> Self {
        Self {
            position,
            max_children,
            ack_timeout,
            scope,
            peers: RwLock::new(HashMap::new()),
            routes: RouteTable::default(),
            generation: AtomicU64::new(0),
            pool,
            tracker,
            router,
        }
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub(crate) fn router(&self) -> NetResult<Arc<Router>> {
        self.router.upgrade().ok_or(NetError::Shutdown)
    }

    /// Claim the slot for `child`, revoking any connection it already had.
    pub fn register(&self, child: Position) -> NetResult<Ack> {
        let child = self.checked_child(child)?;
        if self.scope.is_cancelled() {
            return Err(NetError::Shutdown);
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = Arc::new(PeerEntry::new(
            child.clone(),
            generation,
            self.scope.child_token(),
        ));

        let previous = {
            let mut peers = self.peers.write();
            if !peers.contains_key(&child) && peers.len() >= self.max_children {
                return Err(NetError::RegistryFull {
                    capacity: self.max_children,
                });
            }
            self.routes.learn(child.clone(), child.clone());
            peers.insert(child.clone(), entry)
        };

        match previous {
            Some(previous) => {
                info!(target: "fleet_tasknet::downstream", %child, generation, replaced = previous.generation(), "child re-registered");
                previous.revoke();
            }
            None => {
                info!(target: "fleet_tasknet::downstream", %child, generation, "child registered");
            }
        }
        Ok(Ack::ok(String::new(), self.position.clone()))
    }

    /// Bind the persistent stream of a registered child.
    ///
    /// Acks read from `inbound` complete the child's pending synchronous sends. The returned
    /// stream carries messages toward the child and ends once the stream is superseded, the
    /// entry is revoked or the child closes its side.
    pub fn attach<S>(self: &Arc<Self>, child: Position, inbound: S) -> NetResult<OutboundStream>
    where
        S: Stream<Item = Result<proto::Ack, Status>> + Send + Unpin + 'static,
    {
        let child = child.normalized();
        let entry = self
            .peers
            .read()
            .get(&child)
            .cloned()
            .ok_or_else(|| NetError::StreamNotReady(child.clone()))?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let (scope, id) = entry.attach(tx);
        debug!(target: "fleet_tasknet::downstream", %child, generation = entry.generation(), stream = id, "stream attached");

        let endpoint = self.clone();
        let stream_scope = scope.clone();
        self.tracker.spawn(async move {
            let mut inbound = inbound;
            let ended_by_child = loop {
                tokio::select! {
                    biased;
                    _ = stream_scope.cancelled() => break false,
                    next = inbound.next() => match next {
                        Some(Ok(raw)) => match Ack::try_from(raw) {
                            Ok(ack) => entry.complete(ack),
                            Err(e) => warn!(target: "fleet_tasknet::downstream", child = %entry.position(), "dropping malformed ack: {e}"),
                        },
                        Some(Err(status)) => {
                            debug!(target: "fleet_tasknet::downstream", child = %entry.position(), "stream failed: {status}");
                            break true;
                        }
                        None => break true,
                    },
                }
            };

            let current = entry.detach(id);
            stream_scope.cancel();
            if ended_by_child && current {
                endpoint.evict(entry.position(), entry.generation());
            }
        });

        Ok(Box::pin(
            ReceiverStream::new(rx).take_until(scope.cancelled_owned()),
        ))
    }

    /// Remove `child` and its routes, unless it has re-registered since `generation`.
    pub fn evict(&self, child: &Position, generation: u64) -> bool {
        let (entry, routes) = {
            let mut peers = self.peers.write();
            if peers
                .get(child)
                .is_none_or(|entry| entry.generation() != generation)
            {
                return false;
            }
            let Some(entry) = peers.remove(child) else {
                return false;
            };
            (entry, self.routes.evict_next_hop(child))
        };
        entry.revoke();
        info!(target: "fleet_tasknet::downstream", %child, generation, routes, "child evicted");
        true
    }

    /// Learn the descendants in `path` as reachable through `proxy`, then relay upward.
    pub async fn discover_route(&self, proxy: Position, path: Vec<Position>) -> NetResult<Ack> {
        let proxy = proxy.normalized();
        let mut relayed = path
            .into_iter()
            .map(|position| self.checked_child(position))
            .collect::<NetResult<Vec<_>>>()?;

        {
            // held while learning so an eviction of the proxy cannot interleave
            let peers = self.peers.read();
            if !peers.contains_key(&proxy) {
                return Err(NetError::NoRoute(proxy));
            }
            for position in &relayed {
                if let Some(previous) = self.routes.learn(position.clone(), proxy.clone()) {
                    debug!(target: "fleet_tasknet::downstream", dest = %position, from = %previous, to = %proxy, "route moved");
                }
            }
            self.routes.learn(proxy.clone(), proxy.clone());
        }

        if self.position.role.is_root() {
            return Ok(Ack::ok(String::new(), self.position.clone()));
        }
        let Some(upstream) = self.router()?.upstream().cloned() else {
            return Ok(Ack::ok(String::new(), self.position.clone()));
        };
        if !relayed.contains(&proxy) {
            relayed.push(proxy);
        }
        relayed.push(self.position.clone());
        upstream.discover(self.position.clone(), relayed).await
    }

    /// Forward `message` toward its descendant destination.
    pub async fn send(&self, message: Message) -> NetResult<Ack> {
        if message.header.dst.is_broadcast() {
            return self.broadcast(message).await;
        }

        let dst = &message.header.dst;
        let hop = self
            .routes
            .next_hop(dst)
            .ok_or_else(|| NetError::NoRoute(dst.clone()))?;
        let entry = self
            .peers
            .read()
            .get(&hop)
            .cloned()
            .ok_or_else(|| NetError::NoRoute(dst.clone()))?;
        entry.send(message, self.ack_timeout, &self.position).await
    }

    async fn broadcast(&self, message: Message) -> NetResult<Ack> {
        let pattern = message.header.dst.clone();
        let hops = self.routes.next_hops_matching(&pattern);
        if hops.is_empty() {
            return Err(NetError::NoRoute(pattern));
        }

        let total = hops.len();
        let mut missing = 0;
        let mut branches = Vec::with_capacity(total);
        for hop in hops {
            let Some(entry) = self.peers.read().get(&hop).cloned() else {
                missing += 1;
                continue;
            };
            let mut copy = message.clone();
            if pattern.matches(&hop) {
                copy.header.dst = hop;
            }
            let ack_timeout = self.ack_timeout;
            let local = self.position.clone();
            branches.push(
                self.pool
                    .spawn(async move { entry.send(copy, ack_timeout, &local).await }),
            );
        }

        let mut failed = missing;
        let mut first_code = None;
        for outcome in futures::future::join_all(branches).await {
            let error = match outcome {
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => e,
                Err(join) => NetError::send_lost(&pattern, join),
            };
            debug!(target: "fleet_tasknet::downstream", dst = %pattern, "broadcast branch failed: {error}");
            first_code.get_or_insert(error.code());
            failed += 1;
        }

        if failed == 0 {
            return Ok(Ack::ok(message.header.uuid, self.position.clone()));
        }
        Err(NetError::Broadcast {
            dst: pattern.clone(),
            failed,
            total,
            code: first_code.unwrap_or(AckCode::NoRoute),
        })
    }

    pub fn children(&self) -> Vec<Position> {
        let mut children: Vec<_> = self.peers.read().keys().cloned().collect();
        children.sort();
        children
    }

    pub fn routes(&self) -> Vec<(Position, Position)> {
        self.routes.snapshot()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Revoke every child and forget all routes.
    pub fn close(&self) {
        self.scope.cancel();
        let peers: Vec<_> = self.peers.write().drain().map(|(_, entry)| entry).collect();
        for entry in peers {
            entry.revoke();
        }
        self.routes.clear();
    }

    fn checked_child(&self, position: Position) -> NetResult<Position> {
        let position = position.normalized();
        if !position.is_well_formed() || position.is_broadcast() {
            return Err(NetError::frame(format!(
                "{position} is not a concrete position"
            )));
        }
        if position.level() >= self.position.level() {
            return Err(NetError::IllegalDestination {
                dst: position,
                reason: "not below this peer",
            });
        }
        Ok(position)
    }
}
