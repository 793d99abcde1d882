// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Live connection state for one registered child.
//!
//! A [`PeerEntry`] is created empty by `Register` and later bound to the child's persistent
//! stream. Messages flow down the stream; acks for synchronous messages come back up it and are
//! matched to their waiting sender by uuid.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::trace;

use crate::error::{NetError, NetResult};
use crate::message::{Ack, Message};
use crate::position::Position;
use crate::proto;

pub(crate) type OutboundFrame = Result<proto::Message, Status>;

struct AttachedStream {
    id: u64,
    tx: mpsc::Sender<OutboundFrame>,
    scope: CancellationToken,
}

pub(crate) struct PeerEntry {
    position: Position,
    generation: u64,
    scope: CancellationToken,
    stream: Mutex<Option<AttachedStream>>,
    next_stream_id: AtomicU64,
    // one frame in flight per child
    send_lock: tokio::sync::Mutex<()>,
    pending: DashMap<String, oneshot::Sender<Ack>>,
}

impl PeerEntry {
    pub fn new(position: Position, generation: u64, scope: CancellationToken) -> Self {
        Self {
            position,
            generation,
            scope,
            stream: Mutex::new(None),
            next_stream_id: AtomicU64::new(0),
            send_lock: tokio::sync::Mutex::new(()),
            pending: DashMap::new(),
        }
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Bind a new outbound stream, terminating the one it replaces.
    ///
    /// Returns the stream's scope and id; the scope is cancelled when the stream is replaced,
    /// detached or the entry is revoked.
    pub fn attach(&self, tx: mpsc::Sender<OutboundFrame>) -> (CancellationToken, u64) {
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed) + 1;
        let scope = self.scope.child_token();
        let previous = self.stream.lock().replace(AttachedStream {
            id,
            tx,
            scope: scope.clone(),
        });
        if let Some(previous) = previous {
            trace!(target: "fleet_tasknet::downstream", child = %self.position, stream = previous.id, "stream replaced");
            previous.scope.cancel();
        }
        (scope, id)
    }

    /// Unbind stream `id`. Returns false if a newer stream has already replaced it.
    pub fn detach(&self, id: u64) -> bool {
        let mut stream = self.stream.lock();
        if stream.as_ref().is_some_and(|current| current.id == id) {
            if let Some(current) = stream.take() {
                current.scope.cancel();
            }
            true
        } else {
            false
        }
    }

    /// Hand an ack from the child to the sender waiting on its uuid.
    pub fn complete(&self, ack: Ack) {
        match self.pending.remove(&ack.uuid) {
            Some((_, waiter)) => {
                let _ = waiter.send(ack);
            }
            None => {
                trace!(target: "fleet_tasknet::downstream", child = %self.position, uuid = %ack.uuid, "ack without waiter");
            }
        }
    }

    /// Terminate the entry: its stream ends and every waiting sender fails.
    pub fn revoke(&self) {
        self.scope.cancel();
        self.stream.lock().take();
    }

    pub async fn send(
        &self,
        message: Message,
        ack_timeout: Duration,
        local: &Position,
    ) -> NetResult<Ack> {
        let _guard = tokio::select! {
            guard = self.send_lock.lock() => guard,
            _ = self.scope.cancelled() => {
                return Err(NetError::send_lost(&self.position, "connection revoked"));
            }
        };

        let (tx, scope) = {
            let stream = self.stream.lock();
            match stream.as_ref() {
                Some(stream) => (stream.tx.clone(), stream.scope.clone()),
                None => return Err(NetError::StreamNotReady(self.position.clone())),
            }
        };

        let uuid = message.header.uuid.clone();
        let waiter = if message.header.sync {
            let (waiter_tx, waiter_rx) = oneshot::channel();
            self.pending.insert(uuid.clone(), waiter_tx);
            Some(waiter_rx)
        } else {
            None
        };

        let outcome: NetResult<Ack> = async {
            tokio::select! {
                _ = scope.cancelled() => {
                    return Err(NetError::send_lost(&self.position, "stream terminated"));
                }
                queued = tokio::time::timeout(ack_timeout, tx.send(Ok(message.into()))) => match queued {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => return Err(NetError::send_lost(&self.position, "stream closed")),
                    Err(_) => return Err(NetError::send_lost(&self.position, "stream backlogged")),
                },
            }

            let Some(waiter) = waiter else {
                return Ok(Ack::ok(uuid.clone(), local.clone()));
            };

            tokio::select! {
                _ = scope.cancelled() => Err(NetError::send_lost(&self.position, "stream terminated")),
                ack = tokio::time::timeout(ack_timeout, waiter) => match ack {
                    Ok(Ok(ack)) => ack.into_result(),
                    Ok(Err(_)) => Err(NetError::send_lost(&self.position, "ack dropped")),
                    Err(_) => Err(NetError::AckTimeout {
                        uuid: uuid.clone(),
                        target: self.position.to_string(),
                        timeout: ack_timeout,
                    }),
                },
            }
        }
        .await;

        self.pending.remove(&uuid);
        outcome
    }
}
