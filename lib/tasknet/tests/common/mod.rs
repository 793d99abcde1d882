// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared helpers for task network integration tests.
//!
//! Instances listen on ephemeral loopback ports with short retry and ack timings. [`RawChild`]
//! and [`RawParent`] speak the wire protocol directly, for cases a real instance would never
//! produce.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Once;
use std::time::Duration;

use fleet_tasknet::position::insert_identity;
use fleet_tasknet::proto::{
    self,
    task_net_client::TaskNetClient,
    task_net_server::{TaskNet, TaskNetServer},
};
use fleet_tasknet::{Ack, AckCode, NetworkConfig, NetworkInstance, Position, Role};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Server};
use tonic::{Request, Response, Status, Streaming};
use tracing_subscriber::FmtSubscriber;

pub const WAIT: Duration = Duration::from_secs(10);

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = FmtSubscriber::builder()
            .with_env_filter("fleet_tasknet=debug")
            .with_test_writer()
            .try_init();
    });
}

pub fn config(position: Position) -> NetworkConfig {
    let mut config = NetworkConfig::new(position);
    config.ack_timeout_ms = 2_000;
    config.retry_delay_ms = 50;
    config
}

pub fn with_listener(mut config: NetworkConfig) -> NetworkConfig {
    config.listen_addr = Some("127.0.0.1:0".parse().unwrap());
    config
}

pub fn with_parent(mut config: NetworkConfig, parent: SocketAddr) -> NetworkConfig {
    config.parent_addr = Some(parent.to_string());
    config
}

pub async fn start(config: NetworkConfig) -> NetworkInstance {
    init_tracing();
    NetworkInstance::start(config).await.unwrap()
}

pub async fn controller() -> NetworkInstance {
    start(with_listener(config(Position::new(Role::Controller, "0", "0")))).await
}

pub async fn agent(parent: SocketAddr, server: &str) -> NetworkInstance {
    let position = Position::new(Role::Agent, server, "0");
    let network = start(with_parent(with_listener(config(position)), parent)).await;
    wait_ready(&network).await;
    network
}

pub async fn worker(parent: SocketAddr, server: &str, process: &str) -> NetworkInstance {
    let position = Position::new(Role::Worker, server, process);
    let network = start(with_parent(config(position), parent)).await;
    wait_ready(&network).await;
    network
}

pub fn addr(network: &NetworkInstance) -> SocketAddr {
    network.local_addr().unwrap()
}

pub async fn wait_ready(network: &NetworkInstance) {
    assert!(
        timeout(WAIT, network.ready()).await.unwrap(),
        "{} never became ready",
        network.position()
    );
}

/// Poll `condition` until it holds or the wait expires.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub async fn receive(network: &NetworkInstance) -> fleet_tasknet::Message {
    timeout(WAIT, network.receive())
        .await
        .expect("no message received in time")
        .expect("instance shut down")
}

/// A child driven directly through the generated client.
pub struct RawChild {
    pub position: Position,
    pub client: TaskNetClient<Channel>,
    acks: Option<mpsc::Sender<proto::Ack>>,
    pub inbound: Option<Streaming<proto::Message>>,
}

impl RawChild {
    pub async fn connect(parent: SocketAddr, position: Position) -> Self {
        let client = TaskNetClient::connect(format!("http://{parent}")).await.unwrap();
        Self {
            position,
            client,
            acks: None,
            inbound: None,
        }
    }

    pub async fn register(&mut self) -> Result<Ack, tonic::Status> {
        let response = self
            .client
            .register(Request::new(self.position.clone().into()))
            .await?;
        Ok(Ack::try_from(response.into_inner()).unwrap())
    }

    pub async fn attach(&mut self) -> Result<(), tonic::Status> {
        let (acks, acks_rx) = mpsc::channel(16);
        let mut request = Request::new(ReceiverStream::new(acks_rx));
        insert_identity(request.metadata_mut(), &self.position).unwrap();
        let response = self.client.attach_stream(request).await?;
        self.acks = Some(acks);
        self.inbound = Some(response.into_inner());
        Ok(())
    }

    /// Register, attach and announce a route to itself.
    pub async fn join(parent: SocketAddr, position: Position) -> Self {
        let mut child = Self::connect(parent, position).await;
        assert_eq!(child.register().await.unwrap().code, AckCode::Ok);
        child.attach().await.unwrap();
        let ack = child
            .client
            .discover_route(Request::new(proto::RouteRequest {
                proxy: Some(child.position.clone().into()),
                path: vec![child.position.clone().into()],
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(ack.code, AckCode::Ok.as_u32());
        child
    }

    /// Next frame pushed by the parent; None once the parent ends the stream.
    pub async fn next_frame(&mut self) -> Option<proto::Message> {
        let inbound = self.inbound.as_mut().expect("stream not attached");
        timeout(WAIT, inbound.message())
            .await
            .expect("no frame received in time")
            .ok()
            .flatten()
    }

    pub async fn ack(&self, uuid: &str, code: AckCode) {
        let ack = Ack::new(uuid, code, self.position.clone());
        self.acks
            .as_ref()
            .expect("stream not attached")
            .send(ack.into())
            .await
            .unwrap();
    }

    /// End the child's side of the stream.
    pub fn hang_up(&mut self) {
        self.acks.take();
    }
}

pub type ParentFrames = mpsc::Sender<Result<proto::Message, Status>>;

/// A parent that accepts every child and hands each attached stream to the test.
pub struct RawParent {
    pub addr: SocketAddr,
    pub position: Position,
    streams: mpsc::UnboundedReceiver<(ParentFrames, Streaming<proto::Ack>)>,
    cancel: CancellationToken,
}

struct RawParentService {
    position: Position,
    streams: mpsc::UnboundedSender<(ParentFrames, Streaming<proto::Ack>)>,
}

impl RawParentService {
    fn ok(&self) -> Result<Response<proto::Ack>, Status> {
        Ok(Response::new(Ack::ok("", self.position.clone()).into()))
    }
}

#[tonic::async_trait]
impl TaskNet for RawParentService {
    type AttachStreamStream = ReceiverStream<Result<proto::Message, Status>>;

    async fn register(
        &self,
        _request: Request<proto::Position>,
    ) -> Result<Response<proto::Ack>, Status> {
        self.ok()
    }

    async fn attach_stream(
        &self,
        request: Request<Streaming<proto::Ack>>,
    ) -> Result<Response<Self::AttachStreamStream>, Status> {
        let (frames, frames_rx) = mpsc::channel(16);
        self.streams
            .send((frames, request.into_inner()))
            .map_err(|_| Status::unavailable("test finished"))?;
        Ok(Response::new(ReceiverStream::new(frames_rx)))
    }

    async fn discover_route(
        &self,
        _request: Request<proto::RouteRequest>,
    ) -> Result<Response<proto::Ack>, Status> {
        self.ok()
    }

    async fn transfer_message(
        &self,
        _request: Request<proto::Message>,
    ) -> Result<Response<proto::Ack>, Status> {
        self.ok()
    }
}

impl RawParent {
    pub async fn start() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let position = Position::new(Role::Controller, "0", "0");
        let (streams_tx, streams) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let service = RawParentService {
            position: position.clone(),
            streams: streams_tx,
        };
        tokio::spawn(
            Server::builder()
                .add_service(TaskNetServer::new(service))
                .serve_with_incoming_shutdown(
                    TcpListenerStream::new(listener),
                    cancel.clone().cancelled_owned(),
                ),
        );
        Self {
            addr,
            position,
            streams,
            cancel,
        }
    }

    /// The next stream a child attaches: a sender for frames pushed down and the child's acks.
    pub async fn next_stream(&mut self) -> (ParentFrames, Streaming<proto::Ack>) {
        timeout(WAIT, self.streams.recv())
            .await
            .expect("no child attached in time")
            .expect("parent stopped")
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RawParent {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
