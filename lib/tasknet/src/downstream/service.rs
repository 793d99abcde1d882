// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! gRPC surface of the downstream endpoint.
//!
//! Unary handlers always answer with an [`Ack`](crate::message::Ack) frame, failures included.
//! Only stream identity failures and admission rejections surface as gRPC statuses.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info};

use super::{DownstreamEndpoint, OutboundStream};
use crate::admission::AdmissionFilter;
use crate::error::{NetError, NetResult};
use crate::frame;
use crate::message::{Ack, Message, frame_identity};
use crate::position::{Position, identity_from_metadata};
use crate::proto::{
    self,
    task_net_server::{TaskNet, TaskNetServer},
};
use crate::routing::Origin;

/// Serve the endpoint on `listener` until `cancel` fires.
pub(crate) async fn serve(
    listener: TcpListener,
    endpoint: Arc<DownstreamEndpoint>,
    admission: AdmissionFilter,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let local_addr = listener.local_addr()?;
    info!(target: "fleet_tasknet::downstream", position = %endpoint.position(), %local_addr, "serving children");

    let service = TaskNetServer::new(TaskNetService { endpoint })
        .max_decoding_message_size(frame::MAX_FRAME_LEN)
        .max_encoding_message_size(frame::MAX_FRAME_LEN);
    Server::builder()
        .tcp_nodelay(true)
        .add_service(InterceptedService::new(service, admission))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), cancel.cancelled_owned())
        .await?;

    info!(target: "fleet_tasknet::downstream", %local_addr, "server shut down");
    Ok(())
}

#[derive(Clone)]
struct TaskNetService {
    endpoint: Arc<DownstreamEndpoint>,
}

impl TaskNetService {
    fn answer(&self, uuid: String, result: NetResult<Ack>) -> Response<proto::Ack> {
        let ack = result.unwrap_or_else(|e| {
            debug!(target: "fleet_tasknet::downstream", %uuid, code = %e.code(), "request failed: {e}");
            e.to_ack(uuid, self.endpoint.position().clone())
        });
        Response::new(ack.into())
    }
}

#[tonic::async_trait]
impl TaskNet for TaskNetService {
    type AttachStreamStream = OutboundStream;

    async fn register(
        &self,
        request: Request<proto::Position>,
    ) -> Result<Response<proto::Ack>, Status> {
        let result = Position::try_from(request.into_inner())
            .and_then(|child| self.endpoint.register(child));
        Ok(self.answer(String::new(), result))
    }

    async fn attach_stream(
        &self,
        request: Request<Streaming<proto::Ack>>,
    ) -> Result<Response<Self::AttachStreamStream>, Status> {
        let child = identity_from_metadata(request.metadata())
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let outbound = self
            .endpoint
            .attach(child, request.into_inner())
            .map_err(|e| Status::failed_precondition(e.to_string()))?;
        Ok(Response::new(outbound))
    }

    async fn discover_route(
        &self,
        request: Request<proto::RouteRequest>,
    ) -> Result<Response<proto::Ack>, Status> {
        let request = request.into_inner();
        let result: NetResult<Ack> = async {
            let proxy: Position = request
                .proxy
                .ok_or_else(|| NetError::frame("route request without proxy"))?
                .try_into()?;
            let path = request
                .path
                .into_iter()
                .map(Position::try_from)
                .collect::<NetResult<Vec<_>>>()?;
            self.endpoint.discover_route(proxy, path).await
        }
        .await;
        Ok(self.answer(String::new(), result))
    }

    async fn transfer_message(
        &self,
        request: Request<proto::Message>,
    ) -> Result<Response<proto::Ack>, Status> {
        let raw = request.into_inner();
        let (uuid, _) = frame_identity(&raw);
        let result: NetResult<Ack> = async {
            let message = frame::normalize(Message::try_from(raw)?)?;
            self.endpoint
                .router()?
                .dispatch(message, Origin::FromBelow)
                .await
        }
        .await;
        Ok(self.answer(uuid, result))
    }
}
