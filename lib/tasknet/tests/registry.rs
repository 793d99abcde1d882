// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Registration, stream binding and route bookkeeping on the downstream side.

mod common;

use fleet_tasknet::position::insert_identity;
use fleet_tasknet::proto;
use fleet_tasknet::{AckCode, Body, NetError, OutboundMessage, Position, Role};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Code, Request};

use common::{RawChild, addr, config, start, wait_until, with_listener};

fn worker(process: &str) -> Position {
    Position::new(Role::Worker, "0", process)
}

#[tokio::test]
async fn test_registry_full() {
    let mut root_config = with_listener(config(Position::new(Role::Controller, "0", "0")));
    root_config.max_children = 1;
    let root = start(root_config).await;

    let mut first = RawChild::connect(addr(&root), worker("0")).await;
    assert_eq!(first.register().await.unwrap().code, AckCode::Ok);

    let mut second = RawChild::connect(addr(&root), worker("1")).await;
    assert_eq!(second.register().await.unwrap().code, AckCode::RegistryFull);
    assert_eq!(root.status().children, vec![worker("0")]);

    // the registered child may claim its slot again
    assert_eq!(first.register().await.unwrap().code, AckCode::Ok);
    root.shutdown().await;
}

#[tokio::test]
async fn test_reregistration_terminates_previous_stream() {
    let root = start(with_listener(config(Position::new(Role::Controller, "0", "0")))).await;

    let mut stale = RawChild::join(addr(&root), worker("0")).await;
    let mut fresh = RawChild::join(addr(&root), worker("0")).await;

    assert!(stale.next_frame().await.is_none());
    assert_eq!(root.status().children, vec![worker("0")]);

    // traffic now flows over the fresh stream
    let ack = root
        .send_async(OutboundMessage::new(worker("0"), "probe", Body::default()))
        .await
        .unwrap();
    let frame = fresh.next_frame().await.unwrap();
    assert_eq!(frame.header.unwrap().uuid, ack.uuid);
    root.shutdown().await;
}

#[tokio::test]
async fn test_stream_requires_registration() {
    let root = start(with_listener(config(Position::new(Role::Controller, "0", "0")))).await;
    let mut child = RawChild::connect(addr(&root), worker("0")).await;

    let status = child.attach().await.unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);

    // a stream without identity metadata is refused outright
    let (_acks, acks_rx) = tokio::sync::mpsc::channel::<proto::Ack>(1);
    let status = child
        .client
        .attach_stream(Request::new(ReceiverStream::new(acks_rx)))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    // nor can a broadcast position identify one
    let (_acks, acks_rx) = tokio::sync::mpsc::channel::<proto::Ack>(1);
    let mut request = Request::new(ReceiverStream::new(acks_rx));
    insert_identity(request.metadata_mut(), &Position::broadcast(Role::Worker)).unwrap();
    let status = child.client.attach_stream(request).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    root.shutdown().await;
}

#[tokio::test]
async fn test_send_to_unregistered_position() {
    let root = start(with_listener(config(Position::new(Role::Controller, "0", "0")))).await;
    let err = root
        .send_sync(OutboundMessage::new(worker("7"), "task", Body::default()).with_uuid("lost-1"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), AckCode::NoRoute);
    assert_eq!(err.ack().uuid, "lost-1");
    assert!(matches!(err.error(), NetError::NoRoute(p) if *p == worker("7")));
    root.shutdown().await;
}

#[tokio::test]
async fn test_sync_send_returns_remote_code() {
    let root = start(with_listener(config(Position::new(Role::Controller, "0", "0")))).await;
    let mut child = RawChild::join(addr(&root), worker("0")).await;

    let sender = tokio::spawn({
        let target = worker("0");
        async move {
            let result = root
                .send_sync(OutboundMessage::new(target, "task", Body::default()).with_uuid("busy-1"))
                .await;
            (root, result)
        }
    });

    let frame = child.next_frame().await.unwrap();
    let header = frame.header.unwrap();
    assert!(header.sync);
    child.ack(&header.uuid, AckCode::ReceiverBusy).await;

    let (root, result) = sender.await.unwrap();
    assert_eq!(result.unwrap_err().code(), AckCode::ReceiverBusy);
    root.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_partial_failure() {
    let root = start(with_listener(config(Position::new(Role::Controller, "0", "0")))).await;
    let mut attached = RawChild::join(addr(&root), worker("0")).await;
    let mut detached = RawChild::connect(addr(&root), worker("1")).await;
    assert_eq!(detached.register().await.unwrap().code, AckCode::Ok);

    let err = root
        .send_async(OutboundMessage::new(
            Position::broadcast(Role::Worker),
            "drain",
            Body::default(),
        ))
        .await
        .unwrap_err();
    match err.error() {
        NetError::Broadcast { failed, total, .. } => assert_eq!((*failed, *total), (1, 2)),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(err.code(), AckCode::StreamNotReady);

    // the healthy branch still received exactly one copy
    let frame = attached.next_frame().await.unwrap();
    let dst = Position::try_from(frame.header.unwrap().dst.unwrap()).unwrap();
    assert_eq!(dst, worker("0"));
    attached.hang_up();
    assert!(attached.next_frame().await.is_none());
    root.shutdown().await;
}

#[tokio::test]
async fn test_child_disconnect_evicts_routes() {
    let root = start(with_listener(config(Position::new(Role::Controller, "0", "0")))).await;
    let mut child = RawChild::join(addr(&root), worker("0")).await;
    assert_eq!(root.status().routes, 1);

    child.hang_up();
    wait_until(|| root.status().children.is_empty()).await;
    assert_eq!(root.status().routes, 0);

    let err = root
        .send_sync(OutboundMessage::new(worker("0"), "task", Body::default()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), AckCode::NoRoute);
    root.shutdown().await;
}

#[tokio::test]
async fn test_route_announcement_from_unknown_proxy() {
    let root = start(with_listener(config(Position::new(Role::Controller, "0", "0")))).await;
    let mut stranger = RawChild::connect(addr(&root), worker("3")).await;

    let ack = stranger
        .client
        .discover_route(Request::new(proto::RouteRequest {
            proxy: Some(worker("3").into()),
            path: vec![worker("3").into()],
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(ack.code, AckCode::NoRoute.as_u32());
    root.shutdown().await;
}

#[tokio::test]
async fn test_admission_limit() {
    let mut root_config = with_listener(config(Position::new(Role::Controller, "0", "0")));
    root_config.admission_rate = 1;
    root_config.admission_burst = 1;
    let root = start(root_config).await;

    let mut child = RawChild::connect(addr(&root), worker("0")).await;
    assert_eq!(child.register().await.unwrap().code, AckCode::Ok);
    let status = child.register().await.unwrap_err();
    assert_eq!(status.code(), Code::ResourceExhausted);
    root.shutdown().await;
}
