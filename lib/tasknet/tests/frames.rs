// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Frames at the size limits, and frames a peer must refuse to forward.

mod common;

use fleet_tasknet::frame::{
    MAX_BIZ_TYPE_LEN, MAX_EXTENSION_ENTRIES, MAX_EXTENSION_LEN, MAX_TEXT_LEN, MAX_UUID_LEN,
};
use fleet_tasknet::{Ack, AckCode, Body, Header, Message, OutboundMessage, Position, Role};
use tokio::time::timeout;

use common::{RawParent, WAIT, addr, controller, receive, worker};

fn largest_body() -> Body {
    (0..MAX_EXTENSION_ENTRIES).fold(Body::new("bulk", "x".repeat(MAX_TEXT_LEN)), |body, i| {
        body.with_extension(
            format!("{i:0>width$}", width = MAX_EXTENSION_LEN),
            "v".repeat(MAX_EXTENSION_LEN),
        )
    })
}

fn largest(dst: Position, uuid_tag: char) -> OutboundMessage {
    OutboundMessage::new(dst, "b".repeat(MAX_BIZ_TYPE_LEN), largest_body())
        .with_uuid(uuid_tag.to_string().repeat(MAX_UUID_LEN))
}

#[tokio::test]
async fn test_largest_frame_travels_both_ways() {
    let root = controller().await;
    let leaf = worker(addr(&root), "0", "0").await;

    let ack = leaf
        .send_sync(largest(root.position().clone(), 'u'))
        .await
        .unwrap();
    assert_eq!(ack.code, AckCode::Ok);
    let received = receive(&root).await;
    assert_eq!(received.body.message.len(), MAX_TEXT_LEN);
    assert_eq!(received.body.extension.len(), MAX_EXTENSION_ENTRIES);

    let ack = root
        .send_sync(largest(leaf.position().clone(), 'd'))
        .await
        .unwrap();
    assert_eq!(ack.code, AckCode::Ok);
    assert_eq!(receive(&leaf).await.body.message.len(), MAX_TEXT_LEN);

    // one byte more is refused before it reaches the wire
    let err = leaf
        .send_sync(OutboundMessage::new(
            root.position().clone(),
            "bulk",
            Body::new("bulk", "x".repeat(MAX_TEXT_LEN + 1)),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), AckCode::ClientFrameError);

    // neither exchange disturbed the link
    assert_eq!(leaf.status().upstream_ready, Some(true));
    assert_eq!(root.status().children, vec![leaf.position().clone()]);

    leaf.shutdown().await;
    root.shutdown().await;
}

#[tokio::test]
async fn test_parent_frame_addressed_upward_is_refused() {
    let mut parent = RawParent::start().await;
    let leaf = worker(parent.addr, "0", "0").await;
    let (frames, mut acks) = parent.next_stream().await;

    let frame = |uuid: &str, dst: Position| Message {
        header: Header {
            uuid: uuid.to_string(),
            biz_type: "task".to_string(),
            src: parent.position.clone(),
            dst,
            sync: true,
            timestamp: 1,
        },
        body: Body::default(),
    };

    // a sibling of the leaf can only be reached through the parent that sent the frame
    frames
        .send(Ok(frame("loop-1", Position::new(Role::Worker, "0", "1")).into()))
        .await
        .unwrap();
    let ack = timeout(WAIT, acks.message()).await.unwrap().unwrap().unwrap();
    let ack = Ack::try_from(ack).unwrap();
    assert_eq!(ack.uuid, "loop-1");
    assert_eq!(ack.code, AckCode::IllegalDestination);
    assert_eq!(ack.src, *leaf.position());

    // the link stays up and frames for the leaf itself still arrive
    frames
        .send(Ok(frame("own-1", leaf.position().clone()).into()))
        .await
        .unwrap();
    let ack = timeout(WAIT, acks.message()).await.unwrap().unwrap().unwrap();
    assert_eq!(Ack::try_from(ack).unwrap().code, AckCode::Ok);
    assert_eq!(receive(&leaf).await.header.uuid, "own-1");
    assert_eq!(leaf.status().upstream_ready, Some(true));

    leaf.shutdown().await;
    parent.stop();
}
