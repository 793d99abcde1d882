// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Validation and normalization of message frames.
//!
//! [`normalize`] is applied to every frame before it is classified, whether it was produced by
//! the local application or received from a peer. Normalizing an already normalized frame is a
//! no-op.

use uuid::Uuid;

use crate::error::{NetError, NetResult};
use crate::message::Message;
use crate::position::Position;

pub const MAX_UUID_LEN: usize = 128;
pub const MAX_BIZ_TYPE_LEN: usize = 128;
pub const MAX_RANK_LEN: usize = 64;
pub const MAX_MSG_TYPE_LEN: usize = 128;
pub const MAX_TEXT_LEN: usize = 4 * 1024 * 1024;
pub const MAX_EXTENSION_ENTRIES: usize = 256;
/// Longest extension key or value.
pub const MAX_EXTENSION_LEN: usize = 1024;

/// Transport limit for one encoded frame, in both directions.
///
/// Every field above is bounded, so a frame accepted by [`normalize`] always encodes below
/// this size.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

pub fn normalize(mut message: Message) -> NetResult<Message> {
    let header = &mut message.header;

    let uuid = header.uuid.trim().to_string();
    header.uuid = if uuid.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        uuid
    };
    if header.uuid.len() > MAX_UUID_LEN {
        return Err(NetError::frame(format!(
            "uuid longer than {MAX_UUID_LEN} bytes"
        )));
    }

    header.biz_type = header.biz_type.trim().to_string();
    if header.biz_type.is_empty() {
        return Err(NetError::frame("empty biz type"));
    }
    if header.biz_type.len() > MAX_BIZ_TYPE_LEN {
        return Err(NetError::frame(format!(
            "biz type longer than {MAX_BIZ_TYPE_LEN} bytes"
        )));
    }

    header.src = checked_position(header.src.clone(), "source")?;
    if header.src.is_broadcast() {
        return Err(NetError::frame(format!(
            "source {} may not use a wildcard rank",
            header.src
        )));
    }
    header.dst = checked_position(header.dst.clone(), "destination")?;

    // broadcasts are never acknowledged end to end
    if header.dst.is_broadcast() {
        header.sync = false;
    }

    if header.timestamp <= 0 {
        header.timestamp = chrono::Utc::now().timestamp_millis();
    }

    let body = &message.body;
    if body.msg_type.len() > MAX_MSG_TYPE_LEN {
        return Err(NetError::frame(format!(
            "message type longer than {MAX_MSG_TYPE_LEN} bytes"
        )));
    }
    if body.message.len() > MAX_TEXT_LEN {
        return Err(NetError::frame(format!(
            "body text longer than {MAX_TEXT_LEN} bytes"
        )));
    }
    if body.extension.len() > MAX_EXTENSION_ENTRIES {
        return Err(NetError::frame(format!(
            "more than {MAX_EXTENSION_ENTRIES} extension entries"
        )));
    }
    if body.extension.keys().any(|key| key.trim().is_empty()) {
        return Err(NetError::frame("empty extension key"));
    }
    if body
        .extension
        .iter()
        .any(|(key, value)| key.len() > MAX_EXTENSION_LEN || value.len() > MAX_EXTENSION_LEN)
    {
        return Err(NetError::frame(format!(
            "extension entry longer than {MAX_EXTENSION_LEN} bytes"
        )));
    }

    Ok(message)
}

fn checked_position(position: Position, which: &str) -> NetResult<Position> {
    let position = position.normalized();
    if !position.is_well_formed() {
        return Err(NetError::frame(format!("{which} {position} has an empty rank")));
    }
    if position.server_rank.len() > MAX_RANK_LEN || position.process_rank.len() > MAX_RANK_LEN {
        return Err(NetError::frame(format!(
            "{which} rank longer than {MAX_RANK_LEN} bytes"
        )));
    }
    Ok(position)
}
