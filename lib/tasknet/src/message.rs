// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Message and acknowledgement frames.
//!
//! A [`Message`] is a header (identity, addressing, sync flag) plus an application body. Every
//! synchronous message is answered by an [`Ack`] carrying the same uuid; the [`AckCode`] set is
//! closed and shared by every peer in the tree.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{NetError, NetResult};
use crate::position::Position;
use crate::proto;

/// Outcome reported in an [`Ack`].
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckCode {
    Ok = 0,
    ClientFrameError = 1,
    ServerNotReady = 2,
    TransportSendLost = 3,
    AckTimedOut = 4,
    NoRoute = 5,
    IllegalDestination = 6,
    RegistryFull = 7,
    ReceiverBusy = 8,
    StreamNotReady = 9,
    AdmissionDenied = 10,
}

impl AckCode {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(AckCode::Ok),
            1 => Some(AckCode::ClientFrameError),
            2 => Some(AckCode::ServerNotReady),
            3 => Some(AckCode::TransportSendLost),
            4 => Some(AckCode::AckTimedOut),
            5 => Some(AckCode::NoRoute),
            6 => Some(AckCode::IllegalDestination),
            7 => Some(AckCode::RegistryFull),
            8 => Some(AckCode::ReceiverBusy),
            9 => Some(AckCode::StreamNotReady),
            10 => Some(AckCode::AdmissionDenied),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_ok(self) -> bool {
        self == AckCode::Ok
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub uuid: String,
    pub code: AckCode,
    pub src: Position,
}

impl Ack {
    pub fn new(uuid: impl Into<String>, code: AckCode, src: Position) -> Self {
        Self {
            uuid: uuid.into(),
            code,
            src,
        }
    }

    pub fn ok(uuid: impl Into<String>, src: Position) -> Self {
        Self::new(uuid, AckCode::Ok, src)
    }

    /// Turn a non-OK ack from a peer into an error carrying its code.
    pub fn into_result(self) -> NetResult<Ack> {
        if self.code.is_ok() {
            Ok(self)
        } else {
            Err(NetError::Rejected {
                uuid: self.uuid,
                peer: self.src,
                code: self.code,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub uuid: String,
    pub biz_type: String,
    pub src: Position,
    pub dst: Position,
    pub sync: bool,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    pub msg_type: String,
    pub code: i32,
    pub message: String,
    pub extension: HashMap<String, String>,
}

impl Body {
    pub fn new(msg_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extension.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub header: Header,
    pub body: Body,
}

/// What the hosting application supplies when sending; the network fills in the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Correlation id; generated when left empty.
    pub uuid: String,
    pub biz_type: String,
    pub dst: Position,
    pub body: Body,
}

impl OutboundMessage {
    pub fn new(dst: Position, biz_type: impl Into<String>, body: Body) -> Self {
        Self {
            uuid: String::new(),
            biz_type: biz_type.into(),
            dst,
            body,
        }
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = uuid.into();
        self
    }

    pub(crate) fn into_message(self, src: Position, sync: bool) -> Message {
        Message {
            header: Header {
                uuid: self.uuid,
                biz_type: self.biz_type,
                src,
                dst: self.dst,
                sync,
                timestamp: 0,
            },
            body: self.body,
        }
    }
}

impl From<Ack> for proto::Ack {
    fn from(ack: Ack) -> Self {
        proto::Ack {
            uuid: ack.uuid,
            code: ack.code.as_u32(),
            src: Some(ack.src.into()),
        }
    }
}

impl TryFrom<proto::Ack> for Ack {
    type Error = NetError;

    fn try_from(value: proto::Ack) -> NetResult<Self> {
        let code = AckCode::from_u32(value.code)
            .ok_or_else(|| NetError::frame(format!("unknown ack code {}", value.code)))?;
        let src = value
            .src
            .ok_or_else(|| NetError::frame("ack without source"))?
            .try_into()?;
        Ok(Ack {
            uuid: value.uuid,
            code,
            src,
        })
    }
}

impl From<Message> for proto::Message {
    fn from(message: Message) -> Self {
        let Message { header, body } = message;
        proto::Message {
            header: Some(proto::Header {
                uuid: header.uuid,
                biz_type: header.biz_type,
                src: Some(header.src.into()),
                dst: Some(header.dst.into()),
                sync: header.sync,
                timestamp: header.timestamp,
            }),
            body: Some(proto::Body {
                msg_type: body.msg_type,
                code: body.code,
                message: body.message,
                extension: body.extension,
            }),
        }
    }
}

impl TryFrom<proto::Message> for Message {
    type Error = NetError;

    fn try_from(value: proto::Message) -> NetResult<Self> {
        let header = value
            .header
            .ok_or_else(|| NetError::frame("message without header"))?;
        let src = header
            .src
            .ok_or_else(|| NetError::frame("message without source"))?
            .try_into()?;
        let dst = header
            .dst
            .ok_or_else(|| NetError::frame("message without destination"))?
            .try_into()?;
        let body = value
            .body
            .map(|body| Body {
                msg_type: body.msg_type,
                code: body.code,
                message: body.message,
                extension: body.extension,
            })
            .unwrap_or_default();

        Ok(Message {
            header: Header {
                uuid: header.uuid,
                biz_type: header.biz_type,
                src,
                dst,
                sync: header.sync,
                timestamp: header.timestamp,
            },
            body,
        })
    }
}

/// Uuid and sync flag of a raw frame, readable even when the frame fails to decode.
pub(crate) fn frame_identity(frame: &proto::Message) -> (String, bool) {
    frame
        .header
        .as_ref()
        .map(|header| (header.uuid.clone(), header.sync))
        .unwrap_or_default()
}
