// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error types for the task network.
//!
//! Every failure kind maps onto exactly one [`AckCode`], so an error can always be turned
//! back into an [`Ack`] frame. Internal operations return [`NetResult<Ack>`]; the public
//! send API wraps failures in a [`SendError`] that carries both the error and the
//! best-effort ack frame, so callers can branch on the code alone.

use std::time::Duration;

use crate::message::{Ack, AckCode};
use crate::position::Position;

pub type NetResult<T> = Result<T, NetError>;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("{0} is not ready")]
    NotReady(&'static str),

    #[error("send to {target} lost: {reason}")]
    SendLost { target: String, reason: String },

    #[error("ack for {uuid} from {target} not received within {timeout:?}")]
    AckTimeout {
        uuid: String,
        target: String,
        timeout: Duration,
    },

    #[error("no route to {0}")]
    NoRoute(Position),

    #[error("illegal destination {dst}: {reason}")]
    IllegalDestination { dst: Position, reason: &'static str },

    #[error("registry full: {capacity} children already registered")]
    RegistryFull { capacity: usize },

    #[error("local receive buffer is full")]
    ReceiverBusy,

    #[error("stream to {0} is not attached")]
    StreamNotReady(Position),

    #[error("request rejected by admission filter")]
    AdmissionDenied,

    #[error("{peer} answered {uuid} with {code}")]
    Rejected {
        uuid: String,
        peer: Position,
        code: AckCode,
    },

    #[error("broadcast to {dst}: {failed} of {total} branches failed")]
    Broadcast {
        dst: Position,
        failed: usize,
        total: usize,
        code: AckCode,
    },

    #[error("network instance is shut down")]
    Shutdown,
}

impl NetError {
    pub(crate) fn frame(reason: impl Into<String>) -> Self {
        NetError::Frame(reason.into())
    }

    pub(crate) fn send_lost(target: impl ToString, reason: impl ToString) -> Self {
        NetError::SendLost {
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }

    /// The ack code reported to peers and callers for this failure.
    pub fn code(&self) -> AckCode {
        match self {
            NetError::Frame(_) => AckCode::ClientFrameError,
            NetError::NotReady(_) | NetError::Shutdown => AckCode::ServerNotReady,
            NetError::SendLost { .. } => AckCode::TransportSendLost,
            NetError::AckTimeout { .. } => AckCode::AckTimedOut,
            NetError::NoRoute(_) => AckCode::NoRoute,
            NetError::IllegalDestination { .. } => AckCode::IllegalDestination,
            NetError::RegistryFull { .. } => AckCode::RegistryFull,
            NetError::ReceiverBusy => AckCode::ReceiverBusy,
            NetError::StreamNotReady(_) => AckCode::StreamNotReady,
            NetError::AdmissionDenied => AckCode::AdmissionDenied,
            NetError::Rejected { code, .. } | NetError::Broadcast { code, .. } => *code,
        }
    }

    /// Build the ack frame a peer at `src` reports for this failure.
    pub fn to_ack(&self, uuid: impl Into<String>, src: Position) -> Ack {
        Ack::new(uuid, self.code(), src)
    }
}

/// Failure of a send issued through the public API.
///
/// Carries the ack frame the failure was reported as, alongside the error itself.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct SendError {
    ack: Ack,
    #[source]
    error: NetError,
}

impl SendError {
    pub(crate) fn new(error: NetError, uuid: impl Into<String>, src: Position) -> Self {
        Self {
            ack: error.to_ack(uuid, src),
            error,
        }
    }

    pub fn ack(&self) -> &Ack {
        &self.ack
    }

    pub fn code(&self) -> AckCode {
        self.ack.code
    }

    pub fn error(&self) -> &NetError {
        &self.error
    }

    pub fn into_parts(self) -> (Ack, NetError) {
        (self.ack, self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Role;

    #[test]
    fn test_rejected_keeps_remote_code() {
        let err = NetError::Rejected {
            uuid: "u-1".to_string(),
            peer: Position::new(Role::Agent, "0", "0"),
            code: AckCode::ReceiverBusy,
        };
        assert_eq!(err.code(), AckCode::ReceiverBusy);
    }

    #[test]
    fn test_send_error_carries_ack() {
        let src = Position::new(Role::Worker, "1", "2");
        let err = SendError::new(
            NetError::NoRoute(Position::new(Role::Worker, "9", "9")),
            "u-2",
            src.clone(),
        );
        assert_eq!(err.code(), AckCode::NoRoute);
        assert_eq!(err.ack().uuid, "u-2");
        assert_eq!(err.ack().src, src);
        assert!(err.to_string().contains("no route"));
    }
}
