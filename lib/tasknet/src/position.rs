// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Identity of a process in the task network hierarchy.
//!
//! A [`Position`] is the triple (role, server rank, process rank). Roles are totally ordered by
//! [`Role::level`]: workers are the leaves (level 0), agents sit one level above them and the
//! controller is the root. A destination with a lower level than the local position is a
//! descendant.
//!
//! The rank [`BROADCAST_RANK`] is a wildcard; a position carrying it in either rank addresses
//! every descendant of that role matching the remaining rank.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tonic::metadata::{MetadataMap, MetadataValue};

use crate::error::{NetError, NetResult};
use crate::proto;

/// Wildcard rank used by broadcast destinations.
pub const BROADCAST_RANK: &str = "*";

const ROLE_KEY: &str = "x-tasknet-role";
const SERVER_RANK_KEY: &str = "x-tasknet-server-rank";
const PROCESS_RANK_KEY: &str = "x-tasknet-process-rank";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Worker,
    Agent,
    Controller,
}

impl Role {
    /// Depth of the role in the tree; larger is closer to the root.
    pub const fn level(self) -> u8 {
        match self {
            Role::Worker => 0,
            Role::Agent => 1,
            Role::Controller => 2,
        }
    }

    pub const fn is_leaf(self) -> bool {
        matches!(self, Role::Worker)
    }

    pub const fn is_root(self) -> bool {
        matches!(self, Role::Controller)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Worker => "worker",
            Role::Agent => "agent",
            Role::Controller => "controller",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "worker" => Ok(Role::Worker),
            "agent" => Ok(Role::Agent),
            "controller" => Ok(Role::Controller),
            other => Err(NetError::frame(format!("unknown role '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub role: Role,
    pub server_rank: String,
    pub process_rank: String,
}

impl Position {
    pub fn new(role: Role, server_rank: impl Into<String>, process_rank: impl Into<String>) -> Self {
        Self {
            role,
            server_rank: server_rank.into(),
            process_rank: process_rank.into(),
        }
    }

    /// Every descendant with the given role.
    pub fn broadcast(role: Role) -> Self {
        Self::new(role, BROADCAST_RANK, BROADCAST_RANK)
    }

    pub fn level(&self) -> u8 {
        self.role.level()
    }

    pub fn is_broadcast(&self) -> bool {
        self.server_rank == BROADCAST_RANK || self.process_rank == BROADCAST_RANK
    }

    /// Both ranks are present.
    pub fn is_well_formed(&self) -> bool {
        !self.server_rank.is_empty() && !self.process_rank.is_empty()
    }

    /// Whether `other` is addressed by `self`, treating wildcard ranks in `self` as "any".
    pub fn matches(&self, other: &Position) -> bool {
        self.role == other.role
            && rank_matches(&self.server_rank, &other.server_rank)
            && rank_matches(&self.process_rank, &other.process_rank)
    }

    pub(crate) fn normalized(self) -> Self {
        Self {
            role: self.role,
            server_rank: self.server_rank.trim().to_string(),
            process_rank: self.process_rank.trim().to_string(),
        }
    }
}

fn rank_matches(pattern: &str, rank: &str) -> bool {
    pattern == BROADCAST_RANK || pattern == rank
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}:{}]", self.role, self.server_rank, self.process_rank)
    }
}

impl From<Position> for proto::Position {
    fn from(position: Position) -> Self {
        proto::Position {
            role: position.role.as_str().to_string(),
            server_rank: position.server_rank,
            process_rank: position.process_rank,
        }
    }
}

impl TryFrom<proto::Position> for Position {
    type Error = NetError;

    fn try_from(value: proto::Position) -> NetResult<Self> {
        Ok(Position {
            role: value.role.parse()?,
            server_rank: value.server_rank,
            process_rank: value.process_rank,
        })
    }
}

/// Attach the caller identity to outgoing request metadata.
pub fn insert_identity(metadata: &mut MetadataMap, position: &Position) -> NetResult<()> {
    let ascii = |value: &str| {
        MetadataValue::try_from(value)
            .map_err(|_| NetError::frame(format!("rank '{value}' is not valid metadata")))
    };
    metadata.insert(ROLE_KEY, ascii(position.role.as_str())?);
    metadata.insert(SERVER_RANK_KEY, ascii(&position.server_rank)?);
    metadata.insert(PROCESS_RANK_KEY, ascii(&position.process_rank)?);
    Ok(())
}

/// Recover the caller identity from incoming request metadata.
pub fn identity_from_metadata(metadata: &MetadataMap) -> NetResult<Position> {
    let field = |key: &'static str| -> NetResult<String> {
        metadata
            .get(key)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| NetError::frame(format!("missing metadata '{key}'")))
    };
    let position = Position {
        role: field(ROLE_KEY)?.parse()?,
        server_rank: field(SERVER_RANK_KEY)?,
        process_rank: field(PROCESS_RANK_KEY)?,
    };
    if !position.is_well_formed() || position.is_broadcast() {
        return Err(NetError::frame(format!(
            "{position} cannot identify a stream"
        )));
    }
    Ok(position)
}
