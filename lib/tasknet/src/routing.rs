// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Placement of a destination relative to the local position.
//!
//! [`classify`] is applied at every hop, so a message may be re-classified several times on
//! its way to the destination.

use std::fmt;

use crate::position::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// The destination is the local position.
    Local,
    /// The destination is deeper in the tree than the local position.
    TowardChildren,
    /// The destination is at or above the local level.
    TowardParentOrPeers,
    Illegal,
}

/// Where a frame entered the local peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// The hosting application.
    Local,
    /// A child, through a unary transfer.
    FromBelow,
    /// The parent, through the persistent stream.
    FromAbove,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Local => f.write_str("local"),
            Origin::FromBelow => f.write_str("below"),
            Origin::FromAbove => f.write_str("above"),
        }
    }
}

pub fn classify(local: &Position, dst: &Position) -> Classification {
    if !dst.is_well_formed() {
        return Classification::Illegal;
    }
    if dst.is_broadcast() {
        // broadcasts only fan out downward
        return if dst.level() < local.level() {
            Classification::TowardChildren
        } else {
            Classification::Illegal
        };
    }
    if dst == local {
        Classification::Local
    } else if dst.level() < local.level() {
        Classification::TowardChildren
    } else {
        Classification::TowardParentOrPeers
    }
}
