// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Learned routes from descendants to the direct child leading toward them.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;

use crate::position::Position;

#[derive(Default)]
pub(crate) struct RouteTable {
    routes: RwLock<HashMap<Position, Position>>,
}

impl RouteTable {
    /// Record `dest` as reachable through `hop`. Returns the previous hop, if it changed.
    pub fn learn(&self, dest: Position, hop: Position) -> Option<Position> {
        let previous = self.routes.write().insert(dest, hop.clone());
        previous.filter(|previous| *previous != hop)
    }

    pub fn next_hop(&self, dest: &Position) -> Option<Position> {
        self.routes.read().get(dest).cloned()
    }

    /// Distinct next hops for every known destination addressed by `pattern`.
    pub fn next_hops_matching(&self, pattern: &Position) -> BTreeSet<Position> {
        self.routes
            .read()
            .iter()
            .filter(|(dest, _)| pattern.matches(dest))
            .map(|(_, hop)| hop.clone())
            .collect()
    }

    /// Drop every route through `hop`. Returns how many were removed.
    pub fn evict_next_hop(&self, hop: &Position) -> usize {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|_, next| next != hop);
        before - routes.len()
    }

    pub fn snapshot(&self) -> Vec<(Position, Position)> {
        let mut routes: Vec<_> = self
            .routes
            .read()
            .iter()
            .map(|(dest, hop)| (dest.clone(), hop.clone()))
            .collect();
        routes.sort();
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn clear(&self) {
        self.routes.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Role;

    fn agent(server: &str) -> Position {
        Position::new(Role::Agent, server, "0")
    }

    fn worker(server: &str, process: &str) -> Position {
        Position::new(Role::Worker, server, process)
    }

    #[test]
    fn test_learn_and_lookup() {
        let table = RouteTable::default();
        assert!(table.learn(worker("0", "1"), agent("0")).is_none());
        assert_eq!(table.next_hop(&worker("0", "1")), Some(agent("0")));
        assert!(table.next_hop(&worker("0", "2")).is_none());

        // relearning the same hop is not a change
        assert!(table.learn(worker("0", "1"), agent("0")).is_none());
        assert_eq!(table.learn(worker("0", "1"), agent("1")), Some(agent("0")));
    }

    #[test]
    fn test_broadcast_hops_are_distinct() {
        let table = RouteTable::default();
        table.learn(agent("0"), agent("0"));
        table.learn(agent("1"), agent("1"));
        table.learn(worker("0", "0"), agent("0"));
        table.learn(worker("0", "1"), agent("0"));
        table.learn(worker("1", "0"), agent("1"));

        let hops = table.next_hops_matching(&Position::broadcast(Role::Worker));
        assert_eq!(hops.into_iter().collect::<Vec<_>>(), vec![agent("0"), agent("1")]);

        let hops = table.next_hops_matching(&Position::new(Role::Worker, "1", "*"));
        assert_eq!(hops.into_iter().collect::<Vec<_>>(), vec![agent("1")]);

        assert!(table
            .next_hops_matching(&Position::broadcast(Role::Controller))
            .is_empty());
    }

    #[test]
    fn test_evict_next_hop() {
        let table = RouteTable::default();
        table.learn(agent("0"), agent("0"));
        table.learn(worker("0", "0"), agent("0"));
        table.learn(worker("1", "0"), agent("1"));

        assert_eq!(table.evict_next_hop(&agent("0")), 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.snapshot(), vec![(worker("1", "0"), agent("1"))]);
        assert_eq!(table.evict_next_hop(&agent("0")), 0);
    }
}
