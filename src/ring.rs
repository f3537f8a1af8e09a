// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! A consistent hash ring over member identities.
//!
//! Each member is projected onto a fixed number of virtual positions in a 32-bit
//! keyspace, which keeps key ownership relatively stable across membership changes:
//! adding one member to an `R`-member ring remaps roughly `1 / (R + 1)` of keys.
//!
//! The ring is rebuilt wholesale rather than incrementally patched, and all
//! operations are internally synchronized; [resolve][Ring::resolve] never observes
//! a partially rebuilt mapping.
use fnv::FnvHasher;
use parking_lot::RwLock;
use std::{collections::BTreeMap, hash::Hasher};

/// The default number of virtual positions per member.
pub const DEFAULT_REPLICAS: usize = 100;

/// A consistent hash ring mapping arbitrary keys to member identities.
///
/// # Examples
/// ```
/// use rumor::Ring;
///
/// let ring = Ring::default();
/// assert_eq!(ring.resolve("user:42"), None);
///
/// ring.rebuild(vec!["127.0.0.1:9001", "127.0.0.1:9002"]);
/// let owner = ring.resolve("user:42").unwrap();
/// assert!(owner == "127.0.0.1:9001" || owner == "127.0.0.1:9002");
/// ```
pub struct Ring {
    replicas: usize,
    positions: RwLock<BTreeMap<u32, String>>,
}

impl Default for Ring {
    fn default() -> Self {
        Self::new(DEFAULT_REPLICAS)
    }
}

impl Ring {
    /// Create an empty ring with `replicas` virtual positions per member.
    ///
    /// # Panics
    /// Panics if `replicas == 0`.
    pub fn new(replicas: usize) -> Self {
        assert!(replicas >= 1);

        Self {
            replicas,
            positions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Hash `key` to a position in the 32-bit keyspace.
    ///
    /// FNV is keyless, so positions are stable across calls and across processes
    /// with identical input. It is in no way cryptographic; uniform spread is all
    /// that's required here.
    fn position(key: &str) -> u32 {
        let mut h = FnvHasher::default();
        h.write(key.as_bytes());
        h.finish() as u32
    }

    /// Replace the entire virtual-node mapping with one computed from `members`.
    ///
    /// The new mapping is built off to the side and swapped in under the write
    /// lock, so concurrent [resolve][Ring::resolve] calls see either the old or
    /// the new ring in full. Position collisions between members overwrite in
    /// insertion order (rare, acceptable).
    pub fn rebuild<I, S>(&self, members: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut next = BTreeMap::new();

        for member in members {
            let member = member.into();
            for replica in 0..self.replicas {
                let position = Self::position(&format!("{}#{}", member, replica));
                next.insert(position, member.clone());
            }
        }

        *self.positions.write() = next;
    }

    /// Resolve `key` to the member identity responsible for it: the owner of the
    /// smallest ring position `>=` the key's position, wrapping around to the
    /// ring's smallest position.
    ///
    /// Returns `None` if the ring is empty.
    pub fn resolve(&self, key: &str) -> Option<String> {
        let positions = self.positions.read();
        guard! { !positions.is_empty() };

        let h = Self::position(key);

        (positions.range(h..).next())
            .or_else(|| positions.iter().next())
            .map(|(_, id)| id.clone())
    }

    /// Returns the number of virtual positions currently in the ring.
    pub fn len(&self) -> usize {
        self.positions.read().len()
    }

    /// Returns whether the ring has no members.
    pub fn is_empty(&self) -> bool {
        self.positions.read().is_empty()
    }
}
