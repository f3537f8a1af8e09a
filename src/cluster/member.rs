// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Membership records and the shared membership table.
use dashmap::{mapref::entry::Entry, DashMap};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap},
    time::{SystemTime, UNIX_EPOCH},
};

/// Local wall-clock time in milliseconds since the unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The health of a member, as decided by some process's failure detector.
///
/// Transitions are driven only by local staleness observation; remote messages
/// only ever move a member back toward [Alive][Health::Alive] implicitly via a
/// heartbeat increase, or propagate a verdict another process already declared.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// The member is believed reachable and making progress.
    Alive,
    /// The member has produced no observable update for too long.
    Suspect,
    /// The member is considered gone. Terminal; tombstoned records are excluded
    /// from ring membership and partner selection, but never deleted.
    Dead,
}

/// A member's mutable status record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Stable identity (`host:port`), immutable after creation.
    pub id: String,
    /// Monotonically non-decreasing version counter. The sole conflict
    /// resolution field during merges.
    pub heartbeat: u64,
    /// Current health, as locally believed.
    pub state: Health,
    /// Local wall-clock time (unix millis) of the last accepted change. This is
    /// observation time on the receiving process, not sender time.
    pub timestamp: u64,
}

impl Record {
    pub(crate) fn new(id: String, heartbeat: u64, state: Health, timestamp: u64) -> Self {
        Self {
            id,
            heartbeat,
            state,
            timestamp,
        }
    }

    /// Declare a new locally decided state. The heartbeat bump makes the verdict
    /// itself propagate as a higher-versioned fact during the next exchange.
    fn declare(&mut self, state: Health, now: u64) {
        self.state = state;
        self.heartbeat += 1;
        self.timestamp = now;
    }
}

/// The membership table: exactly one [Record] per known identity, shared by the
/// gossip cycle, the failure detector, the receive loop, and external status
/// queries.
///
/// Per-record mutations happen under the backing map's entry guard, so a reader
/// never sees a state updated without its matching heartbeat and timestamp.
pub(crate) struct Roster {
    local_id: String,
    records: DashMap<String, Record>,
}

impl Roster {
    /// Create a table containing the local record (alive, heartbeat 0) and one
    /// initially-alive record per seed, enabling first contact.
    pub(crate) fn new<S: AsRef<str>>(local_id: String, seeds: &[S]) -> Self {
        let records = DashMap::new();
        let now = now_millis();

        records.insert(
            local_id.clone(),
            Record::new(local_id.clone(), 0, Health::Alive, now),
        );

        for seed in seeds {
            let seed = seed.as_ref();
            if seed != local_id {
                records.insert(
                    seed.to_owned(),
                    Record::new(seed.to_owned(), 0, Health::Alive, now),
                );
            }
        }

        Roster { local_id, records }
    }

    /// Returns the local process's identity.
    pub(crate) fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Returns a copy of the record for `id`, if known.
    pub(crate) fn get(&self, id: &str) -> Option<Record> {
        self.records.get(id).map(|r| r.clone())
    }

    /// Returns a full-value snapshot of the table.
    pub(crate) fn snapshot(&self) -> HashMap<String, Record> {
        (self.records.iter())
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }

    /// Returns a heartbeat digest of everything this process knows.
    pub(crate) fn digest(&self) -> HashMap<String, u64> {
        (self.records.iter())
            .map(|r| (r.key().clone(), r.heartbeat))
            .collect()
    }

    /// Returns the identities a gossip round may be addressed to: everything
    /// known that is neither the local process nor tombstoned.
    pub(crate) fn partners(&self) -> Vec<String> {
        (self.records.iter())
            .filter(|r| r.state != Health::Dead && r.key() != &self.local_id)
            .map(|r| r.key().clone())
            .collect()
    }

    /// Returns the sorted set of identities currently believed alive.
    pub(crate) fn alive_ids(&self) -> BTreeSet<String> {
        (self.records.iter())
            .filter(|r| r.state == Health::Alive)
            .map(|r| r.key().clone())
            .collect()
    }

    /// Advance the local record by one heartbeat. Ran at the top of every gossip
    /// round, which is also what makes the local record immune to staleness.
    pub(crate) fn bump_local(&self) {
        if let Some(mut local) = self.records.get_mut(&self.local_id) {
            local.heartbeat += 1;
            local.timestamp = now_millis();
        }
    }

    /// Merge one incoming record into the table.
    ///
    /// An unknown identity is inserted as-is (first discovery). A known identity
    /// is overwritten only when the incoming heartbeat is strictly greater, and
    /// its timestamp is set to the local receive time so staleness tracking
    /// reflects "time since we last heard something newer". Anything else is
    /// discarded, as is any record claiming the local identity: the local
    /// process is the only source of truth for its own record.
    ///
    /// Returns whether the incoming record was accepted.
    pub(crate) fn merge(&self, incoming: Record, now: u64) -> bool {
        if incoming.id == self.local_id {
            return false;
        }

        match self.records.entry(incoming.id.clone()) {
            Entry::Vacant(vacant) => {
                info!("{}: discovered new member: {}", self.local_id, incoming.id);
                vacant.insert(incoming);
                true
            }

            Entry::Occupied(mut occupied) => {
                let local = occupied.get_mut();
                if incoming.heartbeat <= local.heartbeat {
                    return false;
                }

                local.heartbeat = incoming.heartbeat;
                local.state = incoming.state;
                local.timestamp = now;
                true
            }
        }
    }

    /// Collect the identities for which `digest` claims strictly fresher
    /// knowledge than the local table holds, including ones we've never heard of.
    pub(crate) fn behind(&self, digest: &HashMap<String, u64>) -> Vec<String> {
        (digest.iter())
            .filter(|(id, hb)| self.get(id).map_or(true, |r| r.heartbeat < **hb))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Run one failure detection pass over all non-self, non-tombstoned records.
    ///
    /// An alive record stale for longer than `suspect_after` becomes suspect; a
    /// suspect record stale for longer than `dead_after` (measured from the
    /// suspect declaration, which refreshes the timestamp) becomes dead. Both
    /// declarations bump the heartbeat so they win merges elsewhere.
    pub(crate) fn check_failures(&self, suspect_after: u64, dead_after: u64, now: u64) {
        for mut entry in self.records.iter_mut() {
            let record = entry.value_mut();
            if record.id == self.local_id {
                continue;
            }

            let stale = now.saturating_sub(record.timestamp);

            match record.state {
                Health::Suspect if stale > dead_after => {
                    record.declare(Health::Dead, now);
                    warn!(
                        "{}: declared {} dead after {}ms without updates",
                        self.local_id, record.id, stale
                    );
                }

                Health::Alive if stale > suspect_after => {
                    record.declare(Health::Suspect, now);
                    info!(
                        "{}: declared {} suspect after {}ms without updates",
                        self.local_id, record.id, stale
                    );
                }

                _ => {}
            }
        }
    }

    /// Forcibly declare a local verdict about `id`, as if the failure detector
    /// had decided it. Intended for tests and operational simulation.
    ///
    /// Returns whether `id` was known.
    pub(crate) fn force_state(&self, id: &str, state: Health) -> bool {
        match self.records.get_mut(id) {
            Some(mut record) => {
                record.declare(state, now_millis());
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> Roster {
        Roster::new("127.0.0.1:9001".to_owned(), &["127.0.0.1:9002"])
    }

    fn record(id: &str, heartbeat: u64, state: Health, timestamp: u64) -> Record {
        Record::new(id.to_owned(), heartbeat, state, timestamp)
    }

    #[test]
    fn bootstrap_contains_self_and_seeds() {
        let r = roster();
        let status = r.snapshot();

        assert_eq!(status.len(), 2);
        assert_eq!(status["127.0.0.1:9001"].heartbeat, 0);
        assert_eq!(status["127.0.0.1:9001"].state, Health::Alive);
        assert_eq!(status["127.0.0.1:9002"].state, Health::Alive);
    }

    #[test]
    fn first_discovery_inserts_as_is() {
        let r = roster();
        assert!(r.merge(record("127.0.0.1:9003", 7, Health::Suspect, 1000), 9999));

        let got = r.get("127.0.0.1:9003").unwrap();
        assert_eq!(got, record("127.0.0.1:9003", 7, Health::Suspect, 1000));
    }

    #[test]
    fn merge_accepts_only_strictly_greater_heartbeats() {
        let r = roster();

        assert!(r.merge(record("127.0.0.1:9002", 3, Health::Alive, 50), 100));
        // equal heartbeat: local knowledge is at least as fresh
        assert!(!r.merge(record("127.0.0.1:9002", 3, Health::Suspect, 60), 200));
        // lower heartbeat: stale
        assert!(!r.merge(record("127.0.0.1:9002", 2, Health::Dead, 70), 300));

        let got = r.get("127.0.0.1:9002").unwrap();
        assert_eq!(got.heartbeat, 3);
        assert_eq!(got.state, Health::Alive);
        assert_eq!(got.timestamp, 100, "accepted merges use local receive time");
    }

    #[test]
    fn merge_is_idempotent() {
        let r = roster();
        let incoming = record("127.0.0.1:9002", 5, Health::Suspect, 40);

        assert!(r.merge(incoming.clone(), 100));
        let once = r.snapshot();

        assert!(!r.merge(incoming, 100));
        assert_eq!(r.snapshot(), once);
    }

    #[test]
    fn heartbeats_never_regress() {
        let r = roster();

        let mut seen = vec![r.get("127.0.0.1:9002").unwrap().heartbeat];
        for hb in [4, 2, 9, 9, 1, 12] {
            r.merge(record("127.0.0.1:9002", hb, Health::Alive, 0), 100);
            seen.push(r.get("127.0.0.1:9002").unwrap().heartbeat);
        }

        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{:?}", seen);
    }

    #[test]
    fn remote_claims_about_self_are_ignored() {
        let r = roster();

        assert!(!r.merge(record("127.0.0.1:9001", 1000, Health::Dead, 0), 100));

        let local = r.get("127.0.0.1:9001").unwrap();
        assert_eq!(local.heartbeat, 0);
        assert_eq!(local.state, Health::Alive);
    }

    #[test]
    fn staleness_walks_alive_through_suspect_to_dead() {
        let r = roster();
        r.merge(record("127.0.0.1:9003", 1, Health::Alive, 10_000), 10_000);

        // within the suspicion window: no transition.
        r.check_failures(7_000, 14_000, 16_999);
        assert_eq!(r.get("127.0.0.1:9003").unwrap().state, Health::Alive);

        // just past it: suspect, heartbeat bumped, timestamp refreshed.
        r.check_failures(7_000, 14_000, 17_001);
        let suspect = r.get("127.0.0.1:9003").unwrap();
        assert_eq!(suspect.state, Health::Suspect);
        assert_eq!(suspect.heartbeat, 2);
        assert_eq!(suspect.timestamp, 17_001);

        // the dead window is measured from the suspect declaration.
        r.check_failures(7_000, 14_000, 31_000);
        assert_eq!(r.get("127.0.0.1:9003").unwrap().state, Health::Suspect);

        r.check_failures(7_000, 14_000, 31_002);
        let dead = r.get("127.0.0.1:9003").unwrap();
        assert_eq!(dead.state, Health::Dead);
        assert_eq!(dead.heartbeat, 3);
    }

    #[test]
    fn dead_is_terminal_under_the_detector() {
        let r = roster();
        r.merge(record("127.0.0.1:9003", 1, Health::Dead, 0), 0);

        r.check_failures(7_000, 14_000, 1_000_000);
        let got = r.get("127.0.0.1:9003").unwrap();
        assert_eq!(got.state, Health::Dead);
        assert_eq!(got.heartbeat, 1, "tombstones are not re-declared");
    }

    #[test]
    fn local_record_is_never_suspected() {
        let r = roster();
        r.check_failures(7_000, 14_000, now_millis() + 1_000_000);
        assert_eq!(r.get("127.0.0.1:9001").unwrap().state, Health::Alive);
    }

    #[test]
    fn behind_reports_unknown_and_outdated_ids() {
        let r = roster();
        r.merge(record("127.0.0.1:9003", 5, Health::Alive, 0), 0);

        let mut digest = HashMap::new();
        digest.insert("127.0.0.1:9003".to_owned(), 5); // equal: not behind
        digest.insert("127.0.0.1:9002".to_owned(), 1); // ahead of our 0
        digest.insert("127.0.0.1:9004".to_owned(), 0); // unknown

        let mut behind = r.behind(&digest);
        behind.sort();
        assert_eq!(behind, vec!["127.0.0.1:9002", "127.0.0.1:9004"]);
    }

    #[test]
    fn forced_verdicts_bump_the_heartbeat() {
        let r = roster();

        assert!(r.force_state("127.0.0.1:9002", Health::Suspect));
        let got = r.get("127.0.0.1:9002").unwrap();
        assert_eq!(got.state, Health::Suspect);
        assert_eq!(got.heartbeat, 1);

        assert!(!r.force_state("127.0.0.1:9009", Health::Dead));
    }

    #[test]
    fn partners_exclude_self_and_tombstones() {
        let r = roster();
        r.merge(record("127.0.0.1:9003", 1, Health::Suspect, 0), 0);
        r.merge(record("127.0.0.1:9004", 1, Health::Dead, 0), 0);

        let mut partners = r.partners();
        partners.sort();
        assert_eq!(partners, vec!["127.0.0.1:9002", "127.0.0.1:9003"]);
    }

    #[test]
    fn alive_ids_excludes_suspects_and_tombstones() {
        let r = roster();
        r.merge(record("127.0.0.1:9003", 1, Health::Suspect, 0), 0);
        r.merge(record("127.0.0.1:9004", 1, Health::Dead, 0), 0);

        let alive: Vec<_> = r.alive_ids().into_iter().collect();
        assert_eq!(alive, vec!["127.0.0.1:9001", "127.0.0.1:9002"]);
    }
}
