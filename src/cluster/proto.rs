// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Wire format for gossip datagrams.
//!
//! A single envelope covers all three exchange kinds, encoded as one JSON
//! document per datagram. Push and pull-response reuse `updates` for full
//! records; push and pull-request reuse `digest` for heartbeat claims and
//! requested identities respectively.
use super::member::Record;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The largest datagram we will send or accept, per the path MTU assumption.
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// The kind of a gossip exchange.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    /// Unsolicited state transfer, carrying the sender's record set and a
    /// digest of every heartbeat it knows about.
    #[serde(rename = "GOSSIP_PUSH")]
    Push,

    /// A request for the full records of the identities named in `digest`
    /// (values are ignored).
    #[serde(rename = "GOSSIP_PULL_REQ")]
    PullReq,

    /// The records answering a pull request.
    #[serde(rename = "GOSSIP_PULL_RES")]
    PullRes,
}

/// The single envelope type exchanged as one message per datagram.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// `host:port` identity of the sending process.
    pub sender_id: String,

    /// Which exchange this datagram belongs to.
    #[serde(rename = "type")]
    pub kind: Kind,

    /// Full records: identity -> record. Present for push and pull-response.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub updates: HashMap<String, Record>,

    /// Heartbeat claims (push) or requested identities (pull-request).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub digest: HashMap<String, u64>,
}

impl Envelope {
    /// Build a push carrying `updates` and a heartbeat `digest`.
    pub fn push(
        sender_id: String,
        updates: HashMap<String, Record>,
        digest: HashMap<String, u64>,
    ) -> Self {
        Self {
            sender_id,
            kind: Kind::Push,
            updates,
            digest,
        }
    }

    /// Build a pull request naming exactly `ids`.
    pub fn pull_req<I: IntoIterator<Item = String>>(sender_id: String, ids: I) -> Self {
        Self {
            sender_id,
            kind: Kind::PullReq,
            updates: HashMap::new(),
            // only the keys matter to the receiver
            digest: ids.into_iter().map(|id| (id, 0)).collect(),
        }
    }

    /// Build a pull response carrying the requested `updates`.
    pub fn pull_res(sender_id: String, updates: HashMap<String, Record>) -> Self {
        Self {
            sender_id,
            kind: Kind::PullRes,
            updates,
            digest: HashMap::new(),
        }
    }

    /// Encode into a JSON datagram payload.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode from a received datagram payload.
    pub fn decode(buf: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(buf)
    }
}
