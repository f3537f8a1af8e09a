// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! A crate for decentralized cluster membership over UDP gossip, with consistent-hash
//! key routing.
//!
//! # Overview
//! `rumor` maintains a weakly consistent view of cluster membership across independent
//! processes using an epidemic (gossip) protocol with [SWIM]-style failure detection.
//! Every node periodically pushes its view of the cluster to one randomly selected
//! peer; a heartbeat digest attached to each push lets the receiver pull any records
//! it is missing or behind on, turning every exchange into full anti-entropy.
//!
//! On top of the membership view, each node maintains a consistent hash ring over the
//! members it currently believes alive, so that logical keys can be routed to a
//! responsible member without any coordination.
//!
//! The protocol is explicitly best-effort: datagrams may be lost, reordered, or
//! duplicated, and the cluster self-heals through repetition. There is no transport
//! security, no multi-datacenter awareness, and no durable state.
//!
//! # Failure detection
//! A member that produces no observable update for longer than a configured window is
//! locally declared `SUSPECT`, and after a further window `DEAD`. Verdicts are local
//! decisions that propagate as ordinary gossip facts; a `DEAD` member is tombstoned
//! and never revived automatically.
//!
//! # References
//! * [SWIM: Scalable Weakly-consistent Infection-style Process Group Membership][SWIM]
//! * [Epidemic Algorithms for Replicated Database Maintenance][epidemic]
//!
//! [SWIM]: https://www.cs.cornell.edu/projects/Quicksilver/public_pdfs/SWIM.pdf
//! [epidemic]: https://dl.acm.org/doi/10.1145/41840.41841
#![warn(rust_2018_idioms, missing_docs)]

#[macro_use]
mod macros;

pub mod cluster;
pub mod ring;

#[doc(inline)]
pub use cluster::{
    member::{Health, Record},
    Cluster, ClusterConfig, Error,
};
#[doc(inline)]
pub use ring::Ring;
