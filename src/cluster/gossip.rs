// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! The gossip protocol engine: periodic push/pull anti-entropy over UDP, plus the
//! staleness-driven failure detector.
//!
//! Nothing here retries anything. A lost datagram or unreachable peer is simply
//! superseded by later rounds; redundancy over time is the delivery guarantee.
use super::{
    member::{now_millis, Record, Roster},
    proto::{Envelope, Kind, MAX_DATAGRAM},
    ClusterConfig,
};
use log::{debug, warn};
use rand::{thread_rng, Rng};
use std::{collections::HashMap, sync::Arc};
use tokio::{
    net::UdpSocket,
    select,
    sync::watch,
    time::{interval, interval_at, Instant},
};

/// Owns the network endpoint and runs the three periodic activities of the
/// protocol: the gossip cycle, the failure-check cycle, and the receive loop.
pub(crate) struct Gossip {
    cfg: ClusterConfig,
    roster: Arc<Roster>,
    socket: UdpSocket,
}

impl Gossip {
    pub(crate) fn new(cfg: ClusterConfig, roster: Arc<Roster>, socket: UdpSocket) -> Self {
        Self {
            cfg,
            roster,
            socket,
        }
    }

    /// Receive and dispatch datagrams until `shutdown` fires.
    ///
    /// Malformed payloads are dropped, receive errors are logged; neither stops
    /// the loop.
    pub(crate) async fn run_receive(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            select! {
                _ = shutdown.changed() => break,

                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => match Envelope::decode(&buf[..len]) {
                        Ok(env) => self.dispatch(env).await,
                        Err(e) => debug!(
                            "{}: dropped malformed datagram from {}: {}",
                            self.roster.local_id(),
                            from,
                            e
                        ),
                    },

                    Err(e) => warn!("{}: receive failed: {}", self.roster.local_id(), e),
                },
            }
        }
    }

    /// Run the gossip cycle on a fixed interval until `shutdown` fires. The
    /// first round fires immediately, which is what seeds first contact.
    pub(crate) async fn run_gossip(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticks = interval(self.cfg.gossip_interval);

        loop {
            select! {
                _ = shutdown.changed() => break,
                _ = ticks.tick() => self.gossip_round().await,
            }
        }
    }

    /// Run the failure-check cycle on a fixed interval until `shutdown` fires.
    ///
    /// The cycle starts one gossip interval after the gossip cycle, so a fresh
    /// node has pushed at least once before it starts judging staleness.
    pub(crate) async fn run_detector(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let start = Instant::now() + self.cfg.gossip_interval;
        let mut ticks = interval_at(start, self.cfg.gossip_interval);

        loop {
            select! {
                _ = shutdown.changed() => break,

                _ = ticks.tick() => self.roster.check_failures(
                    self.cfg.suspect_timeout.as_millis() as u64,
                    self.cfg.dead_timeout.as_millis() as u64,
                    now_millis(),
                ),
            }
        }
    }

    /// One gossip round: advance the local heartbeat, then push the full record
    /// set and a heartbeat digest to one random live-ish partner. With nobody
    /// eligible to talk to, the round is skipped silently.
    async fn gossip_round(&self) {
        self.roster.bump_local();

        let partner = match self.pick_partner() {
            Some(partner) => partner,
            None => return,
        };

        let push = Envelope::push(
            self.roster.local_id().to_owned(),
            self.roster.snapshot(),
            self.roster.digest(),
        );

        self.send(&push, &partner).await;
    }

    /// Pick a partner uniformly at random from all known non-dead, non-self
    /// members.
    fn pick_partner(&self) -> Option<String> {
        let mut peers = self.roster.partners();
        guard! { !peers.is_empty() };

        let chosen = thread_rng().gen_range(0..peers.len());
        Some(peers.swap_remove(chosen))
    }

    async fn dispatch(&self, env: Envelope) {
        match env.kind {
            Kind::Push => self.on_push(env).await,
            Kind::PullReq => self.on_pull_req(env).await,
            Kind::PullRes => self.merge_updates(env.updates),
        }
    }

    /// Merge any attached records, then compare the sender's digest against
    /// local knowledge and pull exactly the identities we're behind on.
    async fn on_push(&self, env: Envelope) {
        self.merge_updates(env.updates);

        let missing = self.roster.behind(&env.digest);
        if missing.is_empty() {
            return;
        }

        let req = Envelope::pull_req(self.roster.local_id().to_owned(), missing);
        self.send(&req, &env.sender_id).await;
    }

    /// Answer a pull request with the full records we hold for the requested
    /// identities. Unknown identities are omitted, never an error.
    async fn on_pull_req(&self, env: Envelope) {
        let updates: HashMap<String, Record> = (env.digest.keys())
            .filter_map(|id| self.roster.get(id).map(|r| (id.clone(), r)))
            .collect();

        if updates.is_empty() {
            return;
        }

        let res = Envelope::pull_res(self.roster.local_id().to_owned(), updates);
        self.send(&res, &env.sender_id).await;
    }

    fn merge_updates(&self, updates: HashMap<String, Record>) {
        let now = now_millis();
        for (_, record) in updates {
            self.roster.merge(record, now);
        }
    }

    /// Encode and fire one datagram at `target` (a `host:port` identity). All
    /// failures are swallowed after logging; the next round is the retry.
    async fn send(&self, env: &Envelope, target: &str) {
        let buf = match env.encode() {
            Ok(buf) => buf,
            Err(e) => {
                warn!("{}: encode failed: {}", self.roster.local_id(), e);
                return;
            }
        };

        if buf.len() > MAX_DATAGRAM {
            warn!(
                "{}: refusing to send {} byte datagram to {}",
                self.roster.local_id(),
                buf.len(),
                target
            );
            return;
        }

        if let Err(e) = self.socket.send_to(&buf, target).await {
            debug!("{}: send to {} failed: {}", self.roster.local_id(), target, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::member::Health;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn engine(seeds: &[&str]) -> Arc<Gossip> {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local_id = socket.local_addr().unwrap().to_string();
        let roster = Arc::new(Roster::new(local_id, seeds));

        Arc::new(Gossip::new(ClusterConfig::default(), roster, socket))
    }

    async fn recv(socket: &UdpSocket) -> Envelope {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("no datagram within 2s")
            .unwrap();

        Envelope::decode(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn push_with_fresher_digest_triggers_targeted_pull() {
        let engine = engine(&[]).await;

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_id = peer.local_addr().unwrap().to_string();

        // claim knowledge of an identity the engine has never heard of.
        let mut digest = HashMap::new();
        digest.insert("10.0.0.9:7000".to_owned(), 3);

        engine
            .dispatch(Envelope::push(peer_id, HashMap::new(), digest))
            .await;

        let req = recv(&peer).await;
        assert_eq!(req.kind, Kind::PullReq);
        assert_eq!(req.digest.len(), 1);
        assert!(req.digest.contains_key("10.0.0.9:7000"));
    }

    #[tokio::test]
    async fn consistent_push_is_not_answered() {
        let engine = engine(&[]).await;

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_id = peer.local_addr().unwrap().to_string();

        // a record for the peer itself, with a matching digest claim.
        let record = Record::new(peer_id.clone(), 2, Health::Alive, 0);
        let mut updates = HashMap::new();
        updates.insert(peer_id.clone(), record);
        let mut digest = HashMap::new();
        digest.insert(peer_id.clone(), 2);

        engine
            .dispatch(Envelope::push(peer_id.clone(), updates, digest))
            .await;

        // the peer was discovered, and there is nothing left to pull.
        assert_eq!(engine.roster.get(&peer_id).unwrap().heartbeat, 2);

        let mut buf = [0u8; 64];
        let silent = timeout(Duration::from_millis(300), peer.recv_from(&mut buf)).await;
        assert!(silent.is_err(), "engine should not have replied");
    }

    #[tokio::test]
    async fn pull_requests_are_answered_with_known_records_only() {
        let engine = engine(&["10.0.0.1:7000"]).await;
        let local_id = engine.roster.local_id().to_owned();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_id = peer.local_addr().unwrap().to_string();

        let req = Envelope::pull_req(
            peer_id,
            vec![
                local_id.clone(),
                "10.0.0.1:7000".to_owned(),
                "unknown:1".to_owned(),
            ],
        );
        engine.dispatch(req).await;

        let res = recv(&peer).await;
        assert_eq!(res.kind, Kind::PullRes);
        assert_eq!(res.updates.len(), 2);
        assert!(res.updates.contains_key(&local_id));
        assert!(res.updates.contains_key("10.0.0.1:7000"));
    }

    #[tokio::test]
    async fn partner_selection_skips_lonely_nodes() {
        let engine = engine(&[]).await;
        assert_eq!(engine.pick_partner(), None);
    }
}
