// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Decentralized cluster membership with consistent-hash key routing.
//!
//! A [Cluster] composes the gossip protocol engine with a [Ring][crate::Ring]:
//! the engine's tasks keep the membership table converging towards the true
//! state of the world, while a periodic rebuild task recomputes the ring from
//! the members currently believed alive. Key resolution and status queries are
//! served from those two structures without any cross-process coordination.
pub mod member;

mod gossip;
mod proto;

use gossip::Gossip;
use member::{Health, Record, Roster};

use crate::ring::{Ring, DEFAULT_REPLICAS};
use futures::future::join_all;
use log::info;
use parking_lot::Mutex;
use std::{
    collections::{BTreeSet, HashMap},
    io, mem,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    net::UdpSocket,
    select,
    sync::{watch, Mutex as AsyncMutex},
    task::{self, JoinHandle},
    time::interval,
};

/// Errors surfaced while standing up a cluster node.
///
/// Steady-state operation has no fatal errors: runtime transport and decode
/// failures are logged and absorbed by protocol redundancy.
#[derive(Debug, Error)]
pub enum Error {
    /// The UDP endpoint could not be acquired at startup.
    #[error("failed to bind gossip endpoint: {0}")]
    Bind(#[from] io::Error),
}

/// Configuration for a single cluster node.
///
/// The defaults carry the standard protocol cadence: gossip every 3s, suspect
/// after 7s of silence, declare dead 14s after suspicion, reconsider the ring
/// every 5s, 100 virtual ring positions per member.
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub(crate) bind: SocketAddr,
    pub(crate) seeds: Vec<String>,
    pub(crate) gossip_interval: Duration,
    pub(crate) suspect_timeout: Duration,
    pub(crate) dead_timeout: Duration,
    pub(crate) rebuild_interval: Duration,
    pub(crate) replicas: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bind: ([127, 0, 0, 1], 0).into(),
            seeds: Vec::new(),
            gossip_interval: Duration::from_secs(3),
            suspect_timeout: Duration::from_secs(7),
            dead_timeout: Duration::from_secs(14),
            rebuild_interval: Duration::from_secs(5),
            replicas: DEFAULT_REPLICAS,
        }
    }
}

impl ClusterConfig {
    /// Returns the default configuration, listening on `bind`.
    ///
    /// Binding port 0 assigns an ephemeral port; the node's identity is always
    /// derived from the actually bound address.
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            ..Self::default()
        }
    }

    /// Returns a configuration with aggressively shortened cycles, fit for
    /// tests and local experimentation rather than production traffic.
    pub fn low_latency() -> Self {
        Self {
            gossip_interval: Duration::from_millis(100),
            suspect_timeout: Duration::from_millis(400),
            dead_timeout: Duration::from_millis(800),
            rebuild_interval: Duration::from_millis(200),
            ..Self::default()
        }
    }

    /// Add a seed identity (`host:port`) to contact in order to join an
    /// existing cluster. With no seeds, the node bootstraps alone and waits to
    /// be discovered.
    pub fn seed<S: Into<String>>(mut self, id: S) -> Self {
        self.seeds.push(id.into());
        self
    }

    /// Set the period of the gossip and failure-check cycles.
    pub fn gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    /// Set how long a member may go without updates before it is suspected.
    pub fn suspect_timeout(mut self, timeout: Duration) -> Self {
        self.suspect_timeout = timeout;
        self
    }

    /// Set how long a suspected member may go without updates before it is
    /// declared dead.
    pub fn dead_timeout(mut self, timeout: Duration) -> Self {
        self.dead_timeout = timeout;
        self
    }

    /// Set how often the ring is reconciled against the alive member set.
    pub fn rebuild_interval(mut self, interval: Duration) -> Self {
        self.rebuild_interval = interval;
        self
    }

    /// Set the number of virtual ring positions per member.
    ///
    /// # Panics
    /// Panics (at [spawn][ClusterConfig::spawn]) if set to zero.
    pub fn replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    /// Bind the gossip endpoint and start the node's background tasks: the
    /// receive loop, the gossip cycle, the failure-check cycle, and the ring
    /// rebuild cycle.
    ///
    /// Binding is the only fatal failure in the node's lifetime.
    ///
    /// # Examples
    /// ```
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), rumor::Error> {
    /// let node = rumor::ClusterConfig::default().spawn().await?;
    ///
    /// // a fresh unseeded node knows only itself.
    /// assert_eq!(node.status().len(), 1);
    /// assert_eq!(node.resolve("user:42").as_deref(), Some(node.local_id()));
    ///
    /// node.shutdown().await;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn spawn(self) -> Result<Cluster, Error> {
        let socket = UdpSocket::bind(self.bind).await?;
        let local_id = socket.local_addr()?.to_string();
        info!("{}: gossip endpoint bound", local_id);

        let roster = Arc::new(Roster::new(local_id.clone(), &self.seeds));
        let ring = Arc::new(Ring::new(self.replicas));
        let last_alive = Arc::new(Mutex::new(BTreeSet::new()));

        // everyone starts out presumed alive, so the initial ring covers the
        // seeds as well as the local node.
        rebuild(&roster, &ring, &last_alive);

        let rebuild_interval = self.rebuild_interval;
        let (shutdown, signal) = watch::channel(false);
        let engine = Arc::new(Gossip::new(self, Arc::clone(&roster), socket));

        let tasks = vec![
            task::spawn(Arc::clone(&engine).run_receive(signal.clone())),
            task::spawn(Arc::clone(&engine).run_gossip(signal.clone())),
            task::spawn(Arc::clone(&engine).run_detector(signal.clone())),
            task::spawn(run_rebuilds(
                Arc::clone(&roster),
                Arc::clone(&ring),
                Arc::clone(&last_alive),
                rebuild_interval,
                signal,
            )),
        ];

        Ok(Cluster {
            local_id,
            roster,
            ring,
            last_alive,
            shutdown,
            tasks: AsyncMutex::new(tasks),
        })
    }
}

/// A running cluster node.
///
/// All methods are safe to call concurrently with the node's background tasks;
/// this is the surface consumed by external control layers (status dashboards,
/// interactive shells), none of which affect protocol correctness.
pub struct Cluster {
    local_id: String,
    roster: Arc<Roster>,
    ring: Arc<Ring>,
    last_alive: Arc<Mutex<BTreeSet<String>>>,
    shutdown: watch::Sender<bool>,
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,
}

impl Cluster {
    /// Returns this process's own identity (`host:port` of the bound endpoint).
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Returns a point-in-time snapshot of the membership table. Read-only; no
    /// side effects.
    pub fn status(&self) -> HashMap<String, Record> {
        self.roster.snapshot()
    }

    /// Synchronously recompute the hash ring from the members currently
    /// believed alive.
    ///
    /// The periodic rebuild cycle does this on its own whenever the alive set
    /// changes; this entry point exists for on-demand control surfaces.
    pub fn rebuild_ring(&self) {
        rebuild(&self.roster, &self.ring, &self.last_alive);
    }

    /// Resolve `key` to the alive member responsible for it, per the current
    /// ring snapshot.
    ///
    /// Returns `None` when no member is believed alive.
    pub fn resolve(&self, key: &str) -> Option<String> {
        self.ring.resolve(key)
    }

    /// Forcibly declare a local verdict about `id`, as if the failure detector
    /// had decided it. The verdict gossips outward like any other; useful for
    /// failure drills and tests.
    ///
    /// Returns whether `id` was known.
    pub fn force_state(&self, id: &str, state: Health) -> bool {
        self.roster.force_state(id, state)
    }

    /// Stop all periodic cycles and release the network endpoint. Idempotent;
    /// in-flight message handling is allowed to finish, which is harmless
    /// because the protocol is self-healing against lost state.
    pub async fn shutdown(&self) {
        // send fails only when every task (receiver) is already gone.
        let _ = self.shutdown.send(true);

        let tasks = mem::take(&mut *self.tasks.lock().await);
        if tasks.is_empty() {
            return;
        }

        join_all(tasks).await;
        info!("{}: cluster node shut down", self.local_id);
    }
}

/// Recompute the ring from the alive set, and remember that set so the
/// periodic cycle can skip rebuilds when nothing changed.
fn rebuild(roster: &Roster, ring: &Ring, last_alive: &Mutex<BTreeSet<String>>) {
    let alive = roster.alive_ids();
    ring.rebuild(alive.iter().cloned());

    info!(
        "{}: hash ring rebuilt with {} alive member(s)",
        roster.local_id(),
        alive.len()
    );

    *last_alive.lock() = alive;
}

/// Periodically reconcile the ring against the alive member set, rebuilding
/// only when the set actually changed since the last rebuild.
async fn run_rebuilds(
    roster: Arc<Roster>,
    ring: Arc<Ring>,
    last_alive: Arc<Mutex<BTreeSet<String>>>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticks = interval(every);

    loop {
        select! {
            _ = shutdown.changed() => break,

            _ = ticks.tick() => {
                let changed = *last_alive.lock() != roster.alive_ids();
                if changed {
                    rebuild(&roster, &ring, &last_alive);
                }
            }
        }
    }
}
