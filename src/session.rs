//! Swarm orchestration for one download.
//!
//! A [`Session`] owns the shared piece store and output sink, keeps the set
//! of peer connections fed from the tracker, watches for stalls, and exposes
//! pause/resume/shutdown to whoever drives it. Terminal transitions
//! (`Completed`, `Failed`, `Stopped`) happen exactly once.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use log::{debug, error, info, warn};
use tokio::{
    sync::{Mutex as AsyncMutex, Notify, watch},
    task::JoinHandle,
    time::{Instant, sleep, sleep_until},
};

use crate::{
    config::Config,
    error::ApplicationError,
    manager::PieceManager,
    peer::{Connector, Peer, PeerConnection, SwarmContext, SwarmEvents},
    storage::StorageSink,
    torrent::Layout,
    tracker::PeerSource,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// No block ever arrived within the health window.
    NoData,
    /// Data used to flow but every transferring peer went away.
    PeersLost,
    /// The output file could not be written.
    Storage(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NoData => write!(f, "no data received before the timeout"),
            FailureReason::PeersLost => write!(f, "all peer connections lost"),
            FailureReason::Storage(e) => write!(f, "storage failure: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Discovering,
    Active,
    Paused,
    Completed,
    Failed(FailureReason),
    Stopped,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed(_) | SessionState::Stopped
        )
    }
}

struct Swarm {
    connected:     HashSet<Peer>,
    active:        HashSet<Peer>,
    sockets:       HashMap<Peer, JoinHandle<()>>,
    interval:      Option<Duration>,
    last_known:    Vec<Peer>,
    paused:        bool,
    has_received:  bool,
    /// Last data transfer, or session start before any data.
    last_data:     Instant,
    health:        Option<JoinHandle<()>>,
    reannounce:    Option<JoinHandle<()>>,
}

impl Swarm {
    fn new(started: Instant) -> Self {
        Self {
            connected:    HashSet::new(),
            active:       HashSet::new(),
            sockets:      HashMap::new(),
            interval:     None,
            last_known:   Vec::new(),
            paused:       false,
            has_received: false,
            last_data:    started,
            health:       None,
            reannounce:   None,
        }
    }

    fn stop_timers(&mut self) {
        if let Some(h) = self.health.take() {
            h.abort();
        }
        if let Some(h) = self.reannounce.take() {
            h.abort();
        }
    }

    /// Aborts every live connection task and forgets the swarm membership.
    fn drop_connections(&mut self) -> Vec<JoinHandle<()>> {
        let handles: Vec<_> = self.sockets.drain().map(|(_, h)| h).collect();
        for h in &handles {
            h.abort();
        }
        self.connected.clear();
        self.active.clear();
        handles
    }

    fn unhealthy(&self) -> bool {
        !self.has_received || self.active.is_empty()
    }
}

pub struct Session {
    layout:       Arc<Layout>,
    config:       Config,
    tracker:      Arc<dyn PeerSource>,
    connector:    Arc<dyn Connector>,
    pieces:       Arc<AsyncMutex<PieceManager>>,
    sink:         Arc<StorageSink>,
    swarm:        Mutex<Swarm>,
    health_reset: Notify,
    state:        watch::Sender<SessionState>,
    started:      Instant,
}

impl Session {
    pub fn new(
        layout:    Layout,
        config:    Config,
        tracker:   Arc<dyn PeerSource>,
        connector: Arc<dyn Connector>,
        sink:      StorageSink,
    ) -> Arc<Self> {
        let pieces = PieceManager::new(&layout);
        let (state, _) = watch::channel(SessionState::Discovering);
        let started = Instant::now();
        Arc::new(Self {
            layout: Arc::new(layout),
            config,
            tracker,
            connector,
            pieces: Arc::new(AsyncMutex::new(pieces)),
            sink: Arc::new(sink),
            swarm: Mutex::new(Swarm::new(started)),
            health_reset: Notify::new(),
            state,
            started,
        })
    }

    fn swarm(&self) -> MutexGuard<'_, Swarm> {
        self.swarm.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_paused(&self) -> bool {
        self.swarm().paused
    }

    /// Blocks received so far and total blocks in the torrent.
    pub async fn progress(&self) -> (usize, usize) {
        self.pieces.lock().await.progress()
    }

    /// Starts the download and waits for a terminal state, then closes the
    /// output file.
    pub async fn run(self: &Arc<Self>) -> Result<SessionState, ApplicationError> {
        let mut state = self.subscribe();
        let mut faults = self.sink.faults();
        let mut writer_alive = true;

        self.start_health();
        let session = self.clone();
        tokio::spawn(async move { session.discover(false).await });

        loop {
            if state.borrow_and_update().is_terminal() {
                break;
            }
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = faults.changed(), if writer_alive => {
                    writer_alive = changed.is_ok();
                    let fault = faults.borrow_and_update().clone();
                    if let Some(e) = fault {
                        self.finish(SessionState::Failed(FailureReason::Storage(e)));
                    }
                }
            }
        }

        let outcome = self.state();
        let (have, total) = self.progress().await;
        info!(
            "received {}/{} blocks in {:.1}s",
            have,
            total,
            self.started.elapsed().as_secs_f64()
        );

        let written = self.sink.close().await;
        match written {
            Ok(bytes) => debug!("output closed, {} bytes written", bytes),
            Err(e) if outcome == SessionState::Completed => return Err(e),
            Err(e) => warn!("closing output: {}", e),
        }
        Ok(outcome)
    }

    /// Stops timers and drops every connection. Leases held by in-flight
    /// requests are released; received blocks are kept.
    pub async fn pause(&self) {
        let handles = {
            let mut swarm = self.swarm();
            if swarm.paused {
                info!("download is already paused");
                return;
            }
            let changed = self.state.send_if_modified(|s| {
                if s.is_terminal() {
                    return false;
                }
                *s = SessionState::Paused;
                true
            });
            if !changed {
                return;
            }
            swarm.paused = true;
            info!("pausing download");
            swarm.stop_timers();
            swarm.drop_connections()
        };

        let closed = handles.len();
        for h in handles {
            let _ = h.await;
        }

        self.pieces.lock().await.reset_requested_state();
        info!("paused, closed {} peer connections", closed);
    }

    /// Restarts timers and reconnects, falling back to the last known peers
    /// when the tracker has none.
    pub async fn resume(self: &Arc<Self>) {
        {
            let mut swarm = self.swarm();
            if !swarm.paused {
                info!("download is already running");
                return;
            }
            let changed = self.state.send_if_modified(|s| {
                if s.is_terminal() {
                    return false;
                }
                *s = SessionState::Active;
                true
            });
            if !changed {
                return;
            }
            swarm.paused = false;
            swarm.connected.clear();
        }
        info!("resuming download");
        self.start_health();
        self.discover(true).await;
    }

    /// Ends the session without completing the download.
    pub fn shutdown(&self) {
        if self.finish(SessionState::Stopped) {
            info!("shutting down");
        }
    }

    /// Moves to a terminal state. Returns `false` if the session had already
    /// ended.
    fn finish(&self, outcome: SessionState) -> bool {
        let changed = self.state.send_if_modified(|s| {
            if s.is_terminal() {
                return false;
            }
            *s = outcome.clone();
            true
        });
        if !changed {
            return false;
        }

        let mut swarm = self.swarm();
        swarm.stop_timers();
        swarm.drop_connections();
        drop(swarm);

        match &outcome {
            SessionState::Completed => info!("download complete"),
            SessionState::Failed(reason) => error!("download failed: {}", reason),
            _ => {}
        }
        true
    }

    async fn discover(self: &Arc<Self>, use_cache: bool) {
        let announce = match self.tracker.get_peers().await {
            Ok(announce) => announce,
            Err(e) => {
                warn!("tracker announce failed: {}", e);
                Default::default()
            }
        };

        let mut peers = announce.peers;
        if peers.is_empty() {
            let cached = self.swarm().last_known.clone();
            if use_cache && !cached.is_empty() {
                info!("no new peers found, reconnecting to {} cached peers", cached.len());
                peers = cached;
            } else {
                warn!("no peers found from tracker, will retry");
            }
        }
        self.connect_to_peers(peers, announce.interval).await;
    }

    async fn connect_to_peers(self: &Arc<Self>, peers: Vec<Peer>, interval: Option<Duration>) {
        if self.pieces.lock().await.is_done() {
            self.finish(SessionState::Completed);
            return;
        }

        let mut swarm = self.swarm();
        if swarm.paused || self.state.borrow().is_terminal() {
            return;
        }
        self.state.send_if_modified(|s| {
            let discovering = *s == SessionState::Discovering;
            if discovering {
                *s = SessionState::Active;
            }
            discovering
        });

        if !peers.is_empty() {
            swarm.last_known = peers.clone();
        }
        swarm.interval = match interval {
            Some(i) => Some(i),
            None if swarm.interval.is_none() && peers.is_empty() => None,
            None => swarm.interval.or(Some(self.config.default_reannounce())),
        };

        let fresh: Vec<Peer> = peers
            .iter()
            .filter(|p| !swarm.connected.contains(p))
            .copied()
            .collect();
        if fresh.is_empty() && !peers.is_empty() {
            info!("all {} peers are already connected", peers.len());
        } else if !fresh.is_empty() {
            info!("attempting to connect to {} new peers", fresh.len());
        }
        for peer in fresh {
            // claim the identity before connecting so discovery can't race us
            swarm.connected.insert(peer);
            let handle = self.spawn_connection(peer);
            swarm.sockets.insert(peer, handle);
        }

        if swarm.reannounce.is_none() {
            swarm.reannounce = Some(self.spawn_reannounce());
        }
    }

    fn spawn_connection(self: &Arc<Self>, peer: Peer) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            let result = async {
                let stream = session.connector.connect(&peer).await?;
                info!("connected to peer {}", peer);
                PeerConnection::new(peer, stream, session.context()).run().await
            }
            .await;

            if let Err(e) = result {
                debug!("connection to {} ended: {}", peer, e);
            }
            session.on_peer_disconnected(&peer);
        })
    }

    fn context(self: &Arc<Self>) -> SwarmContext {
        SwarmContext {
            layout:  self.layout.clone(),
            peer_id: self.config.peer_id(),
            pieces:  self.pieces.clone(),
            sink:    self.sink.clone(),
            events:  self.clone(),
        }
    }

    /// Periodic re-announce. The interval is re-read every cycle and floored
    /// at the configured minimum.
    fn spawn_reannounce(self: &Arc<Self>) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                let interval = session
                    .swarm()
                    .interval
                    .unwrap_or(session.config.min_reannounce())
                    .max(session.config.min_reannounce());
                sleep(interval).await;

                if session.pieces.lock().await.is_done() {
                    session.finish(SessionState::Completed);
                    return;
                }
                if session.is_paused() {
                    continue;
                }
                info!("discovering more peers");
                session.discover(false).await;
            }
        })
    }

    fn start_health(self: &Arc<Self>) {
        let session = self.clone();
        let handle = tokio::spawn(async move { session.health_monitor().await });
        if let Some(old) = self.swarm().health.replace(handle) {
            old.abort();
        }
    }

    /// Fails the session when the window passes without data, logging the
    /// warning ladder on the way. Any data transfer restarts the window.
    async fn health_monitor(self: Arc<Self>) {
        let timeout = self.config.health_timeout();
        let ladder = self.config.warning_ladder();

        loop {
            let deadline = Instant::now() + timeout;
            let mut marks = ladder.iter();
            let mut next_mark = marks.next();

            let reset = loop {
                let wake = match next_mark {
                    Some(remaining) => deadline - *remaining,
                    None => deadline,
                };
                tokio::select! {
                    _ = self.health_reset.notified() => break true,
                    _ = sleep_until(wake) => {
                        match next_mark {
                            Some(remaining) => {
                                self.warn_stall(*remaining);
                                next_mark = marks.next();
                            }
                            None => break false,
                        }
                    }
                }
            };
            if reset {
                continue;
            }

            let (unhealthy, has_received) = {
                let swarm = self.swarm();
                (swarm.unhealthy(), swarm.has_received)
            };
            if unhealthy {
                let reason = if has_received {
                    FailureReason::PeersLost
                } else {
                    FailureReason::NoData
                };
                warn!("no active peer connections or data transfer detected");
                self.finish(SessionState::Failed(reason));
                return;
            }
        }
    }

    fn warn_stall(&self, remaining: Duration) {
        let swarm = self.swarm();
        if !swarm.unhealthy() {
            return;
        }
        if swarm.has_received {
            warn!(
                "no active peer connections, giving up in {}s without reconnection",
                remaining.as_secs()
            );
        } else {
            warn!(
                "no data transfer detected, giving up in {}s without progress",
                remaining.as_secs()
            );
        }
    }
}

impl SwarmEvents for Session {
    fn on_data_transfer(&self, peer: &Peer) {
        let mut swarm = self.swarm();
        swarm.has_received = true;
        swarm.last_data = Instant::now();
        swarm.active.insert(*peer);
        if !swarm.paused {
            self.health_reset.notify_one();
        }
    }

    fn on_peer_disconnected(&self, peer: &Peer) {
        let mut swarm = self.swarm();
        swarm.active.remove(peer);
        swarm.sockets.remove(peer);
        swarm.connected.remove(peer);

        if swarm.active.is_empty()
            && !swarm.paused
            && swarm.last_data.elapsed() > self.config.stall_grace()
        {
            self.health_reset.notify_one();
        }
    }

    fn on_complete(&self) {
        self.finish(SessionState::Completed);
    }
}
