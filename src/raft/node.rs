// Raft node: the public handle and the single-threaded driver loop
// The driver serializes every engine interaction; one Ready is in flight at
// a time, processed persist-send-apply-advance in that order

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use prost::Message as _;
use raft::eraftpb::{ConfChange, ConfChangeType, ConfState, Entry, EntryType, HardState, Message};
use raft::{Error as RaftError, RawNode, StorageError};
use slog::o;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::raft::config::RaftConfig;
use crate::raft::line::{Line, Waiter};
use crate::raft::memstore::MemStorage;
use crate::raft::request::{NodeInfo, Request, RequestId, Response, SeqGen};
use crate::raft::snapshot::SnapStore;
use crate::raft::storage::DiskStorage;
use crate::raft::store::{NullListener, SendFn, StatusChange, StatusListener, Store};
use crate::raft::wal::Wal;

enum DriverMsg {
    Propose { data: Vec<u8> },
    ProposeConfChange { cc: ConfChange },
    Step(Box<Message>),
    Campaign { reply: oneshot::Sender<Result<(), Error>> },
}

/// Handle to one consensus replica. Cheap to share behind an `Arc`; every
/// public operation is safe to call concurrently.
#[derive(Debug)]
pub struct RaftNode<S: Store> {
    id: u64,
    gen: SeqGen,
    line: Arc<Line<S::Reply>>,
    tx: Sender<DriverMsg>,
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    leader: Arc<AtomicU64>,
}

/// Builder for [`RaftNode`] instances.
pub struct RaftNodeBuilder<S: Store> {
    id: u64,
    config: RaftConfig,
    peers: Vec<NodeInfo>,
    store: Option<Arc<S>>,
    send: Option<SendFn>,
    listener: Option<Box<dyn StatusListener>>,
    ticker: Option<Receiver<Instant>>,
}

impl<S: Store> RaftNodeBuilder<S> {
    pub fn new() -> Self {
        Self {
            id: 0,
            config: RaftConfig::default(),
            peers: Vec::new(),
            store: None,
            send: None,
            listener: None,
            ticker: None,
        }
    }

    pub fn id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn config(mut self, config: RaftConfig) -> Self {
        self.config = config;
        self
    }

    /// Initial peer set for a brand-new cluster. Ignored when a WAL already
    /// exists in the data directory.
    pub fn peers(mut self, peers: Vec<NodeInfo>) -> Self {
        self.peers = peers;
        self
    }

    pub fn store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport(mut self, send: impl Fn(Vec<Message>) + Send + 'static) -> Self {
        self.send = Some(Box::new(send));
        self
    }

    pub fn listener(mut self, listener: impl StatusListener) -> Self {
        self.listener = Some(Box::new(listener));
        self
    }

    /// Overrides the tick source; tests pass a manual channel to pause or
    /// single-step the logical clock.
    pub fn ticker(mut self, ticker: Receiver<Instant>) -> Self {
        self.ticker = Some(ticker);
        self
    }

    pub fn build(self) -> Result<RaftNode<S>, Error> {
        let store = self.store.ok_or(Error::InvalidParam)?;
        let send = self.send.unwrap_or_else(|| Box::new(|_| {}));
        let listener = self
            .listener
            .unwrap_or_else(|| Box::new(NullListener) as Box<dyn StatusListener>);
        let ticker = self.ticker.unwrap_or_else(|| self.config.ticker());
        RaftNode::start(self.config, self.id, self.peers, store, send, listener, ticker)
    }
}

impl<S: Store> Default for RaftNodeBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Store> RaftNode<S> {
    pub fn builder() -> RaftNodeBuilder<S> {
        RaftNodeBuilder::new()
    }

    /// Boots the replica and spawns its driver thread.
    fn start(
        config: RaftConfig,
        id: u64,
        peers: Vec<NodeInfo>,
        store: Arc<S>,
        send: SendFn,
        listener: Box<dyn StatusListener>,
        ticker: Receiver<Instant>,
    ) -> Result<Self, Error> {
        let engine_config = config.to_engine_config(id)?;
        let boot = prepare(&config, id, &peers, &store)?;

        let logger = slog::Logger::root(slog::Discard, o!());
        let raw = RawNode::new(&engine_config, boot.mem.clone(), &logger)?;

        // Headroom across snapshots keeps post-restart sequences from
        // colliding with any sequence persisted in the log.
        let gen = SeqGen::new(boot.last_index + 2 * config.snapshot_count);
        let line = Arc::new(Line::new());
        let leader = Arc::new(AtomicU64::new(0));
        let (tx, rx) = unbounded();
        let (stop_tx, stop_rx) = bounded(1);
        let (done_guard, done_rx) = bounded(0);

        let (snap_index, conf_state) = {
            let core = boot.mem.rl();
            (core.snapshot_index(), core.conf_state())
        };
        let driver = Driver {
            id,
            raw,
            mem: boot.mem,
            disk: boot.disk,
            store,
            line: Arc::clone(&line),
            send,
            listener,
            snapshot_count: config.snapshot_count,
            snap_index,
            applied_index: snap_index,
            conf_state,
            prev_leader: None,
            leader: Arc::clone(&leader),
            rx,
            stop_rx,
            ticker,
            done_guard,
        };
        thread::Builder::new()
            .name(format!("apiary-raft-{id}"))
            .spawn(move || driver.run())?;

        Ok(Self {
            id,
            gen,
            line,
            tx,
            stop_tx,
            done_rx,
            leader,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The current leader's id, or 0 when none is known.
    pub fn leader_id(&self) -> u64 {
        self.leader.load(Ordering::Relaxed)
    }

    pub fn is_leader(&self) -> bool {
        self.id == self.leader_id()
    }

    /// Waits until some replica is known to lead, up to `timeout`.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<u64> {
        let deadline = Instant::now() + timeout;
        loop {
            let leader = self.leader_id();
            if leader != 0 {
                return Some(leader);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Number of requests currently awaiting a reply.
    pub fn inflight(&self) -> usize {
        self.line.len()
    }

    fn next_id(&self) -> RequestId {
        RequestId {
            node: self.id,
            seq: self.gen.next(),
        }
    }

    fn submit(&self, cmd: S::Command) -> Result<Waiter<S::Reply>, Error> {
        let req = Request {
            id: self.next_id(),
            data: Some(cmd),
        };
        let data = serde_json::to_vec(&req)?;
        debug!(node = self.id, id = %req.id, "proposing request");
        // Register before proposing so an immediate apply on a colocated
        // leader cannot race ahead of the wait.
        let waiter = self.line.wait(req.id);
        self.tx
            .send(DriverMsg::Propose { data })
            .map_err(|_| Error::Stopped)?;
        Ok(waiter)
    }

    /// Proposes `cmd` for replication and blocks until it is applied.
    /// Returns the store-produced reply, the store's error, or
    /// [`Error::Stopped`]. Dropping the future frees the wait slot; the
    /// proposal itself may still be applied, and its reply is then discarded.
    pub async fn process(&self, cmd: S::Command) -> Result<Option<S::Reply>, Error> {
        self.submit(cmd)?.recv().await
    }

    /// [`RaftNode::process`] with explicit cancellation. Cancellation never
    /// unproposes: the outcome of a canceled request is unknown until the
    /// caller observes state.
    pub async fn process_with(
        &self,
        cmd: S::Command,
        cancel: &CancellationToken,
    ) -> Result<Option<S::Reply>, Error> {
        let waiter = self.submit(cmd)?;
        tokio::select! {
            res = waiter.recv() => res,
            _ = cancel.cancelled() => Err(Error::Canceled),
        }
    }

    /// Proposes adding `id` at `addr` to the cluster and blocks until the
    /// membership change is applied.
    pub async fn add_node(&self, id: u64, addr: impl Into<String>) -> Result<(), Error> {
        let mut cc = ConfChange::default();
        cc.set_change_type(ConfChangeType::AddNode);
        cc.node_id = id;
        self.process_conf_change(cc, NodeInfo::new(id, addr)).await
    }

    /// Proposes removing `id` from the cluster and blocks until the
    /// membership change is applied.
    pub async fn remove_node(&self, id: u64, addr: impl Into<String>) -> Result<(), Error> {
        let mut cc = ConfChange::default();
        cc.set_change_type(ConfChangeType::RemoveNode);
        cc.node_id = id;
        self.process_conf_change(cc, NodeInfo::new(id, addr)).await
    }

    /// General form of [`add_node`](RaftNode::add_node) /
    /// [`remove_node`](RaftNode::remove_node): the encoded request envelope
    /// rides in the conf-change context so the applier can wake this caller.
    pub async fn process_conf_change(&self, mut cc: ConfChange, info: NodeInfo) -> Result<(), Error> {
        let req = Request {
            id: self.next_id(),
            data: Some(info),
        };
        cc.context = serde_json::to_vec(&req)?.into();
        debug!(node = self.id, id = %req.id, target = cc.node_id, "proposing conf change");
        let waiter = self.line.wait(req.id);
        self.tx
            .send(DriverMsg::ProposeConfChange { cc })
            .map_err(|_| Error::Stopped)?;
        waiter.recv().await.map(|_| ())
    }

    /// Forces this replica to start a leader election.
    pub async fn campaign(&self) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DriverMsg::Campaign { reply })
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)?
    }

    /// Delivers an inbound raft protocol message from a peer.
    pub fn step(&self, msg: Message) -> Result<(), Error> {
        self.tx
            .send(DriverMsg::Step(Box::new(msg)))
            .map_err(|_| Error::Stopped)
    }

    /// Shuts the replica down. Idempotent; returns only after the driver
    /// loop has exited and storage is closed. Pending callers observe
    /// [`Error::Stopped`].
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
        // The driver drops its end of the done channel once cleanup is over.
        let _ = self.done_rx.recv();
        info!(node = self.id, "stopped");
    }
}

struct Bootstrap {
    mem: MemStorage,
    disk: DiskStorage,
    last_index: u64,
}

/// Loads durable state (or bootstraps a fresh node) and builds the storage
/// pair the driver owns.
fn prepare<S: Store>(
    config: &RaftConfig,
    id: u64,
    peers: &[NodeInfo],
    store: &Arc<S>,
) -> Result<Bootstrap, Error> {
    let wal_dir = config.wal_dir();
    let snaps = SnapStore::new(&config.snapshot_dir())?;

    if !Wal::exists(&wal_dir) {
        info!(node = id, "no write-ahead log found, starting new node");
        let mut wal = Wal::create(&wal_dir, id)?;
        let mem = MemStorage::new();
        let entries = bootstrap_entries(peers)?;
        let mut last_index = 0;
        if !entries.is_empty() {
            let mut hs = HardState::default();
            hs.term = 1;
            hs.commit = entries.len() as u64;
            wal.save(Some(&hs), &entries)?;
            let mut core = mem.wl();
            core.set_hard_state(hs);
            core.append(&entries)?;
            last_index = entries.len() as u64;
        }
        return Ok(Bootstrap {
            mem,
            disk: DiskStorage::new(wal, snaps),
            last_index,
        });
    }

    let snapshot = snaps.load()?;
    let mut snap_index = 0;
    if let Some(snap) = &snapshot {
        store.restore(snap.get_data())?;
        snap_index = snap.get_metadata().index;
        info!(node = id, index = snap_index, "restarting from snapshot");
    }

    let (wal, wal_id, hard_state, entries) = Wal::open(&wal_dir, snap_index)?;
    if wal_id != id {
        return Err(Error::WalIdMismatch {
            expected: id,
            found: wal_id,
        });
    }

    let mem = MemStorage::new();
    {
        let mut core = mem.wl();
        if let Some(snap) = snapshot {
            core.apply_snapshot(snap)?;
        }
        if let Some(hs) = hard_state {
            core.set_hard_state(hs);
        }
        core.append(&entries)?;
    }
    let last_index = entries.last().map(|e| e.index).unwrap_or(snap_index);
    Ok(Bootstrap {
        mem,
        disk: DiskStorage::new(wal, snaps),
        last_index,
    })
}

/// A brand-new cluster boots by committing one membership entry per initial
/// peer, each carrying the peer's encoded info, so every address reaches the
/// store through the same path as a runtime join.
fn bootstrap_entries(peers: &[NodeInfo]) -> Result<Vec<Entry>, Error> {
    peers
        .iter()
        .enumerate()
        .map(|(i, peer)| {
            let mut cc = ConfChange::default();
            cc.set_change_type(ConfChangeType::AddNode);
            cc.node_id = peer.id;
            cc.context = serde_json::to_vec(peer)?.into();
            let mut entry = Entry::default();
            entry.set_entry_type(EntryType::EntryConfChange);
            entry.term = 1;
            entry.index = i as u64 + 1;
            entry.data = cc.encode_to_vec().into();
            Ok(entry)
        })
        .collect()
}

struct Driver<S: Store> {
    id: u64,
    raw: RawNode<MemStorage>,
    mem: MemStorage,
    disk: DiskStorage,
    store: Arc<S>,
    line: Arc<Line<S::Reply>>,
    send: SendFn,
    listener: Box<dyn StatusListener>,
    snapshot_count: u64,
    snap_index: u64,
    applied_index: u64,
    conf_state: ConfState,
    prev_leader: Option<u64>,
    leader: Arc<AtomicU64>,
    rx: Receiver<DriverMsg>,
    stop_rx: Receiver<()>,
    ticker: Receiver<Instant>,
    done_guard: Sender<()>,
}

impl<S: Store> Driver<S> {
    fn run(mut self) {
        info!(node = self.id, "raft driver started");
        match self.drive() {
            Ok(()) => info!(node = self.id, "raft driver exiting"),
            Err(err) => error!(node = self.id, %err, "raft driver halted by fatal error"),
        }
        // Wake every pending caller, then release storage. The done channel
        // closes last so `stop` observes a fully cleaned-up node.
        self.line.drain();
        let Driver {
            id, disk, done_guard, ..
        } = self;
        if let Err(err) = disk.close() {
            error!(node = id, %err, "error closing storage");
        }
        drop(done_guard);
    }

    fn drive(&mut self) -> Result<(), Error> {
        let mut ticker_gone = false;
        loop {
            self.on_ready()?;
            if ticker_gone {
                // Tick source dropped; keep serving without a clock.
                self.ticker = crossbeam_channel::never();
                ticker_gone = false;
            }
            crossbeam_channel::select! {
                recv(self.ticker) -> tick => {
                    if tick.is_ok() {
                        self.raw.tick();
                    } else {
                        ticker_gone = true;
                    }
                }
                recv(self.rx) -> msg => match msg {
                    Ok(DriverMsg::Propose { data }) => {
                        if let Err(err) = self.raw.propose(vec![], data) {
                            // The proposal never entered the log; the caller
                            // times out and its slot is reclaimed on cancel.
                            warn!(node = self.id, %err, "proposal dropped");
                        }
                    }
                    Ok(DriverMsg::ProposeConfChange { cc }) => {
                        if let Err(err) = self.raw.propose_conf_change(vec![], cc) {
                            warn!(node = self.id, %err, "conf change proposal dropped");
                        }
                    }
                    Ok(DriverMsg::Step(msg)) => {
                        if let Err(err) = self.raw.step(*msg) {
                            warn!(node = self.id, %err, "failed to step raft message");
                        }
                    }
                    Ok(DriverMsg::Campaign { reply }) => {
                        let _ = reply.send(self.raw.campaign().map_err(Error::from));
                    }
                    Err(_) => return Ok(()),
                },
                recv(self.stop_rx) -> _ => return Ok(()),
            }
        }
    }

    /// Processes every pending Ready batch in strict order: persist, then
    /// send, then apply, then advance.
    fn on_ready(&mut self) -> Result<(), Error> {
        while self.raw.has_ready() {
            let mut ready = self.raw.ready();

            if let Some(ss) = ready.ss() {
                self.note_leader(ss.leader_id);
            }

            let snapshot = ready.snapshot().clone();
            if !snapshot.is_empty() && snapshot.get_metadata().index > self.snap_index {
                self.disk.save_snapshot(&snapshot)?;
                self.mem.wl().apply_snapshot(snapshot.clone())?;
                self.snap_index = snapshot.get_metadata().index;
                self.conf_state = snapshot.get_metadata().get_conf_state().clone();
                info!(node = self.id, index = self.snap_index, "saved incoming snapshot");
            }

            self.disk.save(ready.hs(), ready.entries())?;
            self.mem.wl().append(ready.entries())?;

            let mut messages = ready.take_messages();
            messages.extend(ready.take_persisted_messages());
            if !messages.is_empty() {
                (self.send)(messages);
            }

            if !snapshot.is_empty() && snapshot.get_metadata().index > self.applied_index {
                self.store.restore(snapshot.get_data())?;
                self.applied_index = snapshot.get_metadata().index;
                info!(
                    node = self.id,
                    index = self.applied_index,
                    "recovered store from incoming snapshot"
                );
            }

            let committed = ready.take_committed_entries();
            self.apply(committed)?;

            let mut light = self.raw.advance(ready);
            if let Some(commit) = light.commit_index() {
                self.mem.wl().set_commit(commit);
            }
            let messages = light.take_messages();
            if !messages.is_empty() {
                (self.send)(messages);
            }
            self.apply(light.take_committed_entries())?;
            self.raw.advance_apply();

            self.maybe_snapshot()?;
        }
        Ok(())
    }

    fn note_leader(&mut self, new: u64) {
        if let Some(old) = self.prev_leader {
            if old != new {
                info!(node = self.id, old, new, "leader changed");
                self.listener
                    .on_status_change(StatusChange::LeaderChanged { old, new });
            }
        }
        self.prev_leader = Some(new);
        self.leader.store(new, Ordering::Relaxed);
    }

    fn apply(&mut self, entries: Vec<Entry>) -> Result<(), Error> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        if first.index > self.applied_index + 1 {
            return Err(Error::LogGap {
                first: first.index,
                applied: self.applied_index,
            });
        }
        for entry in entries {
            if entry.index <= self.applied_index {
                continue;
            }
            match entry.entry_type() {
                EntryType::EntryNormal => self.apply_entry(&entry)?,
                EntryType::EntryConfChange => self.apply_conf_change(&entry)?,
                EntryType::EntryConfChangeV2 => return Err(Error::UnexpectedEntry(entry.index)),
            }
            self.applied_index = entry.index;
        }
        Ok(())
    }

    fn apply_entry(&mut self, entry: &Entry) -> Result<(), Error> {
        if entry.data.is_empty() {
            debug!(node = self.id, index = entry.index, "entry has no data");
            return Ok(());
        }
        // The log is a trusted source: decode failures are fatal.
        let req: Request<S::Command> = serde_json::from_slice(&entry.data)?;
        let Some(cmd) = req.data else {
            return Ok(());
        };
        debug!(node = self.id, id = %req.id, index = entry.index, "applying entry");
        let result = self.store.apply(cmd);
        self.line.call(Response { id: req.id, result });
        Ok(())
    }

    fn apply_conf_change(&mut self, entry: &Entry) -> Result<(), Error> {
        let cc = ConfChange::decode(&entry.data[..])?;
        debug!(node = self.id, index = entry.index, target = cc.node_id, "applying conf change");

        if cc.change_type() == ConfChangeType::AddLearnerNode {
            return Err(Error::UnexpectedEntry(entry.index));
        }
        if let Err(err) = self.validate_conf_change(&cc) {
            warn!(node = self.id, target = cc.node_id, %err, "rejecting invalid conf change");
            // Neuter the change but still feed it to the engine so it
            // advances past the entry.
            let mut neutered = cc;
            neutered.node_id = 0;
            self.conf_state = self.raw.apply_conf_change(&neutered)?;
            return Ok(());
        }

        self.conf_state = self.raw.apply_conf_change(&cc)?;

        if cc.context.is_empty() {
            if let Err(err) = self.store.apply_conf_change(&cc, NodeInfo::default()) {
                warn!(node = self.id, %err, "store rejected conf change");
            }
            return Ok(());
        }
        if let Ok(info) = serde_json::from_slice::<NodeInfo>(&cc.context) {
            if info.id != cc.node_id {
                return Err(Error::ConfChangeMismatch {
                    context: info.id,
                    target: cc.node_id,
                });
            }
            if let Err(err) = self.store.apply_conf_change(&cc, info) {
                warn!(node = self.id, %err, "store rejected conf change");
            }
            return Ok(());
        }
        // The context must be either a bare node info or a request envelope.
        let req: Request<NodeInfo> = serde_json::from_slice(&cc.context)?;
        let info = req.data.unwrap_or_default();
        let result = self.store.apply_conf_change(&cc, info).map(|()| None);
        self.line.call(Response { id: req.id, result });
        Ok(())
    }

    fn validate_conf_change(&self, cc: &ConfChange) -> Result<(), Error> {
        if cc.node_id == 0 {
            return Err(Error::InvalidParam);
        }
        let member = self.conf_state.voters.contains(&cc.node_id);
        match cc.change_type() {
            ConfChangeType::AddNode if member => Err(Error::DuplicateHive),
            ConfChangeType::RemoveNode if !member => Err(Error::NoSuchHive),
            _ => Ok(()),
        }
    }

    fn maybe_snapshot(&mut self) -> Result<(), Error> {
        if self.applied_index - self.snap_index <= self.snapshot_count {
            return Ok(());
        }
        info!(
            node = self.id,
            applied = self.applied_index,
            last_snapshot = self.snap_index,
            "taking snapshot"
        );
        let data = self.store.save()?;
        let snapshot =
            match self
                .mem
                .wl()
                .compact_to(self.applied_index, self.conf_state.clone(), data)
            {
                Ok(snapshot) => snapshot,
                Err(RaftError::Store(StorageError::Compacted)) => {
                    // A raced, newer compaction already covers this index.
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };
        self.disk.cut()?;
        self.disk.save_snapshot(&snapshot)?;
        self.snap_index = self.applied_index;
        info!(node = self.id, index = self.snap_index, "compacted log");
        Ok(())
    }
}
