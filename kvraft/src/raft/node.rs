//! Raft peer
//!
//! One [`Raft`] value per peer. All state sits behind a single mutex; the
//! ticker task and every RPC handler take it briefly and never across an
//! `.await`. Outbound RPCs run as spawned tasks that re-take the lock only to
//! interpret the reply, so a dead peer costs nothing but a timed-out task.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::Rng;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::time::{self, Duration, Instant};

use super::errors::{Error, Result, TransportError};
use super::message::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply, LogEntry,
    RequestVoteArgs, RequestVoteReply,
};
use super::raft_log::RaftLog;
use super::storage::{decode_state, encode_state, Storage};
use super::transport::PeerTransport;
use super::ApplyMsg;

const DEFAULT_HEARTBEAT: Duration = Duration::from_millis(100);

/// Timing knobs of a peer
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub rpc_timeout: Duration,
}

impl RaftConfig {
    /// Election timeouts at 2x..4x the heartbeat, RPC timeout at 2x
    pub fn from_heartbeat(heartbeat_interval: Duration) -> Self {
        RaftConfig {
            heartbeat_interval,
            election_timeout_min: heartbeat_interval * 2,
            election_timeout_max: heartbeat_interval * 4,
            rpc_timeout: heartbeat_interval * 2,
        }
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self::from_heartbeat(DEFAULT_HEARTBEAT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Where a submitted command landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposed {
    pub index: u64,
    pub term: u64,
}

/// Point-in-time view of a peer, for metrics and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftStatus {
    pub id: u64,
    pub term: u64,
    pub role: Role,
    pub leader_id: Option<u64>,
    pub commit_index: u64,
    pub applied_index: u64,
    pub snapshot_index: u64,
    pub last_index: u64,
}

/// The snapshot a restarted service restores from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotData {
    pub index: u64,
    pub term: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    next_index: u64,
    match_index: u64,
    // an append or snapshot to this peer has not come back yet
    in_flight: bool,
}

struct State {
    term: u64,
    voted_for: Option<u64>,
    role: Role,
    leader_id: Option<u64>,
    log: RaftLog,
    snapshot: Vec<u8>,
    commit_index: u64,
    applied_index: u64,
    election_deadline: Instant,
    heartbeat_deadline: Instant,
    votes: HashSet<u64>,
    // only populated while leader
    progress: HashMap<u64, Progress>,
}

struct Inner {
    me: u64,
    peers: Vec<u64>,
    transport: Arc<dyn PeerTransport>,
    storage: Arc<dyn Storage>,
    config: RaftConfig,
    state: Mutex<State>,
    apply_tx: UnboundedSender<ApplyMsg>,
    dead: AtomicBool,
    wakeup: Notify,
}

#[derive(Clone)]
pub struct Raft {
    inner: Arc<Inner>,
}

impl Raft {
    /// Restore a peer from `storage` and start its ticker.
    ///
    /// `peers` lists every member of the cluster, `me` included. Committed
    /// commands and installed snapshots come out of the returned receiver.
    pub fn start(
        me: u64,
        peers: Vec<u64>,
        transport: Arc<dyn PeerTransport>,
        storage: Arc<dyn Storage>,
        config: RaftConfig,
    ) -> Result<(Raft, UnboundedReceiver<ApplyMsg>)> {
        let (raft, apply_rx) = Self::build(me, peers, transport, storage, config)?;
        let ticker = raft.clone();
        tokio::spawn(async move {
            ticker.run_ticker().await;
        });
        Ok((raft, apply_rx))
    }

    /// Restore a peer without starting its ticker
    pub(crate) fn build(
        me: u64,
        mut peers: Vec<u64>,
        transport: Arc<dyn PeerTransport>,
        storage: Arc<dyn Storage>,
        config: RaftConfig,
    ) -> Result<(Raft, UnboundedReceiver<ApplyMsg>)> {
        if !peers.contains(&me) {
            peers.push(me);
        }
        peers.sort_unstable();
        peers.dedup();

        let (term, voted_for, log, snapshot) = match storage.read_raft_state()? {
            Some(bytes) => {
                let restored = decode_state(&bytes)?;
                (
                    restored.term,
                    restored.voted_for,
                    restored.log,
                    restored.snapshot,
                )
            }
            None => (0, None, RaftLog::new(), Vec::new()),
        };
        let snapshot_index = log.snapshot_index();
        log::info!(
            "peer {} term {}: restored, snapshot at {}, last index {}",
            me,
            term,
            snapshot_index,
            log.last_index()
        );

        let state = State {
            term,
            voted_for,
            role: Role::Follower,
            leader_id: None,
            log,
            snapshot,
            commit_index: snapshot_index,
            applied_index: snapshot_index,
            election_deadline: Instant::now(),
            heartbeat_deadline: Instant::now(),
            votes: HashSet::new(),
            progress: HashMap::new(),
        };
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let raft = Raft {
            inner: Arc::new(Inner {
                me,
                peers,
                transport,
                storage,
                config,
                state: Mutex::new(state),
                apply_tx,
                dead: AtomicBool::new(false),
                wakeup: Notify::new(),
            }),
        };
        {
            let mut st = raft.lock();
            st.election_deadline = raft.next_election_deadline();
        }
        Ok((raft, apply_rx))
    }

    pub fn id(&self) -> u64 {
        self.inner.me
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_dead(&self) -> bool {
        self.inner.dead.load(Ordering::SeqCst)
    }

    fn majority(&self) -> usize {
        self.inner.peers.len() / 2 + 1
    }

    fn others(&self) -> impl Iterator<Item = u64> + '_ {
        let me = self.inner.me;
        self.inner.peers.iter().copied().filter(move |p| *p != me)
    }

    fn next_election_deadline(&self) -> Instant {
        let cfg = &self.inner.config;
        let min = cfg.election_timeout_min.as_millis() as u64;
        let max = (cfg.election_timeout_max.as_millis() as u64).max(min);
        let timeout = rand::thread_rng().gen_range(min..=max);
        Instant::now() + Duration::from_millis(timeout)
    }

    /// Write term, vote, log and snapshot through to the store.
    ///
    /// A peer that cannot persist must not answer anybody, so failure aborts.
    fn persist(&self, st: &State) {
        let saved = encode_state(st.term, st.voted_for, &st.log, &st.snapshot)
            .and_then(|bytes| Ok(self.inner.storage.save_raft_state(&bytes)?));
        if let Err(e) = saved {
            log::error!(
                "peer {} term {}: failed to persist raft state: {}",
                self.inner.me,
                st.term,
                e
            );
            std::process::abort();
        }
    }

    /// Await one outbound RPC, giving up after the rpc timeout
    async fn bounded<T, F>(&self, peer: u64, call: F) -> std::result::Result<T, TransportError>
    where
        F: Future<Output = std::result::Result<T, TransportError>>,
    {
        time::timeout(self.inner.config.rpc_timeout, call)
            .await
            .unwrap_or(Err(TransportError::Timeout(peer)))
    }

    /// Adopt a newer term and fall back to follower. Caller persists.
    fn step_down(&self, st: &mut State, term: u64) {
        if st.role != Role::Follower {
            log::info!(
                "peer {} term {}: stepping down to follower at term {}",
                self.inner.me,
                st.term,
                term
            );
            st.election_deadline = self.next_election_deadline();
        }
        st.term = term;
        st.voted_for = None;
        st.role = Role::Follower;
        st.leader_id = None;
        st.votes.clear();
        st.progress.clear();
    }

    /// Hand every committed but undelivered entry to the delivery queue
    fn apply_outstanding(&self, st: &mut State) {
        while st.applied_index < st.commit_index {
            let index = st.applied_index + 1;
            let command = match st.log.entry(index) {
                Some(entry) => entry.command.clone(),
                None => {
                    log::error!(
                        "peer {} term {}: committed index {} missing from log (snapshot at {})",
                        self.inner.me,
                        st.term,
                        index,
                        st.log.snapshot_index()
                    );
                    return;
                }
            };
            st.applied_index = index;
            // a dropped receiver only means nobody consumes any more
            let _ = self.inner.apply_tx.send(ApplyMsg::Command { index, command });
        }
    }

    async fn run_ticker(self) {
        loop {
            if self.is_dead() {
                break;
            }
            let wake_at = self.tick();
            tokio::select! {
                _ = time::sleep_until(wake_at) => {}
                _ = self.inner.wakeup.notified() => {}
            }
        }
        log::debug!("peer {}: ticker exited", self.inner.me);
    }

    /// One turn of the ticker; returns when it wants to run again.
    ///
    /// A leader heartbeats every peer once the heartbeat is due. Woken
    /// earlier by a submission, it only feeds idle peers that are behind.
    fn tick(&self) -> Instant {
        let mut st = self.lock();
        if st.role == Role::Leader {
            let now = Instant::now();
            let heartbeat = now >= st.heartbeat_deadline;
            if heartbeat {
                st.heartbeat_deadline = now + self.inner.config.heartbeat_interval;
            }
            self.broadcast(&mut st, heartbeat);
            return st.heartbeat_deadline;
        }
        if Instant::now() >= st.election_deadline {
            self.start_election(&mut st);
        }
        if st.role == Role::Leader {
            // won a single-peer election on the spot
            return st.heartbeat_deadline;
        }
        st.election_deadline
    }

    fn start_election(&self, st: &mut State) {
        st.term += 1;
        st.role = Role::Candidate;
        st.voted_for = Some(self.inner.me);
        st.leader_id = None;
        st.votes.clear();
        st.votes.insert(self.inner.me);
        st.election_deadline = self.next_election_deadline();
        self.persist(st);
        log::info!(
            "peer {} term {}: starting election",
            self.inner.me,
            st.term
        );

        if st.votes.len() >= self.majority() {
            self.become_leader(st);
            return;
        }

        let args = RequestVoteArgs {
            term: st.term,
            candidate_id: self.inner.me,
            last_log_index: st.log.last_index(),
            last_log_term: st.log.last_term(),
        };
        for peer in self.others() {
            let raft = self.clone();
            let args = args.clone();
            tokio::spawn(async move {
                let term = args.term;
                let call = raft.inner.transport.request_vote(peer, args);
                match raft.bounded(peer, call).await {
                    Ok(reply) => raft.handle_vote_reply(peer, term, reply),
                    Err(e) => log::debug!("peer {}: request vote: {}", raft.inner.me, e),
                }
            });
        }
    }

    fn handle_vote_reply(&self, peer: u64, term: u64, reply: RequestVoteReply) {
        let mut st = self.lock();
        if self.is_dead() {
            return;
        }
        if reply.term > st.term {
            self.step_down(&mut st, reply.term);
            self.persist(&st);
            return;
        }
        if st.role != Role::Candidate || st.term != term || !reply.vote_granted {
            return;
        }
        st.votes.insert(peer);
        if st.votes.len() >= self.majority() {
            self.become_leader(&mut st);
        }
    }

    fn become_leader(&self, st: &mut State) {
        log::info!(
            "peer {} term {}: became leader with {} votes",
            self.inner.me,
            st.term,
            st.votes.len()
        );
        st.role = Role::Leader;
        st.leader_id = Some(self.inner.me);
        st.votes.clear();
        let next_index = st.log.last_index() + 1;
        st.progress = self
            .others()
            .map(|p| {
                (
                    p,
                    Progress {
                        next_index,
                        match_index: 0,
                        in_flight: false,
                    },
                )
            })
            .collect();
        st.heartbeat_deadline = Instant::now() + self.inner.config.heartbeat_interval;
        self.broadcast(st, true);
        self.inner.wakeup.notify_one();
    }

    fn broadcast(&self, st: &mut State, heartbeat: bool) {
        for peer in self.others() {
            self.replicate_to(st, peer, heartbeat);
        }
    }

    /// Send `peer` whatever it needs next: entries, a heartbeat, or the
    /// snapshot when its next entry is already compacted away.
    ///
    /// Outside a heartbeat nothing is sent to a peer that is caught up or
    /// still has an RPC outstanding.
    fn replicate_to(&self, st: &mut State, peer: u64, heartbeat: bool) {
        let last_index = st.log.last_index();
        let Some(progress) = st.progress.get_mut(&peer) else {
            return;
        };
        if !heartbeat && (progress.in_flight || progress.next_index > last_index) {
            return;
        }
        progress.in_flight = true;
        let prev_log_index = (progress.next_index.max(1) - 1).min(last_index);
        let raft = self.clone();

        let prev_log_term = match st.log.term_at(prev_log_index) {
            Some(term) if prev_log_index >= st.log.snapshot_index() => term,
            _ => {
                let args = InstallSnapshotArgs {
                    term: st.term,
                    leader_id: self.inner.me,
                    last_included_index: st.log.snapshot_index(),
                    last_included_term: st.log.snapshot_term(),
                    data: st.snapshot.clone(),
                };
                log::debug!(
                    "peer {} term {}: sending snapshot at {} to {}",
                    self.inner.me,
                    st.term,
                    args.last_included_index,
                    peer
                );
                tokio::spawn(async move {
                    let (term, index) = (args.term, args.last_included_index);
                    let call = raft.inner.transport.install_snapshot(peer, args);
                    match raft.bounded(peer, call).await {
                        Ok(reply) => raft.handle_snapshot_reply(peer, term, index, reply),
                        Err(e) => {
                            log::debug!("peer {}: install snapshot: {}", raft.inner.me, e);
                            raft.replication_failed(peer, term);
                        }
                    }
                });
                return;
            }
        };

        let args = AppendEntriesArgs {
            term: st.term,
            leader_id: self.inner.me,
            prev_log_index,
            prev_log_term,
            entries: st.log.entries_from(prev_log_index + 1).to_vec(),
            leader_commit: st.commit_index,
        };
        tokio::spawn(async move {
            let term = args.term;
            let sent_up_to = args.prev_log_index + args.entries.len() as u64;
            let call = raft.inner.transport.append_entries(peer, args);
            match raft.bounded(peer, call).await {
                Ok(reply) => raft.handle_append_reply(peer, term, sent_up_to, reply),
                Err(e) => {
                    log::debug!("peer {}: append entries: {}", raft.inner.me, e);
                    raft.replication_failed(peer, term);
                }
            }
        });
    }

    fn handle_append_reply(
        &self,
        peer: u64,
        term: u64,
        sent_up_to: u64,
        reply: AppendEntriesReply,
    ) {
        let mut st = self.lock();
        if self.is_dead() {
            return;
        }
        if reply.term > st.term {
            self.step_down(&mut st, reply.term);
            self.persist(&st);
            return;
        }
        if st.role != Role::Leader || st.term != term {
            return;
        }

        if reply.success {
            if let Some(progress) = st.progress.get_mut(&peer) {
                progress.match_index = progress.match_index.max(sent_up_to);
                progress.next_index = progress.match_index + 1;
                progress.in_flight = false;
            }
            self.advance_commit(&mut st);
            // entries submitted meanwhile go out right away
            self.replicate_to(&mut st, peer, false);
            return;
        }

        // fast backtracking
        let hint = if let Some(len) = reply.log_len {
            Some(len)
        } else if let Some(conflict_term) = reply.conflict_term {
            st.log
                .first_index_of_term(conflict_term)
                .or(reply.conflict_index)
        } else {
            reply.conflict_index
        };
        let last_index = st.log.last_index();
        let Some(progress) = st.progress.get_mut(&peer) else {
            return;
        };
        let next = hint
            .unwrap_or(progress.next_index.saturating_sub(1))
            .clamp(progress.match_index + 1, last_index + 1);
        log::trace!(
            "peer {} term {}: {} rejected append, next index {} -> {}",
            self.inner.me,
            term,
            peer,
            progress.next_index,
            next
        );
        progress.next_index = next;
        progress.in_flight = false;
    }

    /// An RPC to `peer` sent as leader of `term` failed or timed out
    fn replication_failed(&self, peer: u64, term: u64) {
        let mut st = self.lock();
        if st.role != Role::Leader || st.term != term {
            return;
        }
        if let Some(progress) = st.progress.get_mut(&peer) {
            progress.in_flight = false;
        }
    }

    fn handle_snapshot_reply(
        &self,
        peer: u64,
        term: u64,
        index: u64,
        reply: InstallSnapshotReply,
    ) {
        let mut st = self.lock();
        if self.is_dead() {
            return;
        }
        if reply.term > st.term {
            self.step_down(&mut st, reply.term);
            self.persist(&st);
            return;
        }
        if st.role != Role::Leader || st.term != term {
            return;
        }
        // The follower has only relayed the snapshot to its service and may
        // still drop it, so nothing counts as matched until an append
        // succeeds on top of it.
        if let Some(progress) = st.progress.get_mut(&peer) {
            progress.next_index = progress.next_index.max(index + 1);
            progress.in_flight = false;
        }
        self.replicate_to(&mut st, peer, false);
    }

    /// Commit the highest index a majority holds, if it is from this term
    fn advance_commit(&self, st: &mut State) {
        if st.role != Role::Leader {
            return;
        }
        let me = self.inner.me;
        let mut matched: Vec<u64> = self
            .inner
            .peers
            .iter()
            .map(|p| {
                if *p == me {
                    st.log.last_index()
                } else {
                    st.progress.get(p).map(|pr| pr.match_index).unwrap_or(0)
                }
            })
            .collect();
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[matched.len() / 2];
        if candidate > st.commit_index && st.log.term_at(candidate) == Some(st.term) {
            log::trace!(
                "peer {} term {}: commit index {} -> {}",
                me,
                st.term,
                st.commit_index,
                candidate
            );
            st.commit_index = candidate;
            self.apply_outstanding(st);
        }
    }

    /// Handle an incoming RequestVote
    pub fn request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let mut st = self.lock();
        if self.is_dead() || args.term < st.term {
            return RequestVoteReply {
                term: st.term,
                vote_granted: false,
            };
        }

        let mut dirty = false;
        if args.term > st.term {
            self.step_down(&mut st, args.term);
            dirty = true;
        }
        let free = st.voted_for.is_none() || st.voted_for == Some(args.candidate_id);
        let granted = free && st.log.is_up_to_date(args.last_log_index, args.last_log_term);
        if granted {
            if st.voted_for != Some(args.candidate_id) {
                st.voted_for = Some(args.candidate_id);
                dirty = true;
            }
            st.role = Role::Follower;
            st.election_deadline = self.next_election_deadline();
            log::debug!(
                "peer {} term {}: voted for {}",
                self.inner.me,
                st.term,
                args.candidate_id
            );
        }
        if dirty {
            self.persist(&st);
        }
        RequestVoteReply {
            term: st.term,
            vote_granted: granted,
        }
    }

    /// Handle an incoming AppendEntries
    pub fn append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        let mut st = self.lock();
        if self.is_dead() || args.term < st.term {
            return AppendEntriesReply::rejected(st.term);
        }

        let mut dirty = false;
        if args.term > st.term {
            self.step_down(&mut st, args.term);
            dirty = true;
        }
        if st.role != Role::Follower {
            log::info!(
                "peer {} term {}: leader {} found, back to follower",
                self.inner.me,
                st.term,
                args.leader_id
            );
        }
        st.role = Role::Follower;
        st.leader_id = Some(args.leader_id);
        st.election_deadline = self.next_election_deadline();

        let reply = self.try_append(&mut st, &args, &mut dirty);
        if dirty {
            self.persist(&st);
        }
        reply
    }

    fn try_append(
        &self,
        st: &mut State,
        args: &AppendEntriesArgs,
        dirty: &mut bool,
    ) -> AppendEntriesReply {
        let term = st.term;
        let mut prev_index = args.prev_log_index;
        let mut prev_term = args.prev_log_term;
        let mut entries = &args.entries[..];

        // the part of the batch inside our snapshot is already committed here
        let snapshot_index = st.log.snapshot_index();
        if prev_index < snapshot_index {
            let covered = (snapshot_index - prev_index) as usize;
            if covered > entries.len() {
                return AppendEntriesReply::accepted(term);
            }
            entries = &entries[covered..];
            prev_index = snapshot_index;
            prev_term = st.log.snapshot_term();
        }

        if prev_index > st.log.last_index() {
            return AppendEntriesReply {
                log_len: Some(st.log.last_index() + 1),
                ..AppendEntriesReply::rejected(term)
            };
        }
        if let Some(conflict_term) = st.log.term_at(prev_index).filter(|t| *t != prev_term) {
            return AppendEntriesReply {
                conflict_term: Some(conflict_term),
                conflict_index: st.log.first_index_of_term(conflict_term),
                ..AppendEntriesReply::rejected(term)
            };
        }

        for (offset, entry) in entries.iter().enumerate() {
            let index = prev_index + 1 + offset as u64;
            match st.log.term_at(index) {
                Some(t) if t == entry.term => continue,
                Some(_) => {
                    log::debug!(
                        "peer {} term {}: truncating divergent log from {}",
                        self.inner.me,
                        term,
                        index
                    );
                    st.log.truncate_from(index);
                }
                None => {}
            }
            for entry in &entries[offset..] {
                st.log.append(entry.clone());
            }
            *dirty = true;
            break;
        }

        let last_new = prev_index + entries.len() as u64;
        if args.leader_commit > st.commit_index {
            st.commit_index = st.commit_index.max(args.leader_commit.min(last_new));
            self.apply_outstanding(st);
        }
        AppendEntriesReply::accepted(term)
    }

    /// Handle an incoming InstallSnapshot.
    ///
    /// The snapshot is only relayed to the service here; it is adopted once
    /// the service confirms through [`Raft::cond_install_snapshot`].
    pub fn install_snapshot(&self, args: InstallSnapshotArgs) -> InstallSnapshotReply {
        let mut st = self.lock();
        if self.is_dead() || args.term < st.term {
            return InstallSnapshotReply { term: st.term };
        }
        if args.term > st.term {
            self.step_down(&mut st, args.term);
            self.persist(&st);
        }
        st.role = Role::Follower;
        st.leader_id = Some(args.leader_id);
        st.election_deadline = self.next_election_deadline();

        if args.last_included_index > st.commit_index {
            log::info!(
                "peer {} term {}: received snapshot at {} from {}",
                self.inner.me,
                st.term,
                args.last_included_index,
                args.leader_id
            );
            let _ = self.inner.apply_tx.send(ApplyMsg::Snapshot {
                term: args.last_included_term,
                index: args.last_included_index,
                data: args.data,
            });
        }
        InstallSnapshotReply { term: st.term }
    }

    /// Propose a command. Returns immediately; the command shows up on the
    /// delivery queue once committed.
    pub fn submit(&self, command: Vec<u8>) -> Result<Proposed> {
        let mut st = self.lock();
        if self.is_dead() {
            return Err(Error::Killed);
        }
        if st.role != Role::Leader {
            return Err(Error::NotLeader(st.leader_id));
        }
        let term = st.term;
        let index = st.log.append(LogEntry::new(term, command));
        self.persist(&st);
        self.advance_commit(&mut st);
        self.inner.wakeup.notify_one();
        log::trace!(
            "peer {} term {}: submitted index {}",
            self.inner.me,
            term,
            index
        );
        Ok(Proposed { index, term })
    }

    /// Current term and whether this peer believes it is leader
    pub fn get_state(&self) -> (u64, bool) {
        let st = self.lock();
        (st.term, st.role == Role::Leader)
    }

    /// The service has snapshotted everything through `index`; drop that
    /// prefix of the log
    pub fn snapshot(&self, index: u64, data: Vec<u8>) {
        let mut st = self.lock();
        if index <= st.log.snapshot_index() || index > st.applied_index {
            log::debug!(
                "peer {} term {}: ignoring snapshot at {} (snapshot {}, applied {})",
                self.inner.me,
                st.term,
                index,
                st.log.snapshot_index(),
                st.applied_index
            );
            return;
        }
        if st.log.compact_to(index) {
            st.snapshot = data;
            self.persist(&st);
            log::info!(
                "peer {} term {}: compacted log through {}",
                self.inner.me,
                st.term,
                index
            );
        }
    }

    /// Adopt a snapshot previously handed out as [`ApplyMsg::Snapshot`],
    /// unless this peer has since committed past it
    pub fn cond_install_snapshot(&self, term: u64, index: u64, data: Vec<u8>) -> bool {
        let mut st = self.lock();
        if self.is_dead() || index <= st.commit_index {
            log::debug!(
                "peer {} term {}: rejecting stale snapshot at {} (commit {})",
                self.inner.me,
                st.term,
                index,
                st.commit_index
            );
            return false;
        }
        st.log.install_snapshot(index, term);
        st.snapshot = data;
        st.commit_index = index;
        st.applied_index = index;
        self.persist(&st);
        log::info!(
            "peer {} term {}: installed snapshot at {}",
            self.inner.me,
            st.term,
            index
        );
        true
    }

    /// Stop the peer. The ticker exits and handlers refuse new work.
    pub fn kill(&self) {
        self.inner.dead.store(true, Ordering::SeqCst);
        self.inner.wakeup.notify_one();
    }

    pub fn status(&self) -> RaftStatus {
        let st = self.lock();
        RaftStatus {
            id: self.inner.me,
            term: st.term,
            role: st.role,
            leader_id: st.leader_id,
            commit_index: st.commit_index,
            applied_index: st.applied_index,
            snapshot_index: st.log.snapshot_index(),
            last_index: st.log.last_index(),
        }
    }

    /// Bytes of the durable record
    pub fn raft_state_size(&self) -> u64 {
        self.inner.storage.raft_state_size()
    }

    pub fn latest_snapshot(&self) -> SnapshotData {
        let st = self.lock();
        SnapshotData {
            index: st.log.snapshot_index(),
            term: st.log.snapshot_term(),
            data: st.snapshot.clone(),
        }
    }
}
