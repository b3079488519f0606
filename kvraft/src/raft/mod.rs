//! Raft consensus core
//!
//! Turns a set of unreliable peers into one ordered, replicated log. The
//! service on top proposes commands with [`Raft::submit`] and consumes
//! [`ApplyMsg`]s from the delivery queue returned by [`Raft::start`].

mod errors;
mod message;
mod node;
mod raft_log;
mod storage;
mod transport;


pub use self::errors::{Error, TransportError};
pub use self::message::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply, LogEntry,
    RequestVoteArgs, RequestVoteReply,
};
pub use self::node::{Raft, RaftConfig, Role};
#[cfg(test)]
pub use self::storage::MemStorage;
pub use self::storage::FileStorage;
pub use self::transport::PeerTransport;

/// What the core hands to the service, strictly in index order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyMsg {
    /// A newly committed command
    Command { index: u64, command: Vec<u8> },
    /// A snapshot from the leader; adopt it only if
    /// [`Raft::cond_install_snapshot`] agrees
    Snapshot { term: u64, index: u64, data: Vec<u8> },
}

/// A deterministic state machine driven by the delivery queue
pub trait StateMachine {
    type Output;

    fn apply(&mut self, index: u64, command: &[u8]) -> Self::Output;
    fn snapshot(&self) -> Vec<u8>;
    fn restore(&mut self, index: u64, term: u64, data: &[u8]);
}
