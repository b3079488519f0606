//! Error types for the consensus core
//!
//! Transport failures are expected and only ever cost one round of an
//! election or replication; storage failures are fatal to the peer.

use thiserror::Error;

/// Errors surfaced by the raft core
#[derive(Debug, Error)]
pub enum Error {
    /// This peer is not the leader; `0` carries the last leader it heard from
    #[error("not the leader (last known leader: {0:?})")]
    NotLeader(Option<u64>),

    #[error("raft peer has been killed")]
    Killed,

    #[error("durable store i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("durable record codec failed: {0}")]
    Codec(#[from] bincode::Error),

    /// The durable record decoded but violates a structural invariant
    #[error("durable record is corrupt: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by a [`crate::raft::PeerTransport`]
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(u64),

    #[error("rpc to peer {0} timed out")]
    Timeout(u64),

    #[error("rpc to peer {peer} failed: {reason}")]
    Rpc { peer: u64, reason: String },
}
