//! Log entries and the three peer-to-peer RPCs

use serde_derive::{Deserialize, Serialize};

/// A single entry of the replicated log
///
/// The entry at the log origin (index 0, or the snapshot index after
/// compaction) is a sentinel whose command is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub command: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: u64, command: Vec<u8>) -> Self {
        LogEntry { term, command }
    }

    pub(crate) fn sentinel(term: u64) -> Self {
        LogEntry {
            term,
            command: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

/// Reply to an append
///
/// On rejection at most one of the two hints is set: `log_len` when the
/// follower's log ends before `prev_log_index`, or `conflict_term` with the
/// follower's first index for it when the terms at `prev_log_index` differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    pub conflict_term: Option<u64>,
    pub conflict_index: Option<u64>,
    pub log_len: Option<u64>,
}

impl AppendEntriesReply {
    pub(crate) fn accepted(term: u64) -> Self {
        AppendEntriesReply {
            term,
            success: true,
            conflict_term: None,
            conflict_index: None,
            log_len: None,
        }
    }

    pub(crate) fn rejected(term: u64) -> Self {
        AppendEntriesReply {
            success: false,
            ..Self::accepted(term)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSnapshotArgs {
    pub term: u64,
    pub leader_id: u64,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSnapshotReply {
    pub term: u64,
}
