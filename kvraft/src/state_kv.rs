//! Key-value state machine driven by the raft log
//!
//! Every client operation, reads included, goes through the log. Writes are
//! deduplicated per client by sequence number so a retried request is applied
//! at most once.

use std::collections::{BTreeMap, HashMap};

use serde_derive::{Deserialize, Serialize};

use crate::raft::StateMachine;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvOp {
    Get { key: String },
    Put { key: String, value: String },
    Append { key: String, value: String },
}

/// A client operation as stored in the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvCommand {
    pub client_id: u64,
    pub seq: u64,
    pub op: KvOp,
}

impl KvCommand {
    pub fn encode(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn decode(data: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(data)
    }
}

/// Result of applying one log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub client_id: u64,
    pub seq: u64,
    /// The value read by a `Get`; `None` for writes and missing keys
    pub value: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KvSnapshot {
    data: BTreeMap<String, String>,
    last_seq: HashMap<u64, u64>,
}

#[derive(Debug, Default)]
pub struct KvStateMachine {
    data: BTreeMap<String, String>,
    // highest write seq applied per client
    last_seq: HashMap<u64, u64>,
    last_applied: u64,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    fn is_duplicate(&self, client_id: u64, seq: u64) -> bool {
        self.last_seq
            .get(&client_id)
            .map(|last| seq <= *last)
            .unwrap_or(false)
    }
}

impl StateMachine for KvStateMachine {
    /// `None` when the entry was already covered by a snapshot or did not
    /// decode
    type Output = Option<Applied>;

    fn apply(&mut self, index: u64, command: &[u8]) -> Self::Output {
        if index <= self.last_applied {
            return None;
        }
        self.last_applied = index;

        let cmd = match KvCommand::decode(command) {
            Ok(cmd) => cmd,
            Err(e) => {
                log::error!("undecodable command at index {}: {}", index, e);
                return None;
            }
        };

        let value = match cmd.op {
            KvOp::Get { key } => self.data.get(&key).cloned(),
            KvOp::Put { key, value } => {
                if !self.is_duplicate(cmd.client_id, cmd.seq) {
                    self.data.insert(key, value);
                    self.last_seq.insert(cmd.client_id, cmd.seq);
                }
                None
            }
            KvOp::Append { key, value } => {
                if !self.is_duplicate(cmd.client_id, cmd.seq) {
                    self.data.entry(key).or_default().push_str(&value);
                    self.last_seq.insert(cmd.client_id, cmd.seq);
                }
                None
            }
        };
        Some(Applied {
            client_id: cmd.client_id,
            seq: cmd.seq,
            value,
        })
    }

    fn snapshot(&self) -> Vec<u8> {
        #[derive(Serialize)]
        struct KvSnapshotRef<'a> {
            data: &'a BTreeMap<String, String>,
            last_seq: &'a HashMap<u64, u64>,
        }
        let snapshot = KvSnapshotRef {
            data: &self.data,
            last_seq: &self.last_seq,
        };
        match bincode::serialize(&snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                // maps of strings and integers always encode
                log::error!("failed to encode kv snapshot: {}", e);
                Vec::new()
            }
        }
    }

    fn restore(&mut self, index: u64, _term: u64, data: &[u8]) {
        let snapshot = if data.is_empty() {
            KvSnapshot::default()
        } else {
            match bincode::deserialize::<KvSnapshot>(data) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    log::error!("failed to decode kv snapshot at {}: {}", index, e);
                    return;
                }
            }
        };
        self.data = snapshot.data;
        self.last_seq = snapshot.last_seq;
        self.last_applied = index;
        log::info!(
            "kv state restored at index {} with {} keys",
            index,
            self.data.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(client_id: u64, seq: u64, op: KvOp) -> Vec<u8> {
        KvCommand { client_id, seq, op }.encode().unwrap()
    }

    fn put(key: &str, value: &str) -> KvOp {
        KvOp::Put {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn append(key: &str, value: &str) -> KvOp {
        KvOp::Append {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn get(key: &str) -> KvOp {
        KvOp::Get {
            key: key.to_string(),
        }
    }

    #[test]
    fn test_put_append_get() {
        let mut sm = KvStateMachine::new();
        sm.apply(1, &cmd(7, 1, put("k", "a")));
        sm.apply(2, &cmd(7, 2, append("k", "b")));
        sm.apply(3, &cmd(8, 1, append("fresh", "x")));

        let applied = sm.apply(4, &cmd(9, 1, get("k"))).unwrap();
        assert_eq!(applied.value.as_deref(), Some("ab"));
        assert_eq!((applied.client_id, applied.seq), (9, 1));
        assert_eq!(sm.data.get("fresh").map(String::as_str), Some("x"));

        let missing = sm.apply(5, &cmd(9, 2, get("nope"))).unwrap();
        assert_eq!(missing.value, None);
    }

    #[test]
    fn test_retried_write_applies_once() {
        let mut sm = KvStateMachine::new();
        sm.apply(1, &cmd(1, 1, append("k", "x")));
        let retried = sm.apply(2, &cmd(1, 1, append("k", "x"))).unwrap();
        assert_eq!((retried.client_id, retried.seq), (1, 1));
        assert_eq!(sm.data.get("k").map(String::as_str), Some("x"));

        // older seq from the same client is ignored too
        sm.apply(3, &cmd(1, 2, put("k", "new")));
        sm.apply(4, &cmd(1, 1, put("k", "stale")));
        assert_eq!(sm.data.get("k").map(String::as_str), Some("new"));
    }

    #[test]
    fn test_entries_at_or_below_last_applied_are_skipped() {
        let mut sm = KvStateMachine::new();
        sm.apply(1, &cmd(1, 1, put("k", "v")));
        assert!(sm.apply(1, &cmd(2, 1, put("k", "w"))).is_none());
        assert_eq!(sm.data.get("k").map(String::as_str), Some("v"));
        assert!(sm.apply(2, b"garbage").is_none());
        assert_eq!(sm.last_applied(), 2);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut sm = KvStateMachine::new();
        sm.apply(1, &cmd(1, 5, put("a", "1")));
        sm.apply(2, &cmd(2, 3, put("b", "2")));
        let bytes = sm.snapshot();

        let mut restored = KvStateMachine::new();
        restored.restore(2, 1, &bytes);
        assert_eq!(restored.last_applied(), 2);
        assert_eq!(restored.data.get("a").map(String::as_str), Some("1"));
        // dedup table travels with the snapshot
        restored.apply(3, &cmd(1, 5, put("a", "dup")));
        assert_eq!(restored.data.get("a").map(String::as_str), Some("1"));

        restored.restore(9, 2, &[]);
        assert_eq!(restored.data.get("a"), None);
        assert_eq!(restored.last_applied(), 9);
    }
}
