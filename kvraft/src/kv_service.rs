//! Key-value gRPC service
//!
//! A request is encoded into a [`KvCommand`], submitted to raft, and answered
//! once the entry at its index has been applied. If a different command shows
//! up at that index, leadership was lost and the client must retry elsewhere.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pb::kv_service_server::KvService;
use pb::{ErrCode, GetRequest, KvReply, PutAppendRequest, WriteOp};
use tokio::sync::oneshot;
use tokio::time::{self, Duration};

use crate::metrics::record_metrics;
use crate::raft::{self, Raft};
use crate::state_kv::{Applied, KvCommand, KvOp};

#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("kv");
}

/// Waiters for applied log indices
pub struct KvStore {
    raft: Raft,
    pending: Mutex<HashMap<u64, oneshot::Sender<Applied>>>,
    request_timeout: Duration,
}

impl KvStore {
    pub fn new(raft: Raft, request_timeout: Duration) -> Self {
        KvStore {
            raft,
            pending: Mutex::new(HashMap::new()),
            request_timeout,
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Applied>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake whoever waits on `index`
    pub fn notify_applied(&self, index: u64, applied: Applied) {
        if let Some(tx) = self.pending().remove(&index) {
            let _ = tx.send(applied);
        }
    }

    /// Drop every waiter at or below `index`; their entries were replaced by
    /// a snapshot and their callers get `WrongLeader`
    pub fn drop_pending_through(&self, index: u64) {
        self.pending().retain(|i, _| *i > index);
    }

    async fn execute(&self, cmd: KvCommand) -> KvReply {
        let data = match cmd.encode() {
            Ok(data) => data,
            Err(e) => {
                log::error!("failed to encode kv command: {}", e);
                return reply(ErrCode::WrongLeader, None);
            }
        };

        let (index, rx) = {
            // held across submit so the applier cannot answer before we listen
            let mut pending = self.pending();
            match self.raft.submit(data) {
                Ok(proposed) => {
                    let (tx, rx) = oneshot::channel();
                    pending.insert(proposed.index, tx);
                    (proposed.index, rx)
                }
                Err(raft::Error::NotLeader(hint)) => {
                    return reply(ErrCode::WrongLeader, hint);
                }
                Err(e) => {
                    log::warn!("submit failed: {}", e);
                    return reply(ErrCode::WrongLeader, None);
                }
            }
        };

        match time::timeout(self.request_timeout, rx).await {
            Ok(Ok(applied)) if applied.client_id == cmd.client_id && applied.seq == cmd.seq => {
                match (cmd.op, applied.value) {
                    (KvOp::Get { .. }, None) => reply(ErrCode::NoKey, None),
                    (_, value) => KvReply {
                        err: ErrCode::Ok as i32,
                        value: value.unwrap_or_default(),
                        leader_hint: self.raft.id(),
                    },
                }
            }
            Ok(_) => reply(ErrCode::WrongLeader, None),
            Err(_) => {
                self.pending().remove(&index);
                reply(ErrCode::Timeout, None)
            }
        }
    }
}

fn reply(err: ErrCode, leader_hint: Option<u64>) -> KvReply {
    KvReply {
        err: err as i32,
        value: String::new(),
        leader_hint: leader_hint.unwrap_or(0),
    }
}

pub struct KvServiceSVC {
    store: Arc<KvStore>,
}

impl KvServiceSVC {
    pub fn new(store: Arc<KvStore>) -> Self {
        KvServiceSVC { store }
    }
}

#[tonic::async_trait]
impl KvService for KvServiceSVC {
    async fn get(
        &self,
        request: tonic::Request<GetRequest>,
    ) -> Result<tonic::Response<KvReply>, tonic::Status> {
        record_metrics("kv_get", move || async move {
            let req = request.into_inner();
            let cmd = KvCommand {
                client_id: req.client_id,
                seq: req.seq,
                op: KvOp::Get { key: req.key },
            };
            Ok(tonic::Response::new(self.store.execute(cmd).await))
        })
        .await
    }

    async fn put_append(
        &self,
        request: tonic::Request<PutAppendRequest>,
    ) -> Result<tonic::Response<KvReply>, tonic::Status> {
        record_metrics("kv_put_append", move || async move {
            let req = request.into_inner();
            let op = match WriteOp::from_i32(req.op) {
                Some(WriteOp::Put) => KvOp::Put {
                    key: req.key,
                    value: req.value,
                },
                Some(WriteOp::Append) => KvOp::Append {
                    key: req.key,
                    value: req.value,
                },
                None => {
                    return Err(tonic::Status::invalid_argument(format!(
                        "unknown write op {}",
                        req.op
                    )))
                }
            };
            let cmd = KvCommand {
                client_id: req.client_id,
                seq: req.seq,
                op,
            };
            Ok(tonic::Response::new(self.store.execute(cmd).await))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{MemStorage, RaftConfig, StateMachine};
    use crate::raft_client::RaftClient;
    use crate::server::run_applier;
    use crate::state_kv::KvStateMachine;

    fn start_node(storage: &MemStorage, max_raft_state: u64) -> (Raft, Arc<KvStore>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (raft, apply_rx) = Raft::start(
            1,
            vec![1],
            Arc::new(RaftClient::new(HashMap::new())),
            Arc::new(storage.clone()),
            RaftConfig::from_heartbeat(Duration::from_millis(20)),
        )
        .unwrap();
        let mut state_machine = KvStateMachine::new();
        let snapshot = raft.latest_snapshot();
        state_machine.restore(snapshot.index, snapshot.term, &snapshot.data);

        let store = Arc::new(KvStore::new(raft.clone(), Duration::from_secs(1)));
        tokio::spawn(run_applier(
            raft.clone(),
            store.clone(),
            state_machine,
            apply_rx,
            max_raft_state,
        ));
        (raft, store)
    }

    async fn wait_for_leadership(raft: &Raft) {
        for _ in 0..100 {
            if raft.get_state().1 {
                return;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        panic!("single node never became leader");
    }

    async fn put_append(svc: &KvServiceSVC, seq: u64, op: WriteOp, key: &str, value: &str) -> KvReply {
        let req = PutAppendRequest {
            client_id: 42,
            seq,
            op: op as i32,
            key: key.to_string(),
            value: value.to_string(),
        };
        svc.put_append(tonic::Request::new(req))
            .await
            .unwrap()
            .into_inner()
    }

    async fn get(svc: &KvServiceSVC, seq: u64, key: &str) -> KvReply {
        let req = GetRequest {
            client_id: 42,
            seq,
            key: key.to_string(),
        };
        svc.get(tonic::Request::new(req)).await.unwrap().into_inner()
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_go_through_the_log() {
        let (raft, store) = start_node(&MemStorage::new(), 0);
        wait_for_leadership(&raft).await;
        let svc = KvServiceSVC::new(store);

        let reply = put_append(&svc, 1, WriteOp::Put, "k", "a").await;
        assert_eq!(reply.err, ErrCode::Ok as i32);
        assert_eq!(reply.leader_hint, 1);
        put_append(&svc, 2, WriteOp::Append, "k", "b").await;
        // retried append is not applied twice
        put_append(&svc, 2, WriteOp::Append, "k", "b").await;

        let reply = get(&svc, 3, "k").await;
        assert_eq!(reply.err, ErrCode::Ok as i32);
        assert_eq!(reply.value, "ab");

        let reply = get(&svc, 4, "missing").await;
        assert_eq!(reply.err, ErrCode::NoKey as i32);
        assert_eq!(raft.status().commit_index, 5);
        raft.kill();
    }

    #[tokio::test(start_paused = true)]
    async fn test_killed_node_answers_wrong_leader() {
        let storage = MemStorage::new();
        let (raft, store) = start_node(&storage, 0);
        raft.kill();
        let svc = KvServiceSVC::new(store);
        let reply = get(&svc, 1, "k").await;
        assert_eq!(reply.err, ErrCode::WrongLeader as i32);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshots_bound_the_log_and_survive_restart() {
        let storage = MemStorage::new();
        let (raft, store) = start_node(&storage, 256);
        wait_for_leadership(&raft).await;
        let svc = KvServiceSVC::new(store);

        for seq in 1..=40 {
            let reply = put_append(&svc, seq, WriteOp::Append, "log", "x").await;
            assert_eq!(reply.err, ErrCode::Ok as i32);
        }
        let status = raft.status();
        assert!(status.snapshot_index > 0);
        assert!(status.last_index - status.snapshot_index < 40);
        raft.kill();

        let (raft, store) = start_node(&storage, 256);
        wait_for_leadership(&raft).await;
        let svc = KvServiceSVC::new(store);
        let reply = get(&svc, 41, "log").await;
        assert_eq!(reply.err, ErrCode::Ok as i32);
        assert_eq!(reply.value, "x".repeat(40));
        raft.kill();
    }
}
