use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use prometheus::{Encoder, TextEncoder};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

use crate::config::RuntimeConfig;
use crate::kv_service::pb::kv_service_server::KvServiceServer;
use crate::kv_service::{KvServiceSVC, KvStore};
use crate::metrics;
use crate::raft::{ApplyMsg, FileStorage, Raft, Role, StateMachine};
use crate::raft_client::RaftClient;
use crate::raft_service::pb::raft_service_server::RaftServiceServer;
use crate::raft_service::RaftServiceSVC;
use crate::state_kv::KvStateMachine;

const STATUS_INTERVAL: Duration = Duration::from_secs(1);

pub struct Server {
    config: RuntimeConfig,
    raft: Raft,
    store: Arc<KvStore>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    /// Restore the raft peer and the kv state from disk and start applying
    pub fn new(config: RuntimeConfig) -> anyhow::Result<Self> {
        let storage = FileStorage::new(&config.base_path)
            .with_context(|| format!("failed to open raft store at {}", config.base_path))?;
        let transport = RaftClient::new(config.peer_addrs());
        let (raft, apply_rx) = Raft::start(
            config.id,
            config.peer_ids(),
            Arc::new(transport),
            Arc::new(storage),
            config.raft_config(),
        )
        .context("failed to restore raft state")?;

        let mut state_machine = KvStateMachine::new();
        let snapshot = raft.latest_snapshot();
        state_machine.restore(snapshot.index, snapshot.term, &snapshot.data);

        let store = Arc::new(KvStore::new(raft.clone(), config.request_timeout()));
        let applier = tokio::spawn(run_applier(
            raft.clone(),
            store.clone(),
            state_machine,
            apply_rx,
            config.max_raft_state,
        ));

        Ok(Server {
            config,
            raft,
            store,
            tasks: vec![applier],
        })
    }

    pub async fn start(&mut self) -> anyhow::Result<()> {
        self.start_grpc_server()?;
        self.start_metrics_server()?;
        self.start_status_reporter();
        Ok(())
    }

    pub fn stop(&mut self) {
        self.raft.kill();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        log::info!("server stop");
    }

    fn start_grpc_server(&mut self) -> anyhow::Result<()> {
        let addr: SocketAddr = self
            .config
            .addr
            .parse()
            .with_context(|| format!("bad grpc address {}", self.config.addr))?;
        let raft_service = RaftServiceSVC::new(self.raft.clone());
        let kv_service = KvServiceSVC::new(self.store.clone());
        let grpc_server = tonic::transport::Server::builder()
            .add_service(RaftServiceServer::new(raft_service))
            .add_service(KvServiceServer::new(kv_service))
            .serve(addr);
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = grpc_server.await {
                log::error!("grpc server failed: {}", e);
            }
        }));
        log::info!("grpc server started on {}", addr);
        Ok(())
    }

    fn start_metrics_server(&mut self) -> anyhow::Result<()> {
        let addr: SocketAddr = self
            .config
            .metrics_addr
            .parse()
            .with_context(|| format!("bad metrics address {}", self.config.metrics_addr))?;
        let make_svc = make_service_fn(move |_| {
            let registry = metrics::REGISTRY_INSTANCE.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                            log::error!("failed to encode metrics: {}", e);
                        }
                        Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                    }
                }))
            }
        });
        metrics::init_registry();
        let server = hyper::Server::try_bind(&addr)
            .with_context(|| format!("failed to bind metrics server on {}", addr))?
            .serve(make_svc);
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("metrics server failed: {}", e);
            }
        }));
        log::info!("metrics server started on {}", addr);
        Ok(())
    }

    fn start_status_reporter(&mut self) {
        let raft = self.raft.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut interval = time::interval(STATUS_INTERVAL);
            loop {
                interval.tick().await;
                let status = raft.status();
                metrics::RAFT_TERM.set(status.term as i64);
                metrics::RAFT_COMMIT_INDEX.set(status.commit_index as i64);
                metrics::RAFT_IS_LEADER.set((status.role == Role::Leader) as i64);
                log::debug!("raft status {:?}", status);
            }
        }));
    }
}

/// Drain the delivery queue into the state machine, answering waiters and
/// snapshotting once the raft record outgrows `max_raft_state`
pub async fn run_applier(
    raft: Raft,
    store: Arc<KvStore>,
    mut state_machine: KvStateMachine,
    mut apply_rx: UnboundedReceiver<ApplyMsg>,
    max_raft_state: u64,
) {
    while let Some(msg) = apply_rx.recv().await {
        match msg {
            ApplyMsg::Command { index, command } => {
                if let Some(applied) = state_machine.apply(index, &command) {
                    store.notify_applied(index, applied);
                }
                if max_raft_state > 0 && raft.raft_state_size() >= max_raft_state {
                    raft.snapshot(state_machine.last_applied(), state_machine.snapshot());
                }
            }
            ApplyMsg::Snapshot { term, index, data } => {
                if raft.cond_install_snapshot(term, index, data.clone()) {
                    state_machine.restore(index, term, &data);
                    store.drop_pending_through(index);
                }
            }
        }
    }
    log::info!("applier for peer {} exited", raft.id());
}
