//! Raft client implementation
//!
//! Outbound peer RPCs over gRPC. One channel per peer is dialed lazily on
//! first use and dropped after any failure, so the next call redials.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tonic::transport::{Channel, Endpoint};

use crate::raft::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    PeerTransport, RequestVoteArgs, RequestVoteReply, TransportError,
};
use crate::raft_service::pb::raft_service_client::RaftServiceClient;

/// Client for managing connections to all peer nodes
pub struct RaftClient {
    /// Peer id -> address, fixed at startup
    addrs: HashMap<u64, String>,
    /// Peer id -> live client
    peers: Mutex<HashMap<u64, RaftServiceClient<Channel>>>,
}

impl RaftClient {
    pub fn new(addrs: HashMap<u64, String>) -> RaftClient {
        RaftClient {
            addrs,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the client for `peer`
    fn client(&self, peer: u64) -> Result<RaftServiceClient<Channel>, TransportError> {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = peers.get(&peer) {
            return Ok(client.clone());
        }
        let addr = self
            .addrs
            .get(&peer)
            .ok_or(TransportError::Unreachable(peer))?;
        let channel = Endpoint::from_shared(with_scheme(addr))
            .map_err(|e| TransportError::Rpc {
                peer,
                reason: e.to_string(),
            })?
            .connect_lazy();
        let client = RaftServiceClient::new(channel);
        peers.insert(peer, client.clone());
        log::debug!("created raft client for peer {} at {}", peer, addr);
        Ok(client)
    }

    /// Forget a client after a failure; the next call dials again
    fn invalidate(&self, peer: u64, status: tonic::Status) -> TransportError {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&peer);
        TransportError::Rpc {
            peer,
            reason: status.to_string(),
        }
    }
}

fn with_scheme(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}

#[tonic::async_trait]
impl PeerTransport for RaftClient {
    async fn request_vote(
        &self,
        peer: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, TransportError> {
        let mut client = self.client(peer)?;
        match client.request_vote(tonic::Request::new(args.into())).await {
            Ok(resp) => Ok(resp.into_inner().into()),
            Err(status) => Err(self.invalidate(peer, status)),
        }
    }

    async fn append_entries(
        &self,
        peer: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError> {
        let mut client = self.client(peer)?;
        match client.append_entries(tonic::Request::new(args.into())).await {
            Ok(resp) => Ok(resp.into_inner().into()),
            Err(status) => Err(self.invalidate(peer, status)),
        }
    }

    async fn install_snapshot(
        &self,
        peer: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotReply, TransportError> {
        let mut client = self.client(peer)?;
        match client.install_snapshot(tonic::Request::new(args.into())).await {
            Ok(resp) => Ok(resp.into_inner().into()),
            Err(status) => Err(self.invalidate(peer, status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_scheme() {
        assert_eq!(with_scheme("127.0.0.1:4001"), "http://127.0.0.1:4001");
        assert_eq!(with_scheme("http://node:4001"), "http://node:4001");
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails_and_is_forgotten() {
        let mut addrs = HashMap::new();
        // nothing listens on port 1
        addrs.insert(2, "127.0.0.1:1".to_string());
        let client = RaftClient::new(addrs);

        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        };
        assert!(client.request_vote(2, args.clone()).await.is_err());
        assert!(client.peers.lock().unwrap().is_empty());

        assert!(matches!(
            client.request_vote(3, args).await,
            Err(TransportError::Unreachable(3))
        ));
    }
}
