use pb::raft_service_server::RaftService;
use pb::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};

use crate::metrics::record_metrics;
use crate::raft::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply, LogEntry,
    Raft, RequestVoteArgs, RequestVoteReply,
};

#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("raft");
}

// Zero stands for "absent" in the optional reply hints. Real indices and
// terms carried there are never zero.
fn hint(value: u64) -> Option<u64> {
    (value != 0).then_some(value)
}

impl From<RequestVoteArgs> for RequestVoteRequest {
    fn from(args: RequestVoteArgs) -> Self {
        RequestVoteRequest {
            term: args.term,
            candidate_id: args.candidate_id,
            last_log_index: args.last_log_index,
            last_log_term: args.last_log_term,
        }
    }
}

impl From<RequestVoteRequest> for RequestVoteArgs {
    fn from(req: RequestVoteRequest) -> Self {
        RequestVoteArgs {
            term: req.term,
            candidate_id: req.candidate_id,
            last_log_index: req.last_log_index,
            last_log_term: req.last_log_term,
        }
    }
}

impl From<RequestVoteReply> for RequestVoteResponse {
    fn from(reply: RequestVoteReply) -> Self {
        RequestVoteResponse {
            term: reply.term,
            vote_granted: reply.vote_granted,
        }
    }
}

impl From<RequestVoteResponse> for RequestVoteReply {
    fn from(resp: RequestVoteResponse) -> Self {
        RequestVoteReply {
            term: resp.term,
            vote_granted: resp.vote_granted,
        }
    }
}

impl From<AppendEntriesArgs> for AppendEntriesRequest {
    fn from(args: AppendEntriesArgs) -> Self {
        AppendEntriesRequest {
            term: args.term,
            leader_id: args.leader_id,
            prev_log_index: args.prev_log_index,
            prev_log_term: args.prev_log_term,
            entries: args
                .entries
                .into_iter()
                .map(|e| pb::LogEntry {
                    term: e.term,
                    command: e.command,
                })
                .collect(),
            leader_commit: args.leader_commit,
        }
    }
}

impl From<AppendEntriesRequest> for AppendEntriesArgs {
    fn from(req: AppendEntriesRequest) -> Self {
        AppendEntriesArgs {
            term: req.term,
            leader_id: req.leader_id,
            prev_log_index: req.prev_log_index,
            prev_log_term: req.prev_log_term,
            entries: req
                .entries
                .into_iter()
                .map(|e| LogEntry::new(e.term, e.command))
                .collect(),
            leader_commit: req.leader_commit,
        }
    }
}

impl From<AppendEntriesReply> for AppendEntriesResponse {
    fn from(reply: AppendEntriesReply) -> Self {
        AppendEntriesResponse {
            term: reply.term,
            success: reply.success,
            conflict_term: reply.conflict_term.unwrap_or(0),
            conflict_index: reply.conflict_index.unwrap_or(0),
            log_len: reply.log_len.unwrap_or(0),
        }
    }
}

impl From<AppendEntriesResponse> for AppendEntriesReply {
    fn from(resp: AppendEntriesResponse) -> Self {
        AppendEntriesReply {
            term: resp.term,
            success: resp.success,
            conflict_term: hint(resp.conflict_term),
            conflict_index: hint(resp.conflict_index),
            log_len: hint(resp.log_len),
        }
    }
}

impl From<InstallSnapshotArgs> for InstallSnapshotRequest {
    fn from(args: InstallSnapshotArgs) -> Self {
        InstallSnapshotRequest {
            term: args.term,
            leader_id: args.leader_id,
            last_included_index: args.last_included_index,
            last_included_term: args.last_included_term,
            data: args.data,
        }
    }
}

impl From<InstallSnapshotRequest> for InstallSnapshotArgs {
    fn from(req: InstallSnapshotRequest) -> Self {
        InstallSnapshotArgs {
            term: req.term,
            leader_id: req.leader_id,
            last_included_index: req.last_included_index,
            last_included_term: req.last_included_term,
            data: req.data,
        }
    }
}

impl From<InstallSnapshotReply> for InstallSnapshotResponse {
    fn from(reply: InstallSnapshotReply) -> Self {
        InstallSnapshotResponse { term: reply.term }
    }
}

impl From<InstallSnapshotResponse> for InstallSnapshotReply {
    fn from(resp: InstallSnapshotResponse) -> Self {
        InstallSnapshotReply { term: resp.term }
    }
}

/// Inbound side of the peer RPCs
pub struct RaftServiceSVC {
    raft: Raft,
}

impl RaftServiceSVC {
    pub fn new(raft: Raft) -> Self {
        RaftServiceSVC { raft }
    }
}

#[tonic::async_trait]
impl RaftService for RaftServiceSVC {
    async fn request_vote(
        &self,
        request: tonic::Request<RequestVoteRequest>,
    ) -> Result<tonic::Response<RequestVoteResponse>, tonic::Status> {
        record_metrics("raft_request_vote", move || async move {
            let reply = self.raft.request_vote(request.into_inner().into());
            Ok(tonic::Response::new(reply.into()))
        })
        .await
    }

    async fn append_entries(
        &self,
        request: tonic::Request<AppendEntriesRequest>,
    ) -> Result<tonic::Response<AppendEntriesResponse>, tonic::Status> {
        record_metrics("raft_append_entries", move || async move {
            let reply = self.raft.append_entries(request.into_inner().into());
            Ok(tonic::Response::new(reply.into()))
        })
        .await
    }

    async fn install_snapshot(
        &self,
        request: tonic::Request<InstallSnapshotRequest>,
    ) -> Result<tonic::Response<InstallSnapshotResponse>, tonic::Status> {
        record_metrics("raft_install_snapshot", move || async move {
            let reply = self.raft.install_snapshot(request.into_inner().into());
            Ok(tonic::Response::new(reply.into()))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_reply_hints_use_zero_for_absent() {
        let rejected = AppendEntriesReply {
            term: 4,
            success: false,
            conflict_term: Some(2),
            conflict_index: Some(7),
            log_len: None,
        };
        let resp: AppendEntriesResponse = rejected.clone().into();
        assert_eq!(resp.log_len, 0);
        assert_eq!(AppendEntriesReply::from(resp), rejected);

        let accepted = AppendEntriesReply {
            term: 4,
            success: true,
            conflict_term: None,
            conflict_index: None,
            log_len: None,
        };
        let resp: AppendEntriesResponse = accepted.clone().into();
        assert_eq!(AppendEntriesReply::from(resp), accepted);
    }

    #[test]
    fn test_append_request_carries_entries() {
        let args = AppendEntriesArgs {
            term: 3,
            leader_id: 1,
            prev_log_index: 5,
            prev_log_term: 2,
            entries: vec![LogEntry::new(3, b"x".to_vec()), LogEntry::new(3, Vec::new())],
            leader_commit: 4,
        };
        let req: AppendEntriesRequest = args.clone().into();
        assert_eq!(req.entries.len(), 2);
        assert_eq!(req.entries[0].command, b"x".to_vec());
        assert_eq!(AppendEntriesArgs::from(req), args);
    }
}
