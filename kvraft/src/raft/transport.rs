use super::errors::TransportError;
use super::message::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    RequestVoteArgs, RequestVoteReply,
};

/// Outbound RPCs to other peers
///
/// A call may fail, time out, or be delivered late; the core treats every
/// error as a lost message.
#[tonic::async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        peer: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, TransportError>;

    async fn append_entries(
        &self,
        peer: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError>;

    async fn install_snapshot(
        &self,
        peer: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotReply, TransportError>;
}
