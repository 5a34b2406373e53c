//! Consensus handler for a node that hosts no raft group yet.
//!
//! Peers still get a well-formed reply for every verb, carrying `EAGAIN`
//! so their engine backs off and retries instead of timing out.

use async_trait::async_trait;
use raftlink_rpc::{
    AppendEntriesRequest, AppendEntriesResponse, ErrorResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, RaftErrorCode, RaftServerService, ReadIndexRequest,
    ReadIndexResponse, RequestVoteRequest, RequestVoteResponse, TimeoutNowRequest,
    TimeoutNowResponse,
};
use tracing::debug;

pub struct NoGroupServer;

fn unavailable(group_id: &str) -> Option<ErrorResponse> {
    debug!(group_id, "rejecting request for unhosted group");
    Some(ErrorResponse::new(
        RaftErrorCode::EAgain,
        format!("group '{group_id}' is not hosted on this node"),
    ))
}

#[async_trait]
impl RaftServerService for NoGroupServer {
    async fn handle_pre_vote_request(&self, request: RequestVoteRequest) -> RequestVoteResponse {
        RequestVoteResponse {
            term: request.term,
            granted: false,
            error_response: unavailable(&request.group_id),
        }
    }

    async fn handle_request_vote_request(&self, request: RequestVoteRequest) -> RequestVoteResponse {
        RequestVoteResponse {
            term: request.term,
            granted: false,
            error_response: unavailable(&request.group_id),
        }
    }

    async fn handle_append_entries_request(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: request.term,
            success: false,
            last_log_index: 0,
            error_response: unavailable(&request.group_id),
        }
    }

    async fn handle_install_snapshot(&self, request: InstallSnapshotRequest) -> InstallSnapshotResponse {
        InstallSnapshotResponse {
            term: request.term,
            success: false,
            error_response: unavailable(&request.group_id),
        }
    }

    async fn handle_timeout_now_request(&self, request: TimeoutNowRequest) -> TimeoutNowResponse {
        TimeoutNowResponse {
            term: request.term,
            success: false,
            error_response: unavailable(&request.group_id),
        }
    }

    async fn handle_read_index_request(&self, request: ReadIndexRequest) -> ReadIndexResponse {
        ReadIndexResponse {
            index: 0,
            success: false,
            error_response: unavailable(&request.group_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_verb_answers_eagain() {
        let server = NoGroupServer;
        let vote = server
            .handle_request_vote_request(RequestVoteRequest {
                group_id: "g1".into(),
                term: 3,
                ..Default::default()
            })
            .await;
        assert_eq!(vote.term, 3);
        assert!(!vote.granted);
        let error = vote.error_response.unwrap();
        assert_eq!(error.code(), Some(RaftErrorCode::EAgain));
        assert!(error.error_msg.contains("g1"));

        let read = server.handle_read_index_request(ReadIndexRequest::default()).await;
        assert!(!read.success);
        assert!(read.error_response.is_some());
    }
}
