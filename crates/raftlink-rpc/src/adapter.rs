//! Consensus RPCs over the messaging service.
//!
//! Each consensus verb is a messaging subject. Inbound requests are decoded
//! and handed to the local [`RaftServerService`]; `getFile` is answered by the
//! [`FileService`] directly. Outbound calls encode a typed request, send it to
//! the peer, and decode the typed reply.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use raftlink_cluster::ClusterMembershipService;
use raftlink_core::Address;
use raftlink_messaging::{BoxFuture, HandlerError, MessagingService};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::error::RpcResult;
use crate::file_service::FileService;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, GetFileRequest, GetFileResponse,
    InstallSnapshotRequest, InstallSnapshotResponse, ReadIndexRequest, ReadIndexResponse,
    RequestVoteRequest, RequestVoteResponse, TimeoutNowRequest, TimeoutNowResponse,
};

pub const PRE_VOTE: &str = "preVote";
pub const REQUEST_VOTE: &str = "requestVote";
pub const APPEND_ENTRIES: &str = "appendEntries";
pub const INSTALL_SNAPSHOT: &str = "installSnapshot";
pub const GET_FILE: &str = "getFile";
pub const TIMEOUT_NOW: &str = "timeoutNow";
pub const READ_INDEX: &str = "readIndex";

/// Every subject the adapter serves.
pub const SUBJECTS: [&str; 7] = [
    PRE_VOTE,
    REQUEST_VOTE,
    APPEND_ENTRIES,
    INSTALL_SNAPSHOT,
    GET_FILE,
    TIMEOUT_NOW,
    READ_INDEX,
];

/// Inbound side of the consensus engine.
#[async_trait]
pub trait RaftServerService: Send + Sync + 'static {
    async fn handle_pre_vote_request(&self, request: RequestVoteRequest) -> RequestVoteResponse;

    async fn handle_request_vote_request(&self, request: RequestVoteRequest) -> RequestVoteResponse;

    async fn handle_append_entries_request(&self, request: AppendEntriesRequest) -> AppendEntriesResponse;

    async fn handle_install_snapshot(&self, request: InstallSnapshotRequest) -> InstallSnapshotResponse;

    async fn handle_timeout_now_request(&self, request: TimeoutNowRequest) -> TimeoutNowResponse;

    async fn handle_read_index_request(&self, request: ReadIndexRequest) -> ReadIndexResponse;
}

/// Client and server side of the consensus RPCs on one messaging service.
pub struct RaftRpcService {
    messaging: Arc<dyn MessagingService>,
    membership: Arc<dyn ClusterMembershipService>,
    closed: AtomicBool,
}

/// Register an async handler that decodes `Req`, runs `call`, and encodes
/// the response.
fn serve<Req, Resp, F, Fut>(
    messaging: &dyn MessagingService,
    subject: &str,
    server: Arc<dyn RaftServerService>,
    executor: Handle,
    call: F,
) where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Arc<dyn RaftServerService>, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Resp> + Send + 'static,
{
    messaging.register_async_handler(
        subject,
        Arc::new(
            move |_from: Address, payload: Bytes| -> BoxFuture<'static, Result<Bytes, HandlerError>> {
                let work = serde_json::from_slice::<Req>(&payload).map(|req| call(server.clone(), req));
                Box::pin(async move {
                    let response = work?.await;
                    Ok(Bytes::from(serde_json::to_vec(&response)?))
                })
            },
        ),
        executor,
    );
}

impl RaftRpcService {
    /// Register the consensus handlers on `messaging`.
    pub fn new(
        messaging: Arc<dyn MessagingService>,
        membership: Arc<dyn ClusterMembershipService>,
        server: Arc<dyn RaftServerService>,
        files: Arc<FileService>,
        executor: Handle,
    ) -> Self {
        let m = messaging.as_ref();
        serve(m, PRE_VOTE, server.clone(), executor.clone(), |s, r| async move {
            s.handle_pre_vote_request(r).await
        });
        serve(m, REQUEST_VOTE, server.clone(), executor.clone(), |s, r| async move {
            s.handle_request_vote_request(r).await
        });
        serve(m, APPEND_ENTRIES, server.clone(), executor.clone(), |s, r| async move {
            s.handle_append_entries_request(r).await
        });
        serve(m, INSTALL_SNAPSHOT, server.clone(), executor.clone(), |s, r| async move {
            s.handle_install_snapshot(r).await
        });
        serve(m, TIMEOUT_NOW, server.clone(), executor.clone(), |s, r| async move {
            s.handle_timeout_now_request(r).await
        });
        serve(m, READ_INDEX, server, executor.clone(), |s, r| async move {
            s.handle_read_index_request(r).await
        });

        // File reads touch the disk, so they go through the blocking pool.
        messaging.register_handler(
            GET_FILE,
            Arc::new(move |_from: Address, payload: Bytes| -> Result<Bytes, HandlerError> {
                let request: GetFileRequest = serde_json::from_slice(&payload)?;
                let response = files.handle_get_file(&request);
                Ok(Bytes::from(serde_json::to_vec(&response)?))
            }),
            executor,
        );
        info!(address = %messaging.address(), "registered consensus rpc handlers");

        Self {
            messaging,
            membership,
            closed: AtomicBool::new(false),
        }
    }

    /// Unregister every handler. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for subject in SUBJECTS {
            if !self.messaging.unregister_handler(subject) {
                debug!(subject, "handler was already unregistered");
            }
        }
        info!("unregistered consensus rpc handlers");
    }

    /// Whether `close` has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether the member at `endpoint` is active according to membership.
    /// Unknown endpoints are not connected.
    pub fn is_connected(&self, endpoint: &Address) -> bool {
        self.membership
            .member_by_address(endpoint)
            .is_some_and(|m| m.is_active())
    }

    /// Membership is the only liveness signal, so this never dials.
    pub fn check_connection(&self, endpoint: &Address, _create_if_absent: bool) -> bool {
        self.is_connected(endpoint)
    }

    async fn call<Req, Resp>(
        &self,
        endpoint: &Address,
        subject: &str,
        request: &Req,
        timeout: Option<Duration>,
    ) -> RpcResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let payload = Bytes::from(serde_json::to_vec(request)?);
        let reply = match timeout {
            Some(timeout) => {
                self.messaging
                    .send_and_receive_with_timeout(endpoint, subject, payload, timeout)
                    .await?
            }
            None => self.messaging.send_and_receive(endpoint, subject, payload).await?,
        };
        Ok(serde_json::from_slice(&reply)?)
    }

    /// Pre-vote with the default request timeout.
    pub async fn pre_vote(
        &self,
        endpoint: &Address,
        request: &RequestVoteRequest,
    ) -> RpcResult<RequestVoteResponse> {
        self.call(endpoint, PRE_VOTE, request, None).await
    }

    /// Vote request with the default request timeout.
    pub async fn request_vote(
        &self,
        endpoint: &Address,
        request: &RequestVoteRequest,
    ) -> RpcResult<RequestVoteResponse> {
        self.call(endpoint, REQUEST_VOTE, request, None).await
    }

    /// Replicate entries, waiting at most `timeout_ms` for the reply.
    pub async fn append_entries(
        &self,
        endpoint: &Address,
        request: &AppendEntriesRequest,
        timeout_ms: u64,
    ) -> RpcResult<AppendEntriesResponse> {
        self.call(endpoint, APPEND_ENTRIES, request, Some(Duration::from_millis(timeout_ms)))
            .await
    }

    /// Snapshot install notice with the default request timeout.
    pub async fn install_snapshot(
        &self,
        endpoint: &Address,
        request: &InstallSnapshotRequest,
    ) -> RpcResult<InstallSnapshotResponse> {
        self.call(endpoint, INSTALL_SNAPSHOT, request, None).await
    }

    /// Fetch one snapshot chunk, waiting at most `timeout_ms`.
    pub async fn get_file(
        &self,
        endpoint: &Address,
        request: &GetFileRequest,
        timeout_ms: u64,
    ) -> RpcResult<GetFileResponse> {
        self.call(endpoint, GET_FILE, request, Some(Duration::from_millis(timeout_ms)))
            .await
    }

    pub async fn timeout_now(
        &self,
        endpoint: &Address,
        request: &TimeoutNowRequest,
        timeout_ms: u64,
    ) -> RpcResult<TimeoutNowResponse> {
        self.call(endpoint, TIMEOUT_NOW, request, Some(Duration::from_millis(timeout_ms)))
            .await
    }

    pub async fn read_index(
        &self,
        endpoint: &Address,
        request: &ReadIndexRequest,
        timeout_ms: u64,
    ) -> RpcResult<ReadIndexResponse> {
        self.call(endpoint, READ_INDEX, request, Some(Duration::from_millis(timeout_ms)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raftlink_cluster::ClusterMembershipEvent;
    use raftlink_core::{EventListener, ListenerId, Member, MemberId, MessagingConfig};
    use raftlink_messaging::TcpMessagingService;

    struct StaticMembership {
        local: Arc<Member>,
        others: Vec<Arc<Member>>,
    }

    impl ClusterMembershipService for StaticMembership {
        fn local_member(&self) -> Arc<Member> {
            self.local.clone()
        }

        fn members(&self) -> Vec<Arc<Member>> {
            let mut all = vec![self.local.clone()];
            all.extend(self.others.iter().cloned());
            all
        }

        fn member(&self, id: &MemberId) -> Option<Arc<Member>> {
            self.members().into_iter().find(|m| m.id() == id)
        }

        fn add_listener(&self, _listener: Arc<dyn EventListener<ClusterMembershipEvent>>) -> ListenerId {
            unimplemented!("not needed by these tests")
        }

        fn remove_listener(&self, _id: ListenerId) -> bool {
            false
        }

        fn is_running(&self) -> bool {
            true
        }
    }

    struct Idle;

    #[async_trait]
    impl RaftServerService for Idle {
        async fn handle_pre_vote_request(&self, r: RequestVoteRequest) -> RequestVoteResponse {
            RequestVoteResponse { term: r.term, ..Default::default() }
        }
        async fn handle_request_vote_request(&self, r: RequestVoteRequest) -> RequestVoteResponse {
            RequestVoteResponse { term: r.term, ..Default::default() }
        }
        async fn handle_append_entries_request(&self, r: AppendEntriesRequest) -> AppendEntriesResponse {
            AppendEntriesResponse { term: r.term, ..Default::default() }
        }
        async fn handle_install_snapshot(&self, r: InstallSnapshotRequest) -> InstallSnapshotResponse {
            InstallSnapshotResponse { term: r.term, ..Default::default() }
        }
        async fn handle_timeout_now_request(&self, r: TimeoutNowRequest) -> TimeoutNowResponse {
            TimeoutNowResponse { term: r.term, ..Default::default() }
        }
        async fn handle_read_index_request(&self, _r: ReadIndexRequest) -> ReadIndexResponse {
            ReadIndexResponse::default()
        }
    }

    fn setup() -> (TcpMessagingService, RaftRpcService, Arc<Member>) {
        let messaging = TcpMessagingService::new("rpc", Address::new("127.0.0.1", 0), MessagingConfig::default());
        let peer = Arc::new(Member::new("peer", Address::new("10.1.1.1", 5679)));
        let membership = Arc::new(StaticMembership {
            local: Arc::new(Member::new("local", Address::new("127.0.0.1", 5679))),
            others: vec![peer.clone()],
        });
        let rpc = RaftRpcService::new(
            Arc::new(messaging.clone()),
            membership,
            Arc::new(Idle),
            Arc::new(FileService::with_initial_id(1)),
            Handle::current(),
        );
        (messaging, rpc, peer)
    }

    #[tokio::test]
    async fn registers_and_unregisters_all_verbs() {
        let (messaging, rpc, _) = setup();
        let mut subjects = messaging.subjects();
        subjects.sort();
        let mut expected: Vec<String> = SUBJECTS.iter().map(|s| s.to_string()).collect();
        expected.sort();
        assert_eq!(subjects, expected);

        rpc.close();
        assert!(rpc.is_closed());
        assert!(messaging.subjects().is_empty());
        // Second close is a no-op.
        rpc.close();
        assert!(messaging.subjects().is_empty());
    }

    #[tokio::test]
    async fn connectivity_follows_member_liveness() {
        let (_messaging, rpc, peer) = setup();
        let endpoint = Address::new("10.1.1.1", 5679);
        assert!(!rpc.is_connected(&endpoint));

        peer.set_active(true);
        assert!(rpc.is_connected(&endpoint));
        assert!(rpc.check_connection(&endpoint, true));

        assert!(!rpc.is_connected(&Address::new("10.9.9.9", 5679)));
    }

    #[tokio::test]
    async fn local_calls_round_trip() {
        let messaging = TcpMessagingService::new("rpc", Address::new("127.0.0.1", 0), MessagingConfig::default());
        messaging.start().await.unwrap();
        let local = Arc::new(Member::new("local", messaging.address()));
        let rpc = RaftRpcService::new(
            Arc::new(messaging.clone()),
            Arc::new(StaticMembership { local, others: vec![] }),
            Arc::new(Idle),
            Arc::new(FileService::with_initial_id(1)),
            Handle::current(),
        );

        let resp = rpc
            .pre_vote(
                &messaging.address(),
                &RequestVoteRequest { term: 7, pre_vote: true, ..Default::default() },
            )
            .await
            .unwrap();
        assert_eq!(resp.term, 7);

        rpc.close();
        messaging.stop().await;
    }
}
