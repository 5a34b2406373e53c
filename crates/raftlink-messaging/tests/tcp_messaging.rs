//! End-to-end messaging over loopback TCP.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use raftlink_core::{Address, MessagingConfig};
use raftlink_messaging::{
    BoxFuture, HandlerError, MessagingError, MessagingService, TcpMessagingService,
};
use tokio::runtime::Handle;

async fn start_node(cluster_id: &str) -> TcpMessagingService {
    let config = MessagingConfig {
        connection_pool_size: 4,
        request_timeout_ms: 2_000,
        ..MessagingConfig::default()
    };
    let svc = TcpMessagingService::new(cluster_id, Address::new("127.0.0.1", 0), config);
    svc.start().await.unwrap();
    svc
}

fn register_echo(svc: &TcpMessagingService) {
    svc.register_handler(
        "echo",
        Arc::new(|_from: Address, payload: Bytes| Ok::<_, HandlerError>(payload)),
        Handle::current(),
    );
}

#[tokio::test]
async fn request_reply_between_two_nodes() {
    let a = start_node("it").await;
    let b = start_node("it").await;
    register_echo(&b);

    let reply = a
        .send_and_receive(&b.address(), "echo", Bytes::from_static(b"hello raft"))
        .await
        .unwrap();
    assert_eq!(reply.as_ref(), b"hello raft");

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn empty_and_large_payloads() {
    let a = start_node("it").await;
    let b = start_node("it").await;
    register_echo(&b);

    let empty = a
        .send_and_receive(&b.address(), "echo", Bytes::new())
        .await
        .unwrap();
    assert!(empty.is_empty());

    let big = Bytes::from(vec![7u8; 4 * 1024 * 1024]);
    let echoed = a
        .send_and_receive(&b.address(), "echo", big.clone())
        .await
        .unwrap();
    assert_eq!(echoed, big);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn sender_address_is_attributed() {
    let a = start_node("it").await;
    let b = start_node("it").await;
    b.register_handler(
        "whoami",
        Arc::new(|from: Address, _payload: Bytes| {
            Ok::<_, HandlerError>(Bytes::from(from.to_string()))
        }),
        Handle::current(),
    );

    let reply = a
        .send_and_receive(&b.address(), "whoami", Bytes::new())
        .await
        .unwrap();
    assert_eq!(std::str::from_utf8(&reply).unwrap(), a.address().to_string());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn many_concurrent_requests() {
    let a = Arc::new(start_node("it").await);
    let b = start_node("it").await;
    b.register_async_handler(
        "jitter",
        Arc::new(
            |_from: Address, payload: Bytes| -> BoxFuture<'static, Result<Bytes, HandlerError>> {
                Box::pin(async move {
                    let delay = u64::from(payload[0] % 7);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok(payload)
                })
            },
        ),
        Handle::current(),
    );

    let target = b.address();
    let mut calls = Vec::new();
    for i in 0..100u8 {
        let a = a.clone();
        let target = target.clone();
        calls.push(tokio::spawn(async move {
            let reply = a
                .send_and_receive(&target, "jitter", Bytes::from(vec![i]))
                .await
                .unwrap();
            assert_eq!(reply.as_ref(), &[i]);
        }));
    }
    for call in calls {
        call.await.unwrap();
    }

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn missing_handler_fails_the_call() {
    let a = start_node("it").await;
    let b = start_node("it").await;

    let err = a
        .send_and_receive(&b.address(), "installSnapshot", Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::NoRemoteHandler { ref subject } if subject == "installSnapshot"));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn unregistered_handler_stops_answering() {
    let a = start_node("it").await;
    let b = start_node("it").await;
    register_echo(&b);

    assert!(b.unregister_handler("echo"));
    assert!(!b.unregister_handler("echo"));

    let err = a
        .send_and_receive(&b.address(), "echo", Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::NoRemoteHandler { .. }));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn oversized_reply_fails_promptly() {
    let config = MessagingConfig {
        max_frame_bytes: 1024,
        request_timeout_ms: 10_000,
        ..MessagingConfig::default()
    };
    let a = TcpMessagingService::new("it", Address::new("127.0.0.1", 0), config.clone());
    let b = TcpMessagingService::new("it", Address::new("127.0.0.1", 0), config);
    a.start().await.unwrap();
    b.start().await.unwrap();
    register_echo(&b);
    b.register_handler(
        "big",
        Arc::new(|_from: Address, _payload: Bytes| Ok::<_, HandlerError>(Bytes::from(vec![7u8; 4096]))),
        Handle::current(),
    );

    let started = tokio::time::Instant::now();
    let err = a
        .send_and_receive(&b.address(), "big", Bytes::new())
        .await
        .unwrap_err();
    assert!(
        matches!(&err, MessagingError::RemoteHandlerFailure { message, .. } if message.contains("frame limit")),
        "{err:?}"
    );
    assert!(started.elapsed() < Duration::from_secs(5));

    // The connection survives the rejected reply.
    let reply = a
        .send_and_receive(&b.address(), "echo", Bytes::from_static(b"still here"))
        .await
        .unwrap();
    assert_eq!(reply.as_ref(), b"still here");

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn slow_handler_times_out_without_closing_connection() {
    let a = start_node("it").await;
    let b = start_node("it").await;
    register_echo(&b);
    b.register_async_handler(
        "slow",
        Arc::new(
            |_from: Address, _payload: Bytes| -> BoxFuture<'static, Result<Bytes, HandlerError>> {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Bytes::new())
                })
            },
        ),
        Handle::current(),
    );

    let err = a
        .send_and_receive_with_timeout(
            &b.address(),
            "slow",
            Bytes::new(),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::Timeout { .. }));

    // Other traffic to the same node still flows.
    let reply = a
        .send_and_receive(&b.address(), "echo", Bytes::from_static(b"ok"))
        .await
        .unwrap();
    assert_eq!(reply.as_ref(), b"ok");

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn fire_and_forget_reaches_consumer() {
    let a = start_node("it").await;
    let b = start_node("it").await;
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    b.register_consumer(
        "heartbeat",
        Arc::new(move |_from: Address, _payload: Bytes| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
        Handle::current(),
    );

    for _ in 0..5 {
        a.send_async(&b.address(), "heartbeat", Bytes::new())
            .await
            .unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while received.load(Ordering::SeqCst) < 5 {
        assert!(tokio::time::Instant::now() < deadline, "consumer not invoked");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn different_cluster_is_rejected() {
    let a = start_node("cluster-a").await;
    let b = start_node("cluster-b").await;
    register_echo(&b);

    let err = a
        .send_and_receive(&b.address(), "echo", Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::Handshake(_)), "got {err:?}");

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn reconnects_after_peer_restart() {
    let a = start_node("it").await;
    let b = start_node("it").await;
    register_echo(&b);
    let port = b.address().port();

    a.send_and_receive(&b.address(), "echo", Bytes::from_static(b"1"))
        .await
        .unwrap();
    b.stop().await;

    // Same port, fresh service.
    let config = MessagingConfig::default();
    let b2 = TcpMessagingService::new("it", Address::new("127.0.0.1", port), config);
    b2.start().await.unwrap();
    register_echo(&b2);

    // The pooled connection to the old instance is dead; the pool replaces it.
    let mut reply = None;
    for _ in 0..20 {
        match a
            .send_and_receive(&b2.address(), "echo", Bytes::from_static(b"2"))
            .await
        {
            Ok(bytes) => {
                reply = Some(bytes);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(25)).await,
        }
    }
    assert_eq!(reply.unwrap().as_ref(), b"2");

    a.stop().await;
    b2.stop().await;
}
