//! Reconnect and retry behavior of `Connection`.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use assert_matches::assert_matches;
use common::{MemoryConnectionTransport, RecordingHandler, eventually, options};
use proven_framed_rpc::*;

fn connect(
    factory: &Arc<MemoryConnectionTransport>,
    handler: &Arc<RecordingHandler>,
    options: ConnectionOptions,
) -> Connection {
    Connection::new(factory.clone(), handler.clone(), options)
}

#[tokio::test]
async fn test_first_command_waits_for_connection() {
    let factory = MemoryConnectionTransport::new();
    let handler = Arc::new(RecordingHandler::default());
    let conn = connect(&factory, &handler, options());

    let result: i64 = conn
        .get_client()
        .call(&CancellationToken::new(), "svc.inc", &41)
        .await
        .unwrap();
    assert_eq!(result, 42);
    assert!(conn.is_connected());
    assert!(conn.get_server().is_some());
    assert_eq!(handler.connects.load(Ordering::SeqCst), 1);
    assert_eq!(
        *handler.statuses.lock(),
        vec![DisconnectStatus::StartingFirstConnection]
    );
}

#[tokio::test]
async fn test_dont_connect_now_defers_dial() {
    let factory = MemoryConnectionTransport::new();
    let handler = Arc::new(RecordingHandler::default());
    let conn = connect(&factory, &handler, options().with_dont_connect_now(true));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(factory.dials.load(Ordering::SeqCst), 0);
    assert!(!conn.is_connected());

    let result: i64 = conn
        .get_client()
        .call(&CancellationToken::new(), "svc.inc", &1)
        .await
        .unwrap();
    assert_eq!(result, 2);
    assert_eq!(factory.dials.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retryable_errors_back_off() {
    let factory = MemoryConnectionTransport::new();
    factory.throttles.store(2, Ordering::SeqCst);
    let handler = Arc::new(RecordingHandler {
        retry_throttled: true,
        ..Default::default()
    });
    let conn = connect(&factory, &handler, options());

    let result: String = conn
        .get_client()
        .call(&CancellationToken::new(), "svc.flaky", &())
        .await
        .unwrap();
    assert_eq!(result, "done");
    assert_eq!(
        *handler.command_waits.lock(),
        vec![Duration::from_millis(10), Duration::from_millis(20)]
    );
}

#[tokio::test]
async fn test_other_errors_return_immediately() {
    let factory = MemoryConnectionTransport::new();
    let handler = Arc::new(RecordingHandler {
        retry_throttled: true,
        ..Default::default()
    });
    let conn = connect(&factory, &handler, options());

    let err = conn
        .get_client()
        .call::<_, ()>(&CancellationToken::new(), "svc.broken", &())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "broken");
    assert!(handler.command_waits.lock().is_empty());
}

#[tokio::test]
async fn test_reconnects_after_peer_goes_away() {
    let factory = MemoryConnectionTransport::new();
    let handler = Arc::new(RecordingHandler::default());
    let conn = connect(&factory, &handler, options());
    let client = conn.get_client();
    let ctx = CancellationToken::new();

    assert_eq!(client.call::<_, i64>(&ctx, "svc.inc", &1).await.unwrap(), 2);

    factory.sever().await;
    eventually(|| !conn.is_connected()).await;

    assert_eq!(client.call::<_, i64>(&ctx, "svc.inc", &2).await.unwrap(), 3);
    assert_eq!(factory.dials.load(Ordering::SeqCst), 2);
    assert_eq!(handler.connects.load(Ordering::SeqCst), 2);
    assert_eq!(
        *handler.statuses.lock(),
        vec![
            DisconnectStatus::StartingFirstConnection,
            DisconnectStatus::StartingNonFirstConnection,
        ]
    );
}

#[tokio::test]
async fn test_command_blocks_until_peer_returns() {
    let factory = MemoryConnectionTransport::new();
    let handler = Arc::new(RecordingHandler::default());
    let conn = connect(&factory, &handler, options());
    let ctx = CancellationToken::new();
    conn.get_client().call::<_, i64>(&ctx, "svc.inc", &0).await.unwrap();

    factory.down.store(true, Ordering::SeqCst);
    factory.sever().await;
    eventually(|| !conn.is_connected()).await;

    let pending = {
        let client = conn.get_client();
        let ctx = ctx.clone();
        tokio::spawn(async move { client.call::<_, i64>(&ctx, "svc.inc", &10).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());
    assert!(!handler.connect_waits.lock().is_empty());

    factory.down.store(false, Ordering::SeqCst);
    let result = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.unwrap(), 11);
}

#[tokio::test]
async fn test_cancel_while_waiting_for_connection() {
    let factory = MemoryConnectionTransport::new();
    factory.down.store(true, Ordering::SeqCst);
    let handler = Arc::new(RecordingHandler::default());
    let conn = connect(&factory, &handler, options());

    let ctx = CancellationToken::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });

    let err = conn
        .get_client()
        .call::<_, i64>(&ctx, "svc.inc", &0)
        .await
        .unwrap_err();
    assert_matches!(err, Error::Canceled);
    conn.shutdown();
}

#[tokio::test]
async fn test_fatal_connect_error_is_reported() {
    let factory = MemoryConnectionTransport::new();
    factory.down.store(true, Ordering::SeqCst);
    let handler = Arc::new(RecordingHandler {
        fatal_connect_errors: true,
        ..Default::default()
    });
    let conn = connect(&factory, &handler, options());

    let err = conn
        .get_client()
        .call::<_, i64>(&CancellationToken::new(), "svc.inc", &0)
        .await
        .unwrap_err();
    assert_matches!(err, Error::Reconnect(inner) if matches!(*inner, Error::Dial(_)));
}

#[tokio::test]
async fn test_rejected_transport_is_stopped() {
    let factory = MemoryConnectionTransport::new();
    let handler = Arc::new(RecordingHandler {
        reject_connect: true,
        fatal_connect_errors: true,
        ..Default::default()
    });
    let conn = connect(&factory, &handler, options());

    let err = conn
        .get_client()
        .call::<_, i64>(&CancellationToken::new(), "svc.inc", &0)
        .await
        .unwrap_err();
    assert_matches!(err, Error::Reconnect(_));

    let dialed: Vec<_> = factory.dialed.lock().clone();
    assert!(!dialed.is_empty());
    eventually(|| dialed.iter().all(|transport| !transport.is_connected())).await;
    assert!(!conn.is_connected());
}

#[tokio::test]
async fn test_forced_initial_backoff_reports_reconnect() {
    let factory = MemoryConnectionTransport::new();
    let handler = Arc::new(RecordingHandler::default());
    let conn = connect(
        &factory,
        &handler,
        options()
            .with_force_initial_backoff(true)
            .with_initial_reconnect_backoff_window(Some(Duration::from_millis(10))),
    );

    let result: i64 = conn
        .get_client()
        .call(&CancellationToken::new(), "svc.inc", &1)
        .await
        .unwrap();
    assert_eq!(result, 2);
    assert_eq!(
        *handler.statuses.lock(),
        vec![DisconnectStatus::StartingNonFirstConnection]
    );
}

#[tokio::test]
async fn test_force_reconnect_dials_again() {
    let factory = MemoryConnectionTransport::new();
    let handler = Arc::new(RecordingHandler::default());
    let conn = connect(&factory, &handler, options());
    let ctx = CancellationToken::new();

    conn.get_client().call::<_, i64>(&ctx, "svc.inc", &0).await.unwrap();
    conn.force_reconnect(&ctx).await.unwrap();

    assert_eq!(factory.dials.load(Ordering::SeqCst), 2);
    assert!(conn.is_connected());
    assert_eq!(conn.get_client().call::<_, i64>(&ctx, "svc.inc", &5).await.unwrap(), 6);
}

#[tokio::test]
async fn test_initial_backoff_window_can_be_fast_forwarded() {
    let factory = MemoryConnectionTransport::new();
    let handler = Arc::new(RecordingHandler::default());
    let conn = connect(
        &factory,
        &handler,
        options().with_initial_reconnect_backoff_window(Some(Duration::from_secs(60))),
    );
    let ctx = CancellationToken::new();
    conn.get_client().call::<_, i64>(&ctx, "svc.inc", &0).await.unwrap();

    factory.sever().await;
    eventually(|| !conn.is_connected()).await;

    let pending = {
        let client = conn.get_client();
        let ctx = ctx.clone();
        tokio::spawn(async move { client.call::<_, i64>(&ctx, "svc.inc", &1).await })
    };

    // Fast-forwarding wakes only a waiter that is already parked.
    eventually(|| handler.statuses.lock().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    conn.fast_forward_initial_backoff();

    let result = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.unwrap(), 2);
}

#[tokio::test]
async fn test_shutdown_rejects_commands() {
    let factory = MemoryConnectionTransport::new();
    let handler = Arc::new(RecordingHandler::default());
    let conn = connect(&factory, &handler, options());
    let ctx = CancellationToken::new();
    conn.get_client().call::<_, i64>(&ctx, "svc.inc", &0).await.unwrap();

    conn.shutdown();

    let err = conn
        .get_client()
        .call::<_, i64>(&ctx, "svc.inc", &0)
        .await
        .unwrap_err();
    assert_matches!(err, Error::ShutDown);
    assert!(!conn.is_connected());
}

#[tokio::test]
async fn test_shutdown_interrupts_reconnect() {
    let factory = MemoryConnectionTransport::new();
    factory.down.store(true, Ordering::SeqCst);
    let handler = Arc::new(RecordingHandler::default());
    let conn = connect(&factory, &handler, options());

    let pending = {
        let client = conn.get_client();
        tokio::spawn(async move {
            client
                .call::<_, i64>(&CancellationToken::new(), "svc.inc", &0)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    conn.shutdown();

    let result = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();
    assert_matches!(result, Err(Error::ShutDown));
}
