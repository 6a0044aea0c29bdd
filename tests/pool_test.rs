//! Pool dispatch, replacement and batching

mod common;

use common::{plain_config, wait_until, TestPki, TestServer};
use pushpool::config::Verify;
use pushpool::{
    DispatchStrategy, Pool, PushError, Request, SendOptions, SendOutcome, StartupError,
    WorkerStatus,
};
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_pool_starts_configured_workers() {
    let server = TestServer::plain().await;
    let pool = Pool::start("push", plain_config(server.port()), 3, DispatchStrategy::RoundRobin)
        .await
        .unwrap();

    let stats = pool.stats().await;
    assert_eq!(stats.name, "push");
    assert_eq!(stats.configured, 3);
    assert_eq!(stats.live, 3);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.replaced, 0);
    assert_eq!(server.accepted(), 3);

    for i in 0..6 {
        let body = format!("n{}", i);
        let response = pool
            .send_request(Request::post("/echo", body.clone()), SendOptions::sync())
            .await
            .unwrap()
            .into_response()
            .unwrap();
        assert_eq!(&response.body[..], body.as_bytes());
    }

    pool.shutdown().await;
    assert_eq!(pool.stats().await.live, 0);
}

#[tokio::test]
async fn test_crashed_workers_are_replaced() {
    let server = TestServer::plain().await;
    let mut config = plain_config(server.port());
    config.reconnect_attempts = 0;
    let pool = Pool::start("push", config, 2, DispatchStrategy::RandomWorker)
        .await
        .unwrap();
    let original: Vec<usize> = pool.workers().await.iter().map(|w| w.id()).collect();

    server.drop_connections();

    assert!(
        wait_until(WAIT, || async {
            let stats = pool.stats().await;
            stats.replaced == 2 && stats.live == 2
        })
        .await
    );
    let replaced: Vec<usize> = pool.workers().await.iter().map(|w| w.id()).collect();
    assert_eq!(replaced.len(), 2);
    assert!(replaced.iter().all(|id| !original.contains(id)));

    let response = pool
        .send_request(Request::post("/echo", "healed"), SendOptions::sync())
        .await
        .unwrap()
        .into_response()
        .unwrap();
    assert_eq!(&response.body[..], b"healed");

    pool.shutdown().await;
}

#[tokio::test]
async fn test_no_live_worker_is_not_ready() {
    let server = TestServer::plain().await;
    let mut config = plain_config(server.port());
    config.reconnect_attempts = 0;
    config.connect_timeout = Duration::from_millis(200);
    let pool = Pool::start("push", config, 1, DispatchStrategy::RandomWorker)
        .await
        .unwrap();

    server.stop();
    let workers = pool.workers().await;
    assert!(workers[0].wait_for_status(WorkerStatus::Terminated).await);

    let result = pool
        .send_request(Request::new("/echo"), SendOptions::sync())
        .await;
    assert_eq!(result, Err(PushError::NotReady));
    assert_eq!(pool.stats().await.live, 0);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_least_loaded_spreads_pending_requests() {
    let server = TestServer::plain().await;
    let pool = Pool::start("push", plain_config(server.port()), 2, DispatchStrategy::LeastLoaded)
        .await
        .unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();

    for _ in 0..2 {
        let outcome = pool
            .send_request(Request::new("/hang"), SendOptions::asynchronous(tx.clone()))
            .await
            .unwrap();
        assert!(matches!(outcome, SendOutcome::Accepted(_)));
    }

    let loads: Vec<usize> = pool.workers().await.iter().map(|w| w.in_flight()).collect();
    assert_eq!(loads, vec![1, 1]);
    assert_eq!(pool.stats().await.in_flight, 2);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_batch_keeps_input_order() {
    let server = TestServer::plain().await;
    let pool = Pool::start("push", plain_config(server.port()), 2, DispatchStrategy::RoundRobin)
        .await
        .unwrap();

    let results = pool
        .send_batch(
            vec![
                Request::post("/echo", "first"),
                Request::new("/hang"),
                Request::new("/status/404"),
                Request::new("relative"),
            ],
            Some(Duration::from_millis(100)),
        )
        .await;

    assert_eq!(results.len(), 4);
    assert_eq!(&results[0].as_ref().unwrap().body[..], b"first");
    assert_eq!(results[1], Err(PushError::RequestTimeout));
    assert_eq!(results[2].as_ref().unwrap().status(), Some(404));
    assert!(matches!(results[3], Err(PushError::InvalidRequest(_))));

    pool.shutdown().await;
}

#[tokio::test]
async fn test_timeout_precedence() {
    let server = TestServer::plain().await;
    let mut config = plain_config(server.port());
    config.default_timeout = Duration::from_millis(20);
    let pool = Pool::start("push", config, 1, DispatchStrategy::RandomWorker)
        .await
        .unwrap();

    // Pool default applies when nothing else is set
    let started = tokio::time::Instant::now();
    let result = pool
        .send_request(Request::new("/hang"), SendOptions::sync())
        .await;
    assert_eq!(result, Err(PushError::RequestTimeout));
    assert!(started.elapsed() < Duration::from_secs(2));

    // The per-call option beats the request's own timeout
    let started = tokio::time::Instant::now();
    let result = pool
        .send_request(
            Request::new("/hang").with_timeout(Duration::from_secs(30)),
            SendOptions::sync().with_timeout(Duration::from_millis(50)),
        )
        .await;
    assert_eq!(result, Err(PushError::RequestTimeout));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(2));

    pool.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_fails_pending_requests() {
    let server = TestServer::plain().await;
    let pool = Pool::start("push", plain_config(server.port()), 1, DispatchStrategy::RandomWorker)
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let id = match pool
        .send_request(Request::new("/hang"), SendOptions::asynchronous(tx))
        .await
        .unwrap()
    {
        SendOutcome::Accepted(id) => id,
        other => panic!("expected acceptance, got {:?}", other),
    };
    assert!(wait_until(WAIT, || async { server.hanging() == 1 }).await);

    pool.shutdown().await;

    let delivery = rx.recv().await.unwrap();
    assert_eq!(delivery.request_id, id);
    assert_eq!(delivery.result, Err(PushError::ConnectionLost));
}

#[tokio::test]
async fn test_bad_tls_options_fail_pool_startup() {
    let pki = TestPki::generate();
    let server = TestServer::mtls(&pki).await;
    let mut config = common::mtls_config(server.port(), &pki, &pki.client);
    config.tls_options.verify = Verify::VerifyPeer;
    config.tls_options.cacertfile = None;

    match Pool::start("apns", config, 2, DispatchStrategy::RandomWorker).await {
        Err(StartupError::Options { option, .. }) => assert_eq!(option, "cacertfile"),
        Err(other) => panic!("expected an options error, got {}", other),
        Ok(_) => panic!("pool started without a cacertfile"),
    }
}
