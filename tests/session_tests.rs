//! Session tests against an in-process mock gateway.
//!
//! Each test spins up a real WebSocket server speaking the NDAX
//! envelope, scripted for one scenario: correlation, the login
//! handshake, subscription lifecycle, reconnect with replay, rejection
//! mapping, timeouts, and unhandled-event forwarding.
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMsg;

use ndax_sdk::{
    ConnectionState, Credentials, NdaxClient, NdaxError, SessionConfig, WsConfig,
};

/// Build one outgoing envelope, payload string-encoded as on the real
/// wire.
fn envelope(m: i64, i: u64, n: &str, o: &Value) -> WsMsg {
    WsMsg::Text(json!({ "m": m, "i": i, "n": n, "o": o.to_string() }).to_string())
}

/// Parse an incoming request into (sequence, method, payload).
fn parse(text: &str) -> (u64, String, Value) {
    let v: Value = serde_json::from_str(text).unwrap();
    let o: Value = serde_json::from_str(v["o"].as_str().unwrap()).unwrap();
    (
        v["i"].as_u64().unwrap(),
        v["n"].as_str().unwrap().to_string(),
        o,
    )
}

/// A config tuned for fast tests: short timeouts, quick reconnect.
fn test_config(addr: &str) -> SessionConfig {
    SessionConfig::new(addr)
        .with_request_timeout(Duration::from_millis(1500))
        .with_ws(WsConfig {
            connect_timeout: Duration::from_secs(2),
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            max_attempts: 5,
            stable_threshold: Duration::from_secs(30),
        })
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("ws://{}", listener.local_addr().unwrap());
    (listener, addr)
}

#[tokio::test]
async fn test_out_of_order_replies_reach_the_right_callers() {
    let (listener, addr) = bind().await;

    // Collect two requests, then answer them in reverse order.
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        let mut requests = Vec::new();
        while requests.len() < 2 {
            if let Some(Ok(WsMsg::Text(text))) = ws.next().await {
                requests.push(parse(&text));
            }
        }
        for (i, n, _) in requests.into_iter().rev() {
            ws.send(envelope(1, i, &n, &json!({ "Echo": n })))
                .await
                .unwrap();
        }
    });

    // Anonymous session: ready without any handshake.
    let mut client = NdaxClient::new(test_config(&addr));
    client.start().unwrap();
    client.authenticate().await.unwrap();

    let (products, level1) = tokio::join!(client.get_products(), client.get_level1(5));
    assert_eq!(products.unwrap()["Echo"], "GetProducts");
    assert_eq!(level1.unwrap()["Echo"], "GetLevel1");

    client.stop().await;
}

#[tokio::test]
async fn test_two_factor_handshake_and_queued_call_flush() {
    let (listener, addr) = bind().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        while let Some(Ok(WsMsg::Text(text))) = ws.next().await {
            let (i, n, o) = parse(&text);
            match n.as_str() {
                "AuthenticateUser" => {
                    assert_eq!(o["UserName"], "alice");
                    ws.send(envelope(
                        1,
                        i,
                        &n,
                        &json!({ "Authenticated": false, "Requires2FA": true, "TwoFAType": "Google" }),
                    ))
                    .await
                    .unwrap();
                }
                "Authenticate2FA" => {
                    let code = o["Code"].as_str().unwrap();
                    assert_eq!(code.len(), 6);
                    assert!(code.chars().all(|c| c.is_ascii_digit()));
                    ws.send(envelope(
                        1,
                        i,
                        &n,
                        &json!({ "Authenticated": true, "SessionToken": "tok", "UserId": 9 }),
                    ))
                    .await
                    .unwrap();
                }
                "GetAccountPositions" => {
                    assert_eq!(o["AccountId"], 77);
                    ws.send(envelope(
                        1,
                        i,
                        &n,
                        &json!([{ "ProductSymbol": "BTC", "Amount": 0.5 }]),
                    ))
                    .await
                    .unwrap();
                }
                other => panic!("unexpected request {other}"),
            }
        }
    });

    let config = test_config(&addr)
        .with_credentials(
            Credentials::new("alice", "hunter2")
                .with_totp_secret("GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ"),
        )
        .with_account_id(77);
    let mut client = NdaxClient::new(config);
    client.start().unwrap();

    // Issued before the handshake finishes: queued, then flushed.
    let (positions, auth) = tokio::join!(client.get_account_positions(), client.authenticate());
    auth.unwrap();
    let positions = positions.unwrap();
    assert_eq!(positions[0]["ProductSymbol"], "BTC");
    assert_eq!(client.state(), ConnectionState::Authenticated);

    client.stop().await;
}

#[tokio::test]
async fn test_subscription_snapshot_updates_and_unsubscribe() {
    let (listener, addr) = bind().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        while let Some(Ok(WsMsg::Text(text))) = ws.next().await {
            let (i, n, o) = parse(&text);
            match n.as_str() {
                "SubscribeLevel1" => {
                    assert_eq!(o["InstrumentId"], 5);
                    ws.send(envelope(1, i, &n, &json!({ "InstrumentId": 5, "BestBid": 1.0 })))
                        .await
                        .unwrap();
                    ws.send(envelope(
                        3,
                        1,
                        "Level1UpdateEvent",
                        &json!({ "InstrumentId": 5, "BestBid": 2.0 }),
                    ))
                    .await
                    .unwrap();
                }
                "UnsubscribeLevel1" => {
                    ws.send(envelope(1, i, &n, &json!({ "result": true })))
                        .await
                        .unwrap();
                    // Late event after confirmation; nobody listens.
                    ws.send(envelope(
                        3,
                        3,
                        "Level1UpdateEvent",
                        &json!({ "InstrumentId": 5, "BestBid": 3.0 }),
                    ))
                    .await
                    .unwrap();
                }
                other => panic!("unexpected request {other}"),
            }
        }
    });

    let mut client = NdaxClient::new(test_config(&addr));
    client.start().unwrap();
    client.authenticate().await.unwrap();

    let mut level1 = client.subscribe_level1(5).await.unwrap();
    // Snapshot from the subscribe reply, then the push.
    assert_eq!(level1.next().await.unwrap()["BestBid"], 1.0);
    assert_eq!(level1.next().await.unwrap()["BestBid"], 2.0);

    client.unsubscribe_level1(5).await.unwrap();
    // The stream ends once the server confirms; the late event is gone.
    assert!(level1.next().await.is_none());

    client.stop().await;
}

#[tokio::test]
async fn test_duplicate_subscription_rejected() {
    let (listener, addr) = bind().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        while let Some(Ok(WsMsg::Text(text))) = ws.next().await {
            let (i, n, _) = parse(&text);
            ws.send(envelope(1, i, &n, &json!({ "InstrumentId": 5 })))
                .await
                .unwrap();
        }
    });

    let mut client = NdaxClient::new(test_config(&addr));
    client.start().unwrap();
    client.authenticate().await.unwrap();

    let _stream = client.subscribe_trades(5, 10).await.unwrap();
    let err = client.subscribe_trades(5, 10).await.unwrap_err();
    assert!(matches!(err, NdaxError::DuplicateSubscription(_)));

    client.stop().await;
}

#[tokio::test]
async fn test_reconnect_reauthenticates_and_replays_subscriptions() {
    let (listener, addr) = bind().await;
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<u64>();

    tokio::spawn(async move {
        for connection in 0..2 {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            while let Some(Ok(WsMsg::Text(text))) = ws.next().await {
                let (i, n, _) = parse(&text);
                seen_tx.send(i).unwrap();
                match n.as_str() {
                    "AuthenticateUser" => {
                        ws.send(envelope(1, i, &n, &json!({ "Authenticated": true })))
                            .await
                            .unwrap();
                    }
                    "SubscribeTicker" => {
                        let generation = connection + 1;
                        ws.send(envelope(1, i, &n, &json!({ "Generation": generation })))
                            .await
                            .unwrap();
                        if connection == 0 {
                            // Kill the first connection after the ack.
                            let _ = ws.close(None).await;
                            break;
                        }
                    }
                    other => panic!("unexpected request {other}"),
                }
            }
        }
    });

    let config = test_config(&addr).with_credentials(Credentials::new("alice", "hunter2"));
    let mut client = NdaxClient::new(config);
    client.start().unwrap();
    client.authenticate().await.unwrap();

    let mut ticker = client.subscribe_ticker(7, 60, 10).await.unwrap();
    assert_eq!(ticker.next().await.unwrap()["Generation"], 1);
    // The drop is invisible to the stream: the replayed subscription
    // feeds it again after re-auth.
    assert_eq!(ticker.next().await.unwrap()["Generation"], 2);

    client.stop().await;

    // Sequence ids stay even and strictly increasing across the
    // reconnect; replies can never be misattributed to the old socket.
    let mut ids = Vec::new();
    while let Some(id) = seen_rx.recv().await {
        ids.push(id);
    }
    assert!(ids.len() >= 4);
    assert!(ids.iter().all(|i| i % 2 == 0));
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_gateway_rejection_maps_to_rejected_error() {
    let (listener, addr) = bind().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        while let Some(Ok(WsMsg::Text(text))) = ws.next().await {
            let (i, n, _) = parse(&text);
            ws.send(envelope(
                1,
                i,
                &n,
                &json!({ "result": false, "errormsg": "Not Authorized", "errorcode": 20, "detail": null }),
            ))
            .await
            .unwrap();
        }
    });

    let mut client = NdaxClient::new(test_config(&addr));
    client.start().unwrap();
    client.authenticate().await.unwrap();

    let err = client.get_products().await.unwrap_err();
    match err {
        NdaxError::Rejected { code, message } => {
            assert_eq!(code, 20);
            assert_eq!(message, "Not Authorized");
        }
        other => panic!("expected Rejected, got {other:?}"),
    }

    client.stop().await;
}

#[tokio::test]
async fn test_failed_credentials_are_terminal() {
    let (listener, addr) = bind().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        while let Some(Ok(WsMsg::Text(text))) = ws.next().await {
            let (i, n, _) = parse(&text);
            assert_eq!(n, "AuthenticateUser");
            ws.send(envelope(
                1,
                i,
                &n,
                &json!({ "Authenticated": false, "errormsg": "Invalid username or password" }),
            ))
            .await
            .unwrap();
        }
    });

    let config = test_config(&addr).with_credentials(Credentials::new("alice", "wrong"));
    let mut client = NdaxClient::new(config);
    client.start().unwrap();

    assert!(matches!(
        client.authenticate().await,
        Err(NdaxError::AuthenticationFailed(_))
    ));
    assert_eq!(client.state(), ConnectionState::Failed);

    // No retry loop with bad credentials; calls fail fast.
    assert!(client.get_products().await.is_err());

    client.stop().await;
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let (listener, addr) = bind().await;

    // Accept the connection, read requests, never reply.
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let mut client = NdaxClient::new(test_config(&addr));
    client.start().unwrap();
    client.authenticate().await.unwrap();

    let err = client.get_products().await.unwrap_err();
    assert!(matches!(err, NdaxError::RequestTimeout(_)));

    client.stop().await;
}

#[tokio::test]
async fn test_unmatched_events_surface_on_the_diagnostic_stream() {
    let (listener, addr) = bind().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        ws.send(envelope(
            3,
            9,
            "SystemStatusEvent",
            &json!({ "Status": "Degraded" }),
        ))
        .await
        .unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let mut client = NdaxClient::new(test_config(&addr));
    client.start().unwrap();
    let mut unhandled = client.unhandled_events().unwrap();
    client.authenticate().await.unwrap();

    let frame = unhandled.next().await.unwrap();
    assert_eq!(frame.method, "SystemStatusEvent");
    assert_eq!(frame.payload_value().unwrap()["Status"], "Degraded");

    client.stop().await;
}

#[tokio::test]
async fn test_dropping_the_client_shuts_the_supervisor_down() {
    let (listener, addr) = bind().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let mut client = NdaxClient::new(test_config(&addr));
    client.start().unwrap();
    client.authenticate().await.unwrap();

    // No explicit stop: closing the command channel is enough.
    let mut states = client.state_stream();
    drop(client);

    let deadline = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *states.borrow_and_update() == ConnectionState::Stopped {
                return;
            }
            states.changed().await.unwrap();
        }
    });
    deadline.await.expect("supervisor never reached Stopped");
}

#[tokio::test]
async fn test_exhausted_reconnects_fail_the_session() {
    // Nothing listens on this address.
    let config = SessionConfig::new("ws://127.0.0.1:9").with_ws(WsConfig {
        connect_timeout: Duration::from_millis(200),
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(20),
        max_attempts: 2,
        stable_threshold: Duration::from_secs(30),
    });
    let mut client = NdaxClient::new(config);
    client.start().unwrap();

    let mut states = client.state_stream();
    let deadline = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *states.borrow_and_update() == ConnectionState::Failed {
                return;
            }
            states.changed().await.unwrap();
        }
    });
    deadline.await.expect("session never reached Failed");

    client.stop().await;
}
