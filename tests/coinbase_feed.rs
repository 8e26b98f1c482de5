use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use vwap_rs::test_utils::SharedBuffer;
use vwap_rs::{
    Accumulator, CoinbaseFeed, FeedConfig, FeedConnector, FeedError, RunState, ServiceConfig, ServiceError,
    VwapService,
};

// Accepts one client, waits for its first request, replays `frames` and
// closes with `reason`. Resolves to the request the client sent.
async fn spawn_server(frames: Vec<String>, reason: &'static str) -> (SocketAddr, tokio::task::JoinHandle<serde_json::Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let request = match ws.next().await {
            Some(Ok(Message::Text(text))) => serde_json::from_str(&text).unwrap(),
            _ => return serde_json::Value::Null,
        };
        for frame in frames {
            ws.send(Message::Text(frame)).await.unwrap();
        }
        ws.close(Some(CloseFrame { code: CloseCode::Normal, reason: reason.into() }))
            .await
            .unwrap();
        request
    });
    (addr, server)
}

fn feed_config(addr: SocketAddr) -> FeedConfig {
    FeedConfig { ws_url: format!("ws://{addr}"), ..FeedConfig::default() }
}

#[tokio::test]
async fn test_feed_delivers_frames_in_order_then_closes() {
    let frames = vec![
        r#"{"type":"subscriptions","channels":[{"name":"matches","product_ids":["BTC-USD"]}]}"#.to_string(),
        r#"{"type":"match","product_id":"BTC-USD","price":"100","size":"1"}"#.to_string(),
        r#"{"type":"match","product_id":"BTC-USD","price":"101","size":"2"}"#.to_string(),
    ];
    let (addr, server) = spawn_server(frames.clone(), "bye").await;

    let feed = CoinbaseFeed::connect(feed_config(addr), CancellationToken::new()).await.unwrap();
    feed.subscribe("matches", &["BTC-USD".to_string()]).await.unwrap();
    let mut feeds = feed.feeds().unwrap();
    assert!(matches!(feed.feeds(), Err(FeedError::FeedsTaken)));

    for expected in &frames {
        let raw = tokio::time::timeout(Duration::from_secs(2), feeds.messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(String::from_utf8(raw).unwrap(), *expected);
    }

    let err = tokio::time::timeout(Duration::from_secs(2), feeds.errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(err, FeedError::Closed(Some(ref reason)) if reason == "bye"));

    let request = server.await.unwrap();
    assert_eq!(
        request,
        serde_json::json!({"type":"subscribe","channels":[{"name":"matches","product_ids":["BTC-USD"]}]})
    );
    // the server already closed; closing again must not hang
    let _ = tokio::time::timeout(Duration::from_secs(2), feed.close()).await.unwrap();
}

#[tokio::test]
async fn test_feed_rejects_invalid_requests() {
    let (addr, _server) = spawn_server(Vec::new(), "bye").await;
    let feed = CoinbaseFeed::connect(feed_config(addr), CancellationToken::new()).await.unwrap();

    assert!(matches!(
        feed.subscribe("level2", &["BTC-USD".to_string()]).await,
        Err(FeedError::UnsupportedChannel(_))
    ));
    assert!(matches!(feed.unsubscribe("matches", &[]).await, Err(FeedError::NoProductIds)));
}

#[tokio::test]
async fn test_connect_failure() {
    // bind then drop to get a port nobody listens on
    let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    let result = CoinbaseFeed::connect(feed_config(addr), CancellationToken::new()).await;
    assert!(matches!(result, Err(FeedError::Connect { .. })));
}

#[tokio::test]
async fn test_service_over_websocket() {
    let frames = vec![
        r#"{"type":"subscriptions","channels":[{"name":"matches","product_ids":["ETH-BTC","ETH-USD"]}]}"#.to_string(),
        r#"{"type":"match","product_id":"ETH-BTC","price":"5.0","size":"2"}"#.to_string(),
        r#"{"type":"match","product_id":"ETH-USD","price":"3000","size":"0.5"}"#.to_string(),
        r#"{"type":"match","product_id":"ETH-BTC","price":"4.0","size":"5"}"#.to_string(),
    ];
    let (addr, server) = spawn_server(frames, "maintenance").await;

    let feed = CoinbaseFeed::connect(feed_config(addr), CancellationToken::new()).await.unwrap();
    let output = SharedBuffer::default();
    let config = ServiceConfig { output: Box::new(output.clone()), ..ServiceConfig::default() };
    let mut service = VwapService::new(feed, CancellationToken::new(), config);
    service.add_trading_pairs(["eth-btc", "eth-usd"]);

    let err = tokio::time::timeout(Duration::from_secs(5), service.run())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ServiceError::Feed(FeedError::Closed(_))));
    assert_eq!(service.state(), RunState::Terminated);

    assert_eq!(
        output.lines(),
        vec!["ETH-BTC: 5.000000", "ETH-USD: 3000.000000", "ETH-BTC: 4.285714"]
    );
    assert_eq!(service.accumulator("ETH-BTC").unwrap().n_points(), 2);

    let request = server.await.unwrap();
    assert_eq!(request["channels"][0]["product_ids"], serde_json::json!(["ETH-BTC", "ETH-USD"]));
}
