use rust_decimal::Decimal;
use tokio::net::TcpListener;

use chapter_unlock_backend::config::FALLBACK_SOL_USD;
use chapter_unlock_backend::oracle::PriceOracle;

async fn spawn_quote_server(body: serde_json::Value) -> String {
    let app = axum::Router::new()
        .route("/", axum::routing::get(move || async move { axum::Json(body.clone()) }));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}/")
}

#[tokio::test]
async fn live_rate_is_used() {
    let url = spawn_quote_server(serde_json::json!({ "solana": { "usd": 123.45 } })).await;
    let oracle = PriceOracle::new(url);
    assert_eq!(oracle.sol_usd_rate().await, Decimal::new(12345, 2));
}

#[tokio::test]
async fn unreachable_endpoint_falls_back() {
    // Bind then drop so the port is known-dead.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let oracle = PriceOracle::new(format!("http://{addr}/"));
    assert_eq!(oracle.sol_usd_rate().await, FALLBACK_SOL_USD);
}

#[tokio::test]
async fn malformed_body_falls_back() {
    let url = spawn_quote_server(serde_json::json!({ "hello": "world" })).await;
    let oracle = PriceOracle::new(url);
    assert_eq!(oracle.sol_usd_rate().await, FALLBACK_SOL_USD);
}

#[tokio::test]
async fn non_positive_rate_falls_back() {
    let url = spawn_quote_server(serde_json::json!({ "solana": { "usd": 0.0 } })).await;
    let oracle = PriceOracle::new(url);
    assert_eq!(oracle.sol_usd_rate().await, FALLBACK_SOL_USD);
}

#[tokio::test]
async fn http_error_status_falls_back() {
    let app = axum::Router::new().route(
        "/",
        axum::routing::get(|| async { axum::http::StatusCode::INTERNAL_SERVER_ERROR }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    let oracle = PriceOracle::new(format!("http://{addr}/"));
    assert_eq!(oracle.sol_usd_rate().await, FALLBACK_SOL_USD);
}
