use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use solana_sdk::pubkey::Pubkey;
use tokio::net::TcpListener;

use chapter_unlock_backend::chain::{ChainClient, ChainTransaction, TokenBalance};
use chapter_unlock_backend::config::{MerchantConfig, MAINNET_USDC_MINT};
use chapter_unlock_backend::error::UnlockError;
use chapter_unlock_backend::oracle::PriceOracle;
use chapter_unlock_backend::server::{router, AppState};
use chapter_unlock_backend::store::{Chapter, UnlockStore};
use chapter_unlock_backend::verify::Verifier;

#[derive(Clone, Default)]
struct MockChain {
    txs: HashMap<String, ChainTransaction>,
}

#[async_trait]
impl ChainClient for MockChain {
    async fn fetch_transaction(&self, signature: &str) -> Result<ChainTransaction, UnlockError> {
        self.txs.get(signature).cloned().ok_or(UnlockError::TransactionNotFound)
    }
}

/// Quote stub pinned to 100 USD/SOL so a 2.5 USD chapter expects 0.025 SOL.
async fn spawn_oracle(rate: f64) -> String {
    let app = axum::Router::new().route(
        "/",
        axum::routing::get(move || async move {
            axum::Json(serde_json::json!({ "solana": { "usd": rate } }))
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}/")
}

struct Harness {
    base: String,
    store: UnlockStore,
    payer: Pubkey,
    _dir: tempfile::TempDir,
}

async fn start(chapters: Vec<Chapter>, txs: HashMap<String, ChainTransaction>) -> Harness {
    let payer = Pubkey::new_unique();
    let merchant = Pubkey::new_unique();
    start_with(chapters, txs, payer, merchant).await
}

async fn start_with(
    chapters: Vec<Chapter>,
    txs: HashMap<String, ChainTransaction>,
    payer: Pubkey,
    merchant: Pubkey,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = UnlockStore::open(dir.path().join("db")).unwrap();
    for chapter in &chapters {
        store.put_chapter(chapter).unwrap();
    }
    let config = MerchantConfig {
        merchant_wallet: merchant,
        usdc_mint: MAINNET_USDC_MINT.parse().unwrap(),
        rpc_url: String::new(),
        price_api_url: spawn_oracle(100.0).await,
        db_path: dir.path().join("db"),
        bind: String::new(),
    };
    let verifier = Verifier::new(
        &config,
        Arc::new(MockChain { txs }),
        PriceOracle::new(config.price_api_url.clone()),
        store.clone(),
    );
    let app = router(AppState { verifier: Arc::new(verifier) });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    Harness { base: format!("http://{addr}"), store, payer, _dir: dir }
}

fn premium_chapter() -> Chapter {
    Chapter {
        id: "ch42".into(),
        manga_id: "m1".into(),
        is_premium: true,
        price_usd: Some(Decimal::new(25, 1)),
    }
}

/// Native transfer crediting `merchant_delta` lamports to the merchant.
fn native_tx(payer: &Pubkey, merchant: &Pubkey, merchant_delta: u64) -> ChainTransaction {
    ChainTransaction {
        account_keys: vec![
            payer.to_string(),
            merchant.to_string(),
            "11111111111111111111111111111111".into(),
        ],
        pre_balances: vec![1_000_000_000, 50_000_000, 1],
        post_balances: vec![1_000_000_000 - merchant_delta - 5_000, 50_000_000 + merchant_delta, 1],
        pre_token_balances: vec![],
        post_token_balances: vec![],
    }
}

fn claim_body(harness: &Harness, signature: &str) -> serde_json::Value {
    serde_json::json!({
        "user_wallet": harness.payer.to_string(),
        "manga_id": "m1",
        "chapter_id": "ch42",
        "signature": signature,
        "amount": 0.025,
        "currency": "SOL",
    })
}

async fn post_unlock(base: &str, body: &serde_json::Value) -> (u16, serde_json::Value) {
    let res = reqwest::Client::new()
        .post(format!("{base}/unlock"))
        .json(body)
        .send()
        .await
        .unwrap();
    let status = res.status().as_u16();
    (status, res.json().await.unwrap())
}

#[tokio::test]
async fn fresh_unlock_then_idempotent_repeat() {
    let payer = Pubkey::new_unique();
    let merchant = Pubkey::new_unique();
    let txs = HashMap::from([("sig-abc".to_string(), native_tx(&payer, &merchant, 24_800_000))]);
    let harness = start_with(vec![premium_chapter()], txs, payer, merchant).await;

    let (status, body) = post_unlock(&harness.base, &claim_body(&harness, "sig-abc")).await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["message"], "chapter unlocked");
    assert_eq!(body["chapter_id"], "ch42");

    let record = harness.store.unlock(&payer.to_string(), "ch42").unwrap().unwrap();
    assert_eq!(record.signature, "sig-abc");
    assert_eq!(record.amount_usd, Decimal::new(25, 1));

    // The repeat claim succeeds without writing a second record.
    let (status, body) = post_unlock(&harness.base, &claim_body(&harness, "sig-abc")).await;
    assert_eq!(status, 200);
    assert_eq!(body["message"], "chapter already unlocked");
    let record = harness.store.unlock(&payer.to_string(), "ch42").unwrap().unwrap();
    assert_eq!(record.signature, "sig-abc");
}

#[tokio::test]
async fn payment_to_other_recipient_is_rejected() {
    let payer = Pubkey::new_unique();
    let merchant = Pubkey::new_unique();
    let attacker = Pubkey::new_unique();
    // Merchant appears in the account list, but the funds went elsewhere.
    let tx = ChainTransaction {
        account_keys: vec![payer.to_string(), attacker.to_string(), merchant.to_string()],
        pre_balances: vec![1_000_000_000, 0, 50_000_000],
        post_balances: vec![975_195_000, 24_800_000, 50_000_000],
        pre_token_balances: vec![],
        post_token_balances: vec![],
    };
    let txs = HashMap::from([("sig-abc".to_string(), tx)]);
    let harness = start_with(vec![premium_chapter()], txs, payer, merchant).await;

    let (status, body) = post_unlock(&harness.base, &claim_body(&harness, "sig-abc")).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "funds were not received by the merchant wallet");
    assert!(harness.store.unlock(&payer.to_string(), "ch42").unwrap().is_none());
}

#[tokio::test]
async fn amount_below_band_is_rejected() {
    let payer = Pubkey::new_unique();
    let merchant = Pubkey::new_unique();
    let txs = HashMap::from([("sig-low".to_string(), native_tx(&payer, &merchant, 24_000_000))]);
    let harness = start_with(vec![premium_chapter()], txs, payer, merchant).await;

    let (status, body) = post_unlock(&harness.base, &claim_body(&harness, "sig-low")).await;
    assert_eq!(status, 400);
    let error = body["error"].as_str().unwrap();
    assert!(error.contains("outside accepted range"), "{error}");
    assert!(harness.store.unlock(&payer.to_string(), "ch42").unwrap().is_none());
}

#[tokio::test]
async fn merchant_absent_from_transaction_is_rejected() {
    let payer = Pubkey::new_unique();
    let merchant = Pubkey::new_unique();
    let other = Pubkey::new_unique();
    let txs = HashMap::from([("sig-abc".to_string(), native_tx(&payer, &other, 24_800_000))]);
    let harness = start_with(vec![premium_chapter()], txs, payer, merchant).await;

    let (status, body) = post_unlock(&harness.base, &claim_body(&harness, "sig-abc")).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "merchant is not a party to this transaction");
}

#[tokio::test]
async fn unknown_signature_is_not_found_on_chain() {
    let harness = start(vec![premium_chapter()], HashMap::new()).await;
    let (status, body) = post_unlock(&harness.base, &claim_body(&harness, "sig-missing")).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "transaction not found on chain");
}

#[tokio::test]
async fn free_chapter_cannot_be_bought() {
    let chapter = Chapter { is_premium: false, ..premium_chapter() };
    let harness = start(vec![chapter], HashMap::new()).await;
    let (status, body) = post_unlock(&harness.base, &claim_body(&harness, "sig-abc")).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "chapter is not a premium chapter");
}

#[tokio::test]
async fn unknown_chapter_is_404() {
    let harness = start(vec![], HashMap::new()).await;
    let (status, body) = post_unlock(&harness.base, &claim_body(&harness, "sig-abc")).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"], "chapter not found");
}

#[tokio::test]
async fn wrong_parent_work_is_404() {
    let harness = start(vec![premium_chapter()], HashMap::new()).await;
    let mut body = claim_body(&harness, "sig-abc");
    body["manga_id"] = "m2".into();
    let (status, body) = post_unlock(&harness.base, &body).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"], "chapter not found");
}

#[tokio::test]
async fn unsupported_currency_is_rejected() {
    let harness = start(vec![premium_chapter()], HashMap::new()).await;
    let mut body = claim_body(&harness, "sig-abc");
    body["currency"] = "DOGE".into();
    let (status, body) = post_unlock(&harness.base, &body).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "unsupported currency: DOGE");
}

#[tokio::test]
async fn invalid_payer_address_is_rejected() {
    let harness = start(vec![premium_chapter()], HashMap::new()).await;
    let mut body = claim_body(&harness, "sig-abc");
    body["user_wallet"] = "not-a-wallet".into();
    let (status, body) = post_unlock(&harness.base, &body).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "invalid payer address");
}

#[tokio::test]
async fn missing_field_is_400_with_error_shape() {
    let harness = start(vec![premium_chapter()], HashMap::new()).await;
    let body = serde_json::json!({
        "user_wallet": harness.payer.to_string(),
        "manga_id": "m1",
        "chapter_id": "ch42",
        // signature omitted
        "amount": 0.025,
        "currency": "SOL",
    });
    let (status, body) = post_unlock(&harness.base, &body).await;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().starts_with("invalid request"), "{body}");
}

#[tokio::test]
async fn stable_payment_unlocks() {
    let payer = Pubkey::new_unique();
    let merchant = Pubkey::new_unique();
    let row = |owner: &Pubkey, amount: &str| TokenBalance {
        account_index: 1,
        mint: MAINNET_USDC_MINT.into(),
        owner: Some(owner.to_string()),
        amount: amount.parse().unwrap(),
    };
    let tx = ChainTransaction {
        account_keys: vec![payer.to_string(), "TokenAcc1".into(), "TokenAcc2".into()],
        pre_balances: vec![10_000_000, 2_039_280, 2_039_280],
        post_balances: vec![9_995_000, 2_039_280, 2_039_280],
        pre_token_balances: vec![row(&payer, "10.000000")],
        post_token_balances: vec![row(&payer, "7.520000"), row(&merchant, "2.480000")],
    };
    let txs = HashMap::from([("sig-usdc".to_string(), tx)]);
    let harness = start_with(vec![premium_chapter()], txs, payer, merchant).await;

    let mut body = claim_body(&harness, "sig-usdc");
    body["currency"] = "USDC".into();
    body["amount"] = 2.5.into();
    let (status, body) = post_unlock(&harness.base, &body).await;
    assert_eq!(status, 200, "{body}");
    let record = harness.store.unlock(&payer.to_string(), "ch42").unwrap().unwrap();
    assert_eq!(record.signature, "sig-usdc");
}

#[tokio::test]
async fn double_pay_race_credits_once() {
    let payer = Pubkey::new_unique();
    let merchant = Pubkey::new_unique();
    let txs = HashMap::from([
        ("sig-a".to_string(), native_tx(&payer, &merchant, 24_800_000)),
        ("sig-b".to_string(), native_tx(&payer, &merchant, 25_100_000)),
    ]);
    let harness = start_with(vec![premium_chapter()], txs, payer, merchant).await;

    let body_a = claim_body(&harness, "sig-a");
    let body_b = claim_body(&harness, "sig-b");
    let (first, second) = tokio::join!(
        post_unlock(&harness.base, &body_a),
        post_unlock(&harness.base, &body_b),
    );
    assert_eq!(first.0, 200, "{:?}", first.1);
    assert_eq!(second.0, 200, "{:?}", second.1);

    let record = harness.store.unlock(&payer.to_string(), "ch42").unwrap().unwrap();
    assert!(record.signature == "sig-a" || record.signature == "sig-b");
}

#[tokio::test]
async fn health_endpoint_responds() {
    let harness = start(vec![], HashMap::new()).await;
    let res = reqwest::get(format!("{}/health", harness.base)).await.unwrap();
    assert!(res.status().is_success());
}
