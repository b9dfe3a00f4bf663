//! Client-side counterpart of the unlock endpoint: quote the price, build
//! and submit the transfer, then claim the unlock with the resulting
//! signature. Key custody stays behind [`Signer`]; this module never sees
//! key material.

use base64::{engine::general_purpose, Engine as _};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::message::Message;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signer::Signer;
use solana_sdk::system_instruction;
use solana_sdk::transaction::Transaction;
use spl_associated_token_account::get_associated_token_address;
use thiserror::Error;

use crate::config::MerchantConfig;
use crate::oracle::PriceOracle;
use crate::verify::Currency;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to build transfer: {0}")]
    BuildTx(String),
    #[error("rpc failure: {0}")]
    Rpc(String),
    #[error("unlock request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server rejected payment (tx {signature}): {error}")]
    Rejected { error: String, signature: String },
}

/// A confirmed, server-acknowledged unlock. Only this flips local state;
/// the signature is kept for support follow-up.
#[derive(Clone, Debug)]
pub struct UnlockTicket {
    pub chapter_id: String,
    pub signature: String,
    pub amount: Decimal,
    pub message: String,
}

/// Client-side quote, mirroring the server's computation with a
/// client-fetched rate. The server re-quotes at verification time; the ±2%
/// band absorbs drift between the two.
pub async fn quote(oracle: &PriceOracle, price_usd: Decimal, currency: Currency) -> Decimal {
    let rate = match currency {
        Currency::Native => oracle.sol_usd_rate().await,
        Currency::Stable => Decimal::ONE,
    };
    currency.expected_amount(price_usd, rate)
}

/// Build the unsigned transfer moving `amount` of `currency` from `payer`
/// to the configured treasury.
pub fn build_transfer(
    payer: &Pubkey,
    config: &MerchantConfig,
    currency: Currency,
    amount: Decimal,
) -> Result<Transaction, ClientError> {
    let units = to_atomic(amount, currency.decimals())?;
    let instruction = match currency {
        Currency::Native => system_instruction::transfer(payer, &config.merchant_wallet, units),
        Currency::Stable => {
            let source = get_associated_token_address(payer, &config.usdc_mint);
            let destination = get_associated_token_address(&config.merchant_wallet, &config.usdc_mint);
            spl_token::instruction::transfer_checked(
                &spl_token::id(),
                &source,
                &config.usdc_mint,
                &destination,
                payer,
                &[],
                units,
                currency.decimals(),
            )
            .map_err(|e| ClientError::BuildTx(e.to_string()))?
        }
    };
    let message = Message::new(&[instruction], Some(payer));
    Ok(Transaction::new_unsigned(message))
}

/// Base64 of the unsigned transaction, for handing to an external wallet
/// to sign.
pub fn export_unsigned(tx: &Transaction) -> Result<String, ClientError> {
    let bytes = bincode::serialize(tx).map_err(|e| ClientError::BuildTx(e.to_string()))?;
    Ok(general_purpose::STANDARD.encode(bytes))
}

/// Full flow: quote, build, sign, submit, wait for confirmation, then call
/// the unlock endpoint once with the literal signature the chain returned.
#[allow(clippy::too_many_arguments)]
pub async fn pay_and_unlock(
    rpc: &RpcClient,
    signer: &dyn Signer,
    config: &MerchantConfig,
    oracle: &PriceOracle,
    server_url: &str,
    manga_id: &str,
    chapter_id: &str,
    price_usd: Decimal,
    currency: Currency,
) -> Result<UnlockTicket, ClientError> {
    let amount = quote(oracle, price_usd, currency).await;
    let mut tx = build_transfer(&signer.pubkey(), config, currency, amount)?;
    let blockhash = rpc.get_latest_blockhash().await.map_err(|e| ClientError::Rpc(e.to_string()))?;
    tx.try_sign(&[signer], blockhash).map_err(|e| ClientError::Rpc(e.to_string()))?;
    let signature = rpc
        .send_and_confirm_transaction(&tx)
        .await
        .map_err(|e| ClientError::Rpc(e.to_string()))?;
    log::info!("payment confirmed: {signature}");

    request_unlock(
        server_url,
        &signer.pubkey(),
        manga_id,
        chapter_id,
        &signature.to_string(),
        amount,
        currency,
    )
    .await
}

/// Claim the unlock for an already-confirmed payment.
pub async fn request_unlock(
    server_url: &str,
    payer: &Pubkey,
    manga_id: &str,
    chapter_id: &str,
    signature: &str,
    amount: Decimal,
    currency: Currency,
) -> Result<UnlockTicket, ClientError> {
    let body = serde_json::json!({
        "user_wallet": payer.to_string(),
        "manga_id": manga_id,
        "chapter_id": chapter_id,
        "signature": signature,
        "amount": amount.to_f64().unwrap_or_default(),
        "currency": currency.wire_label(),
    });
    let client = reqwest::Client::new();
    let res = client.post(format!("{server_url}/unlock")).json(&body).send().await?;
    if res.status().is_success() {
        // Fresh and repeat unlocks share one success shape; the client does
        // not distinguish them.
        let ok: serde_json::Value = res.json().await?;
        let message = ok["message"].as_str().unwrap_or("chapter unlocked").to_string();
        Ok(UnlockTicket {
            chapter_id: chapter_id.to_string(),
            signature: signature.to_string(),
            amount,
            message,
        })
    } else {
        let err: serde_json::Value = res.json().await.unwrap_or_default();
        let error = err["error"].as_str().unwrap_or("unknown error").to_string();
        Err(ClientError::Rejected { error, signature: signature.to_string() })
    }
}

fn to_atomic(amount: Decimal, decimals: u8) -> Result<u64, ClientError> {
    let scaled = amount * Decimal::from(10u64.pow(decimals as u32));
    scaled
        .trunc()
        .to_u64()
        .ok_or_else(|| ClientError::BuildTx(format!("amount {amount} out of range")))
}
