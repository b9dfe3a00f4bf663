//! Fetching finalized transactions from the chain node.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcTransactionConfig;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::signature::Signature;
use solana_transaction_status::{
    EncodedConfirmedTransactionWithStatusMeta, EncodedTransaction, UiLoadedAddresses, UiMessage,
    UiTransactionEncoding, UiTransactionTokenBalance,
};
use tokio::time::sleep;

use crate::error::UnlockError;

/// Finality can lag submission, so the fetch polls a few times before
/// declaring the signature unknown.
pub const FETCH_ATTEMPTS: usize = 3;
pub const FETCH_RETRY_DELAY: Duration = Duration::from_secs(2);

/// One row of pre/post token balance metadata, reduced to what settlement
/// checking needs. `amount` is already scaled by the mint's decimals.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenBalance {
    pub account_index: usize,
    pub mint: String,
    pub owner: Option<String>,
    pub amount: Decimal,
}

/// A finalized transaction as seen by the verifier: the ordered account
/// list plus native and token balances on both sides of execution.
#[derive(Clone, Debug, Default)]
pub struct ChainTransaction {
    pub account_keys: Vec<String>,
    pub pre_balances: Vec<u64>,
    pub post_balances: Vec<u64>,
    pub pre_token_balances: Vec<TokenBalance>,
    pub post_token_balances: Vec<TokenBalance>,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn fetch_transaction(&self, signature: &str) -> Result<ChainTransaction, UnlockError>;
}

pub struct RpcChainClient {
    rpc: RpcClient,
}

impl RpcChainClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self { rpc: RpcClient::new(url.into()) }
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn fetch_transaction(&self, signature: &str) -> Result<ChainTransaction, UnlockError> {
        let sig = Signature::from_str(signature).map_err(|_| UnlockError::BadSignature)?;
        for attempt in 1..=FETCH_ATTEMPTS {
            let config = RpcTransactionConfig {
                encoding: Some(UiTransactionEncoding::Json),
                commitment: Some(CommitmentConfig::confirmed()),
                max_supported_transaction_version: Some(0),
            };
            match self.rpc.get_transaction_with_config(&sig, config).await {
                Ok(encoded) => return decode_transaction(encoded),
                Err(err) => {
                    log::debug!("transaction {signature} not visible (attempt {attempt}/{FETCH_ATTEMPTS}): {err}");
                    if attempt < FETCH_ATTEMPTS {
                        sleep(FETCH_RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(UnlockError::TransactionNotFound)
    }
}

fn decode_transaction(
    encoded: EncodedConfirmedTransactionWithStatusMeta,
) -> Result<ChainTransaction, UnlockError> {
    let inner = encoded.transaction;
    let meta = inner.meta.ok_or(UnlockError::BalanceDataMissing)?;
    if meta.err.is_some() {
        return Err(UnlockError::OnChainFailure);
    }

    let mut account_keys = match inner.transaction {
        EncodedTransaction::Json(tx) => match tx.message {
            UiMessage::Raw(raw) => raw.account_keys,
            UiMessage::Parsed(parsed) => parsed.account_keys.into_iter().map(|a| a.pubkey).collect(),
        },
        _ => return Err(UnlockError::BalanceDataMissing),
    };
    // Versioned transactions carry lookup-table keys separately; balance
    // indices count them after the static list, writable first.
    let loaded: Option<UiLoadedAddresses> = meta.loaded_addresses.into();
    if let Some(loaded) = loaded {
        account_keys.extend(loaded.writable);
        account_keys.extend(loaded.readonly);
    }

    let pre_token_balances = convert_token_balances(Option::from(meta.pre_token_balances));
    let post_token_balances = convert_token_balances(Option::from(meta.post_token_balances));

    Ok(ChainTransaction {
        account_keys,
        pre_balances: meta.pre_balances,
        post_balances: meta.post_balances,
        pre_token_balances,
        post_token_balances,
    })
}

fn convert_token_balances(balances: Option<Vec<UiTransactionTokenBalance>>) -> Vec<TokenBalance> {
    balances
        .unwrap_or_default()
        .into_iter()
        .filter_map(|b| {
            let amount = token_amount(&b.ui_token_amount.amount, b.ui_token_amount.decimals)?;
            Some(TokenBalance {
                account_index: b.account_index as usize,
                mint: b.mint,
                owner: Option::from(b.owner),
                amount,
            })
        })
        .collect()
}

/// Exact decimal from a raw atomic-unit amount string. The string form is
/// used so no float rounding can leak into monetary comparisons.
fn token_amount(raw: &str, decimals: u8) -> Option<Decimal> {
    let units = raw.parse::<i128>().ok()?;
    Some(Decimal::from_i128_with_scale(units, decimals as u32))
}
