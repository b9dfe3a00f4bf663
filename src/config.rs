use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use rust_decimal::Decimal;
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;

/// Chapters with no price (or a non-positive one) are quoted at this.
pub const DEFAULT_PRICE_USD: Decimal = Decimal::from_parts(25, 0, 0, false, 1);

/// SOL/USD rate used when the price oracle is unreachable.
pub const FALLBACK_SOL_USD: Decimal = Decimal::from_parts(150, 0, 0, false, 0);

// Accepted settlement band around the server-side quote: [98%, 102%].
pub const TOLERANCE_MIN: Decimal = Decimal::from_parts(98, 0, 0, false, 2);
pub const TOLERANCE_MAX: Decimal = Decimal::from_parts(102, 0, 0, false, 2);

pub const MAINNET_USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

const DEFAULT_RPC_URL: &str = "https://api.devnet.solana.com";
const DEFAULT_PRICE_API_URL: &str =
    "https://api.coingecko.com/api/v3/simple/price?ids=solana&vs_currencies=usd";

/// Treasury and endpoint configuration, resolved once at startup and passed
/// into the verifier explicitly. No module-level address constants.
#[derive(Clone, Debug)]
pub struct MerchantConfig {
    pub merchant_wallet: Pubkey,
    pub usdc_mint: Pubkey,
    pub rpc_url: String,
    pub price_api_url: String,
    pub db_path: PathBuf,
    pub bind: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{0} is not a valid base58 address")]
    BadAddress(&'static str),
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).map(|v| v.trim().to_string()).unwrap_or_else(|_| default.to_string())
}

impl MerchantConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let merchant = env::var("MERCHANT_WALLET").map_err(|_| ConfigError::Missing("MERCHANT_WALLET"))?;
        let merchant_wallet =
            Pubkey::from_str(merchant.trim()).map_err(|_| ConfigError::BadAddress("MERCHANT_WALLET"))?;
        let usdc_mint = Pubkey::from_str(env_or("USDC_MINT", MAINNET_USDC_MINT).as_str())
            .map_err(|_| ConfigError::BadAddress("USDC_MINT"))?;
        Ok(Self {
            merchant_wallet,
            usdc_mint,
            rpc_url: env_or("RPC_URL", DEFAULT_RPC_URL),
            price_api_url: env_or("PRICE_API_URL", DEFAULT_PRICE_API_URL),
            db_path: PathBuf::from(env_or("UNLOCK_DB", "unlocks.db")),
            bind: env_or("BIND_ADDR", "0.0.0.0:3000"),
        })
    }
}
