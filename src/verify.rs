//! The payment verifier: authenticates a claimed on-chain transaction
//! against the expected payer, treasury, amount, and currency, then records
//! the unlock at most once.

use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;

use crate::chain::{ChainClient, ChainTransaction, TokenBalance};
use crate::config::{MerchantConfig, TOLERANCE_MAX, TOLERANCE_MIN};
use crate::error::{Party, UnlockError};
use crate::oracle::PriceOracle;
use crate::store::{StoreError, UnlockRecord, UnlockStore};

/// The two settleable assets. Wire labels, decimals, and the expected-amount
/// formula hang off the variant so adding an asset is a variant addition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Currency {
    #[serde(rename = "SOL")]
    Native,
    #[serde(rename = "USDC")]
    Stable,
}

impl Currency {
    pub fn from_wire(label: &str) -> Option<Self> {
        match label {
            "SOL" => Some(Currency::Native),
            "USDC" => Some(Currency::Stable),
            _ => None,
        }
    }

    pub fn wire_label(self) -> &'static str {
        match self {
            Currency::Native => "SOL",
            Currency::Stable => "USDC",
        }
    }

    pub fn decimals(self) -> u8 {
        match self {
            Currency::Native => 9,
            Currency::Stable => 6,
        }
    }

    /// Amount of this asset worth `price_usd` at the given native rate.
    /// The stable asset is assumed pegged 1:1 to USD.
    pub fn expected_amount(self, price_usd: Decimal, sol_usd_rate: Decimal) -> Decimal {
        match self {
            Currency::Native => price_usd / sol_usd_rate,
            Currency::Stable => price_usd,
        }
    }
}

/// One unlock attempt as submitted by the client.
#[derive(Clone, Debug)]
pub struct PaymentClaim {
    pub payer_wallet: String,
    pub manga_id: String,
    pub chapter_id: String,
    pub signature: String,
    pub claimed_amount: Decimal,
    pub currency: Currency,
}

/// Successful outcomes. A repeat unlock is success, not an error: the
/// chapter is in fact unlocked either way.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unlock {
    Unlocked,
    AlreadyUnlocked,
}

/// Accepted settlement range around the server-side quote. Bounds are
/// inclusive; the band absorbs oracle drift between the client's quote and
/// the server's re-quote.
#[derive(Clone, Copy, Debug)]
pub struct ToleranceBand {
    pub expected: Decimal,
    pub min: Decimal,
    pub max: Decimal,
}

impl ToleranceBand {
    pub fn around(expected: Decimal) -> Self {
        Self { expected, min: expected * TOLERANCE_MIN, max: expected * TOLERANCE_MAX }
    }

    pub fn contains(&self, amount: Decimal) -> bool {
        self.min <= amount && amount <= self.max
    }

    /// Headroom above the expected amount; also the limit for how far two
    /// independent settlement signals may disagree.
    pub fn slack(&self) -> Decimal {
        self.max - self.expected
    }

    fn check(&self, actual: Decimal) -> Result<(), UnlockError> {
        if self.contains(actual) {
            Ok(())
        } else {
            Err(UnlockError::AmountMismatch { actual, min: self.min, max: self.max })
        }
    }
}

pub struct Verifier {
    merchant_wallet: String,
    usdc_mint: String,
    chain: Arc<dyn ChainClient>,
    oracle: PriceOracle,
    store: UnlockStore,
}

impl Verifier {
    pub fn new(
        config: &MerchantConfig,
        chain: Arc<dyn ChainClient>,
        oracle: PriceOracle,
        store: UnlockStore,
    ) -> Self {
        Self {
            merchant_wallet: config.merchant_wallet.to_string(),
            usdc_mint: config.usdc_mint.to_string(),
            chain,
            oracle,
            store,
        }
    }

    pub async fn verify_and_unlock(&self, claim: &PaymentClaim) -> Result<Unlock, UnlockError> {
        Pubkey::from_str(&claim.payer_wallet).map_err(|_| UnlockError::InvalidAddress("payer"))?;

        let chapter = self
            .store
            .chapter(&claim.chapter_id)
            .map_err(storage_err)?
            .ok_or(UnlockError::ItemNotFound)?;
        if chapter.manga_id != claim.manga_id {
            return Err(UnlockError::ItemNotFound);
        }
        if !chapter.is_premium {
            return Err(UnlockError::ItemNotPremium);
        }

        let price_usd = chapter.effective_price();
        // Time-of-check pricing: the rate is fetched fresh here, not taken
        // from the client's quote.
        let rate = match claim.currency {
            Currency::Native => self.oracle.sol_usd_rate().await,
            Currency::Stable => Decimal::ONE,
        };
        let expected = claim.currency.expected_amount(price_usd, rate);
        let band = ToleranceBand::around(expected);
        if !band.contains(claim.claimed_amount) {
            log::debug!(
                "claimed amount {} drifted from server quote {} for chapter {}",
                claim.claimed_amount,
                expected,
                claim.chapter_id
            );
        }

        let tx = self.chain.fetch_transaction(&claim.signature).await?;
        let actual = check_settlement(
            &tx,
            &claim.payer_wallet,
            &self.merchant_wallet,
            &self.usdc_mint,
            claim.currency,
            &band,
        )?;
        log::info!(
            "verified {actual} {} from {} to treasury for chapter {} (tx {})",
            claim.currency.wire_label(),
            claim.payer_wallet,
            claim.chapter_id,
            claim.signature
        );

        // Optimization only; the ledger's compare-and-swap below is what
        // actually guarantees at-most-once crediting under races.
        if self.store.exists(&claim.payer_wallet, &claim.chapter_id).map_err(storage_err)? {
            return Ok(Unlock::AlreadyUnlocked);
        }

        let record = UnlockRecord {
            payer_wallet: claim.payer_wallet.clone(),
            manga_id: claim.manga_id.clone(),
            chapter_id: claim.chapter_id.clone(),
            signature: claim.signature.clone(),
            amount_usd: price_usd,
            currency: claim.currency,
            paid_at: crate::store::now_secs(),
        };
        match self.store.record(&record) {
            Ok(()) => Ok(Unlock::Unlocked),
            Err(StoreError::Duplicate) => Ok(Unlock::AlreadyUnlocked),
            Err(err) => Err(storage_err(err)),
        }
    }
}

fn storage_err(err: StoreError) -> UnlockError {
    UnlockError::Storage(err.to_string())
}

/// Check that `tx` really settles the expected transfer, returning the
/// amount the treasury received. Pure over the fetched transaction.
pub fn check_settlement(
    tx: &ChainTransaction,
    payer: &str,
    merchant: &str,
    stable_mint: &str,
    currency: Currency,
    band: &ToleranceBand,
) -> Result<Decimal, UnlockError> {
    match currency {
        Currency::Native => check_native(tx, payer, merchant, band),
        Currency::Stable => check_stable(tx, payer, merchant, stable_mint, band),
    }
}

fn check_native(
    tx: &ChainTransaction,
    payer: &str,
    merchant: &str,
    band: &ToleranceBand,
) -> Result<Decimal, UnlockError> {
    let payer_idx = tx
        .account_keys
        .iter()
        .position(|k| k == payer)
        .ok_or(UnlockError::PartyMissing(Party::Payer))?;
    let merchant_idx = tx
        .account_keys
        .iter()
        .position(|k| k == merchant)
        .ok_or(UnlockError::PartyMissing(Party::Merchant))?;
    let n = tx.account_keys.len();
    if tx.pre_balances.len() < n || tx.post_balances.len() < n {
        return Err(UnlockError::BalanceDataMissing);
    }

    // The account credited the most (payer excluded) must be the treasury,
    // byte for byte. Rejects unrelated-but-valid signatures and account-list
    // reordering tricks.
    let mut credited: Option<(usize, i128)> = None;
    for idx in 0..n {
        if idx == payer_idx {
            continue;
        }
        let delta = tx.post_balances[idx] as i128 - tx.pre_balances[idx] as i128;
        if delta > 0 && credited.map_or(true, |(_, best)| delta > best) {
            credited = Some((idx, delta));
        }
    }
    if let Some((idx, _)) = credited {
        if tx.account_keys[idx] != merchant {
            return Err(UnlockError::RecipientMismatch);
        }
    }

    let merchant_delta =
        tx.post_balances[merchant_idx] as i128 - tx.pre_balances[merchant_idx] as i128;
    let actual = lamports_to_sol(merchant_delta);
    band.check(actual)?;
    Ok(actual)
}

fn check_stable(
    tx: &ChainTransaction,
    payer: &str,
    merchant: &str,
    mint: &str,
    band: &ToleranceBand,
) -> Result<Decimal, UnlockError> {
    if !tx.account_keys.iter().any(|k| k == payer) {
        return Err(UnlockError::PartyMissing(Party::Payer));
    }

    let pre: Vec<&TokenBalance> = tx.pre_token_balances.iter().filter(|b| b.mint == mint).collect();
    let post: Vec<&TokenBalance> = tx.post_token_balances.iter().filter(|b| b.mint == mint).collect();
    if pre.is_empty() && post.is_empty() {
        return Err(UnlockError::BalanceDataMissing);
    }

    let merchant_pre = owner_amount(&pre, merchant);
    let merchant_post = owner_amount(&post, merchant);
    if merchant_pre.is_none() && merchant_post.is_none() {
        return Err(UnlockError::PartyMissing(Party::Merchant));
    }
    let merchant_delta = merchant_post.unwrap_or_default() - merchant_pre.unwrap_or_default();

    // Largest credited owner must be the treasury, same as the native path.
    let mut credited: Option<(&str, Decimal)> = None;
    let mut seen: Vec<&str> = Vec::new();
    for balance in &post {
        let Some(owner) = balance.owner.as_deref() else { continue };
        if seen.contains(&owner) {
            continue;
        }
        seen.push(owner);
        let delta =
            owner_amount(&post, owner).unwrap_or_default() - owner_amount(&pre, owner).unwrap_or_default();
        if delta > Decimal::ZERO && credited.as_ref().map_or(true, |(_, best)| delta > *best) {
            credited = Some((owner, delta));
        }
    }
    if let Some((owner, _)) = credited {
        if owner != merchant {
            return Err(UnlockError::RecipientMismatch);
        }
    }

    let payer_pre = owner_amount(&pre, payer);
    let payer_post = owner_amount(&post, payer);
    if payer_pre.is_none() && payer_post.is_none() {
        return Err(UnlockError::BalanceDataMissing);
    }
    // A sender account emptied to zero still reports a post row, so a
    // missing pre row only happens for fresh accounts; treat it as zero.
    let payer_spent = payer_pre.unwrap_or_default() - payer_post.unwrap_or_default();

    // Payer-spent and merchant-received are independent signals. When both
    // are positive they must agree within the band slack; a larger gap means
    // the transfer also paid someone else.
    if payer_spent > Decimal::ZERO
        && merchant_delta > Decimal::ZERO
        && (payer_spent - merchant_delta).abs() > band.slack()
    {
        return Err(UnlockError::AmountMismatch {
            actual: merchant_delta,
            min: band.min,
            max: band.max,
        });
    }

    band.check(merchant_delta)?;
    Ok(merchant_delta)
}

fn owner_amount(rows: &[&TokenBalance], owner: &str) -> Option<Decimal> {
    rows.iter()
        .filter(|b| b.owner.as_deref() == Some(owner))
        .map(|b| b.amount)
        .reduce(|a, b| a + b)
}

fn lamports_to_sol(lamports: i128) -> Decimal {
    Decimal::from_i128_with_scale(lamports, 9)
}
