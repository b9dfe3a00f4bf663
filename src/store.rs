use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DEFAULT_PRICE_USD;
use crate::verify::Currency;

/// A gated chapter as mirrored from the content system. Read-only here,
/// except for the `seed` operator command.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Chapter {
    pub id: String,
    pub manga_id: String,
    pub is_premium: bool,
    #[serde(default)]
    pub price_usd: Option<Decimal>,
}

impl Chapter {
    /// USD price used for quoting; unset and non-positive prices fall back
    /// to the platform default.
    pub fn effective_price(&self) -> Decimal {
        match self.price_usd {
            Some(p) if p > Decimal::ZERO => p,
            _ => DEFAULT_PRICE_USD,
        }
    }
}

/// Persisted "this payer has paid for this chapter" fact. Written exactly
/// once per (payer, chapter); never mutated or deleted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnlockRecord {
    pub payer_wallet: String,
    pub manga_id: String,
    pub chapter_id: String,
    pub signature: String,
    pub amount_usd: Decimal,
    pub currency: Currency,
    pub paid_at: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unlock already recorded")]
    Duplicate,
    #[error(transparent)]
    Db(#[from] sled::Error),
    #[error("corrupt record: {0}")]
    Codec(#[from] serde_json::Error),
}

/// sled-backed unlock ledger plus the chapter catalog mirror. The ledger
/// key is `"{payer}/{chapter}"`; insertion goes through compare-and-swap,
/// which is the sole mutual-exclusion point for racing unlock attempts.
#[derive(Clone)]
pub struct UnlockStore {
    db: sled::Db,
    chapters: sled::Tree,
    unlocks: sled::Tree,
}

fn unlock_key(payer: &str, chapter_id: &str) -> Vec<u8> {
    format!("{payer}/{chapter_id}").into_bytes()
}

pub fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

impl UnlockStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let chapters = db.open_tree("chapters")?;
        let unlocks = db.open_tree("unlocks")?;
        Ok(Self { db, chapters, unlocks })
    }

    pub fn chapter(&self, id: &str) -> Result<Option<Chapter>, StoreError> {
        match self.chapters.get(id.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn put_chapter(&self, chapter: &Chapter) -> Result<(), StoreError> {
        self.chapters.insert(chapter.id.as_bytes(), serde_json::to_vec(chapter)?)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn exists(&self, payer: &str, chapter_id: &str) -> Result<bool, StoreError> {
        Ok(self.unlocks.contains_key(unlock_key(payer, chapter_id))?)
    }

    pub fn unlock(&self, payer: &str, chapter_id: &str) -> Result<Option<UnlockRecord>, StoreError> {
        match self.unlocks.get(unlock_key(payer, chapter_id))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Insert a new unlock fact. Returns [`StoreError::Duplicate`] when a
    /// concurrent request (or an earlier one) already holds the key.
    pub fn record(&self, record: &UnlockRecord) -> Result<(), StoreError> {
        let key = unlock_key(&record.payer_wallet, &record.chapter_id);
        let value = serde_json::to_vec(record)?;
        match self.unlocks.compare_and_swap(key, None::<&[u8]>, Some(value))? {
            Ok(()) => {
                // Unlock facts must survive a crash; fsync before acking.
                self.db.flush()?;
                Ok(())
            }
            Err(_) => Err(StoreError::Duplicate),
        }
    }
}
