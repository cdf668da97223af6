//! cache.rs - In-memory cache of the last accepted quote per key, with bounded history

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::wall;
use crate::models::{ConsensusQuote, PriceKey};

/// Current value for one key plus the trail of earlier accepted values
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: PriceKey,
    pub value: ConsensusQuote,
    pub expires_at: DateTime<Utc>,
    /// Oldest first; includes `value` as its last element
    pub history: VecDeque<ConsensusQuote>,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn history(&self) -> Vec<ConsensusQuote> {
        self.history.iter().cloned().collect()
    }
}

/// One key's current entry; `None` until the first write or after invalidation
type Slot = Arc<RwLock<Option<Arc<CacheEntry>>>>;

/// Shared price cache.
///
/// Every key has its own lock, so a write to one key never blocks readers
/// of another. The outer map lock is held only to look up or add a slot.
/// Entries are immutable snapshots behind an `Arc`; a write builds the new
/// entry and swaps it in, so readers see either the old or the new entry.
#[derive(Debug, Clone)]
pub struct PriceCache {
    slots: Arc<RwLock<HashMap<PriceKey, Slot>>>,
    history_capacity: usize,
}

impl PriceCache {
    pub fn new(history_capacity: usize) -> Self {
        PriceCache {
            slots: Arc::new(RwLock::new(HashMap::new())),
            history_capacity: history_capacity.max(1),
        }
    }

    pub async fn get(&self, key: &PriceKey) -> Option<Arc<CacheEntry>> {
        let slot = self.slots.read().await.get(key).cloned()?;
        let current = slot.read().await;
        current.clone()
    }

    /// Store `quote` as the current value and append it to the history
    pub async fn put(&self, key: PriceKey, quote: ConsensusQuote, ttl: Duration) -> Arc<CacheEntry> {
        self.put_at(key, quote, ttl, Utc::now()).await
    }

    pub async fn put_at(
        &self,
        key: PriceKey,
        quote: ConsensusQuote,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Arc<CacheEntry> {
        let slot = self.slot_for(key).await;
        let mut current = slot.write().await;

        let mut history = current
            .as_ref()
            .map(|entry| entry.history.clone())
            .unwrap_or_default();
        history.push_back(quote.clone());
        self.bound(&mut history);

        let entry = Arc::new(CacheEntry {
            key,
            value: quote,
            expires_at: now + wall(ttl),
            history,
        });
        *current = Some(Arc::clone(&entry));
        entry
    }

    /// Seed history for a key without changing freshness (warm start)
    pub async fn seed_history(&self, key: PriceKey, quotes: Vec<ConsensusQuote>) {
        let Some(last) = quotes.last().cloned() else {
            return;
        };
        let slot = self.slot_for(key).await;
        let mut current = slot.write().await;

        let mut history: VecDeque<ConsensusQuote> = quotes.into();
        self.bound(&mut history);
        let expires_at = current
            .as_ref()
            .map(|entry| entry.expires_at)
            .unwrap_or(last.quote.observed_at);

        *current = Some(Arc::new(CacheEntry {
            key,
            value: last,
            expires_at,
            history,
        }));
    }

    pub async fn invalidate(&self, key: &PriceKey) {
        let slot = self.slots.read().await.get(key).cloned();
        if let Some(slot) = slot {
            *slot.write().await = None;
        }
    }

    pub async fn len(&self) -> usize {
        let slots: Vec<Slot> = self.slots.read().await.values().cloned().collect();
        let mut len = 0;
        for slot in slots {
            if slot.read().await.is_some() {
                len += 1;
            }
        }
        len
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn slot_for(&self, key: PriceKey) -> Slot {
        if let Some(slot) = self.slots.read().await.get(&key) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().await;
        Arc::clone(slots.entry(key).or_default())
    }

    fn bound(&self, history: &mut VecDeque<ConsensusQuote>) {
        while history.len() > self.history_capacity {
            history.pop_front();
        }
    }
}
