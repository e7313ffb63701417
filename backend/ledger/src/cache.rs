//! Per-process read cache of campaigns.
//!
//! The cache is a derived view and is never authoritative: the ledger
//! mutates it only through [`CampaignCache::invalidate`], and only the read
//! path fills it, from a fresh store read.
//!
//! Each key carries a generation that `invalidate` bumps. A reader takes a
//! [`FillTicket`] *before* reading the store and the fill is dropped if the
//! generation moved in the meantime, so a total read just before a
//! confirmation committed can never be cached after that confirmation's
//! invalidation.

use dashmap::DashMap;
use sqlx::SqlitePool;
use tracing::debug;

use crate::db;
use crate::errors::Result;
use crate::models::Campaign;

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    campaign: Option<Campaign>,
}

/// Proof that a store read started at a given cache generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillTicket {
    campaign_id: i64,
    generation: u64,
}

#[derive(Debug, Default)]
pub struct CampaignCache {
    slots: DashMap<i64, Slot>,
}

impl CampaignCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, campaign_id: i64) -> Option<Campaign> {
        self.slots
            .get(&campaign_id)
            .and_then(|slot| slot.campaign.clone())
    }

    /// Store a campaign unconditionally.
    pub fn put(&self, campaign_id: i64, campaign: Campaign) {
        self.slots.entry(campaign_id).or_default().campaign = Some(campaign);
    }

    /// Drop the cached value and invalidate any fill still in flight.
    pub fn invalidate(&self, campaign_id: i64) {
        let mut slot = self.slots.entry(campaign_id).or_default();
        slot.generation += 1;
        slot.campaign = None;
    }

    /// Record the current generation before reading the store.
    pub fn begin_fill(&self, campaign_id: i64) -> FillTicket {
        let generation = self
            .slots
            .get(&campaign_id)
            .map(|slot| slot.generation)
            .unwrap_or(0);
        FillTicket {
            campaign_id,
            generation,
        }
    }

    /// Store `campaign` unless the key was invalidated after `ticket` was
    /// taken. Returns whether the value was kept.
    pub fn fill(&self, ticket: FillTicket, campaign: Campaign) -> bool {
        let mut slot = self.slots.entry(ticket.campaign_id).or_default();
        if slot.generation != ticket.generation {
            return false;
        }
        slot.campaign = Some(campaign);
        true
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.campaign.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Serve a campaign from the cache, falling through to the store on a miss.
pub async fn read_through(
    cache: &CampaignCache,
    pool: &SqlitePool,
    campaign_id: i64,
) -> Result<Campaign> {
    if let Some(campaign) = cache.get(campaign_id) {
        return Ok(campaign);
    }

    let ticket = cache.begin_fill(campaign_id);
    let campaign = db::get_campaign(pool, campaign_id).await?;
    if !cache.fill(ticket, campaign.clone()) {
        debug!(campaign_id, "Discarded cache fill raced by an invalidation");
    }
    Ok(campaign)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Amount;
    use crate::test_support::{memory_pool, new_campaign, NOW};

    fn campaign(id: i64, raised: i64) -> Campaign {
        Campaign {
            id,
            title: "Clean water".into(),
            description: "Wells".into(),
            image_url: None,
            owner_id: "owner".into(),
            owner_name: "Owner".into(),
            goal: Amount::from_cents(100_000),
            raised: Amount::from_cents(raised),
            deadline: NOW + 1,
            created_at: NOW,
        }
    }

    #[test]
    fn get_put_invalidate() {
        let cache = CampaignCache::new();
        assert!(cache.get(1).is_none());

        cache.put(1, campaign(1, 0));
        assert_eq!(cache.get(1), Some(campaign(1, 0)));
        assert_eq!(cache.len(), 1);

        cache.invalidate(1);
        assert!(cache.get(1).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn fill_after_invalidation_is_discarded() {
        let cache = CampaignCache::new();

        // Reader starts, then a confirmation invalidates before the fill lands.
        let ticket = cache.begin_fill(1);
        cache.invalidate(1);
        assert!(!cache.fill(ticket, campaign(1, 0)));
        assert!(cache.get(1).is_none());

        let ticket = cache.begin_fill(1);
        assert!(cache.fill(ticket, campaign(1, 500)));
        assert_eq!(cache.get(1).unwrap().raised, Amount::from_cents(500));
    }

    #[test]
    fn put_after_invalidate_repopulates() {
        let a = CampaignCache::new();
        a.put(1, campaign(1, 10));
        a.invalidate(1);

        let b = CampaignCache::new();
        b.invalidate(1);
        b.put(1, campaign(1, 10));

        assert!(a.get(1).is_none());
        assert_eq!(b.get(1), Some(campaign(1, 10)));
    }

    #[tokio::test]
    async fn read_through_populates_on_miss() {
        let pool = memory_pool().await;
        let created = db::create_campaign(&pool, &new_campaign("100"), NOW)
            .await
            .unwrap();
        let cache = CampaignCache::new();

        let loaded = read_through(&cache, &pool, created.id).await.unwrap();
        assert_eq!(loaded, created);
        assert_eq!(cache.get(created.id), Some(created));

        assert!(read_through(&cache, &pool, 999).await.is_err());
        assert!(cache.get(999).is_none());
    }
}
