//! Fixtures shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::db;
use crate::gateway::{ChargeRequest, ChargeVerdict, PaymentGateway};
use crate::models::{NewCampaign, NewDonation, Principal};

/// Fixed clock for store-level tests.
pub const NOW: i64 = 1_700_000_000;

pub async fn memory_pool() -> SqlitePool {
    db::init_pool("sqlite::memory:", 1).await.unwrap()
}

pub fn new_campaign(goal: &str) -> NewCampaign {
    NewCampaign {
        title: "Clean water".into(),
        description: "Wells for the valley".into(),
        image_url: Some("https://example.org/well.jpg".into()),
        owner: Principal::new("owner-1", Some("Grace".into())),
        goal: goal.parse().unwrap(),
        deadline: NOW + 30 * 24 * 60 * 60,
    }
}

pub fn new_donation(campaign_id: i64, amount: &str, key: &str) -> NewDonation {
    NewDonation {
        campaign_id,
        donor: Principal::new("donor-1", Some("Ada".into())),
        amount: amount.parse().unwrap(),
        message: None,
        idempotency_key: key.to_string(),
    }
}

/// Gateway that plays back a fixed list of verdicts, then captures.
pub struct ScriptedGateway {
    script: Mutex<VecDeque<ChargeVerdict>>,
    keys: Mutex<Vec<String>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl ScriptedGateway {
    pub fn new(script: Vec<ChargeVerdict>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            keys: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Idempotency keys seen, in call order.
    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn charge(&self, request: &ChargeRequest) -> ChargeVerdict {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.keys
            .lock()
            .unwrap()
            .push(request.idempotency_key.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| ChargeVerdict::Captured {
            reference: format!("ch_{}", request.idempotency_key),
        })
    }
}
