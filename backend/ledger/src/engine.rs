//! Donation engine: gates every donation on a payment verdict and applies
//! confirmed donations to campaign totals exactly once.
//!
//! ## Resilience
//!
//! * A request whose idempotency key already settled is answered from the
//!   ledger without contacting the gateway again.
//! * Transient gateway failures are retried with exponential back-off. The
//!   attempt count lives on the donation row, so the budget holds across
//!   client retries and concurrent requests for the same key.
//! * A request that finds the budget spent while another request is still
//!   charging waits for that charge to settle. Only a donation whose last
//!   attempt outlived its lease is failed on someone else's behalf.
//! * Totals are never computed here: the store applies the increment in the
//!   same transaction that confirms the donation.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::{self, CampaignCache};
use crate::config::RetryPolicy;
use crate::db::{self, RecordedAttempt};
use crate::errors::{LedgerError, Result};
use crate::gateway::{ChargeRequest, ChargeVerdict, FailureClass, PaymentGateway};
use crate::models::{
    Amount, Campaign, Donation, DonationStatus, FailureKind, NewCampaign, NewDonation, Principal,
};

/// A donor's request to give `amount` to a campaign.
#[derive(Debug, Clone)]
pub struct DonationRequest {
    pub campaign_id: i64,
    pub donor: Principal,
    pub amount: Amount,
    pub idempotency_key: String,
    pub payment_method: String,
    pub message: Option<String>,
}

/// Successful outcome of [`DonationEngine::donate`].
#[derive(Debug, Clone, Serialize)]
pub struct DonationReceipt {
    pub donation: Donation,
    /// Campaign total after this donation was applied.
    pub raised: Amount,
    /// `true` when the outcome was replayed from an earlier request.
    pub replayed: bool,
}

pub struct DonationEngine {
    pool: SqlitePool,
    gateway: Arc<dyn PaymentGateway>,
    cache: Arc<CampaignCache>,
    retry: RetryPolicy,
}

impl DonationEngine {
    pub fn new(
        pool: SqlitePool,
        gateway: Arc<dyn PaymentGateway>,
        cache: Arc<CampaignCache>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            pool,
            gateway,
            cache,
            retry,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ─────────────────────────────────────────────────────
    // Campaign operations
    // ─────────────────────────────────────────────────────

    pub async fn create_campaign(&self, new: NewCampaign) -> Result<Campaign> {
        db::create_campaign(&self.pool, &new, now()).await
    }

    /// Read a campaign through the cache.
    pub async fn campaign(&self, campaign_id: i64) -> Result<Campaign> {
        cache::read_through(&self.cache, &self.pool, campaign_id).await
    }

    pub async fn campaigns(&self) -> Result<Vec<Campaign>> {
        db::list_campaigns(&self.pool).await
    }

    pub async fn donations(&self, campaign_id: i64) -> Result<Vec<Donation>> {
        db::list_donations(&self.pool, campaign_id).await
    }

    pub async fn donation(&self, donation_id: i64) -> Result<Donation> {
        db::get_donation(&self.pool, donation_id).await
    }

    /// Compare every campaign's stored total with the sum of its confirmed
    /// donations. Returns the ids of campaigns that disagree.
    pub async fn audit_totals(&self) -> Result<Vec<i64>> {
        let mut drifted = Vec::new();
        for campaign in db::list_campaigns(&self.pool).await? {
            let confirmed = db::confirmed_sum(&self.pool, campaign.id).await?;
            if confirmed != campaign.raised {
                error!(
                    campaign_id = campaign.id,
                    raised = %campaign.raised,
                    %confirmed,
                    "Campaign total disagrees with its confirmed donations"
                );
                drifted.push(campaign.id);
            }
        }
        Ok(drifted)
    }

    // ─────────────────────────────────────────────────────
    // Donations
    // ─────────────────────────────────────────────────────

    /// Charge the donor and, once the payment is captured, add the donation
    /// to the campaign total.
    ///
    /// Safe to call again with the same idempotency key: a settled donation
    /// replays its outcome and a pending one resumes with whatever attempt
    /// budget remains.
    pub async fn donate(&self, request: DonationRequest) -> Result<DonationReceipt> {
        if !request.amount.is_positive() {
            return Err(LedgerError::Validation(format!(
                "donation amount must be positive, got {}",
                request.amount
            )));
        }

        let new = NewDonation {
            campaign_id: request.campaign_id,
            donor: request.donor.clone(),
            amount: request.amount,
            message: request
                .message
                .as_deref()
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(String::from),
            idempotency_key: request.idempotency_key.clone(),
        };

        let donation = match db::record_donation_attempt(&self.pool, &new, now()).await? {
            RecordedAttempt::Created(donation) => {
                info!(
                    donation_id = donation.id,
                    campaign_id = donation.campaign_id,
                    amount = %donation.amount,
                    "Donation attempt recorded"
                );
                donation
            }
            RecordedAttempt::Duplicate(existing) => {
                ensure_same_intent(&existing, &request)?;
                if existing.status.is_terminal() {
                    return self.replay(existing).await;
                }
                info!(
                    donation_id = existing.id,
                    attempts = existing.attempts,
                    "Resuming pending donation"
                );
                existing
            }
        };

        self.settle(donation, &request.payment_method).await
    }

    /// Drive a pending donation to a terminal state.
    async fn settle(&self, donation: Donation, payment_method: &str) -> Result<DonationReceipt> {
        let charge = ChargeRequest {
            donation_id: donation.id,
            amount: donation.amount,
            payment_method: payment_method.to_string(),
            idempotency_key: donation.idempotency_key.clone(),
        };

        loop {
            let Some(attempt) =
                db::claim_payment_attempt(&self.pool, donation.id, self.retry.max_attempts, now())
                    .await?
            else {
                return self.settle_without_budget(donation.id).await;
            };

            debug!(
                donation_id = donation.id,
                attempt,
                gateway = self.gateway.name(),
                "Charging payment method"
            );

            match self.gateway.charge(&charge).await {
                ChargeVerdict::Captured { reference } => {
                    return self.confirm(donation, attempt, &reference).await;
                }
                ChargeVerdict::Declined { reason } => {
                    info!(donation_id = donation.id, %reason, "Payment declined");
                    self.fail(donation.id, FailureKind::Declined, &reason).await?;
                    return Err(LedgerError::PaymentDeclined {
                        donation_id: donation.id,
                        reason,
                    });
                }
                ChargeVerdict::Failed {
                    class: FailureClass::Permanent,
                    message,
                } => {
                    warn!(donation_id = donation.id, %message, "Gateway rejected charge");
                    self.fail(donation.id, FailureKind::GatewayRejected, &message)
                        .await?;
                    return Err(LedgerError::GatewayRejected {
                        donation_id: donation.id,
                        reason: message,
                    });
                }
                ChargeVerdict::Failed {
                    class: FailureClass::Transient,
                    message,
                } => {
                    if attempt >= self.retry.max_attempts {
                        warn!(
                            donation_id = donation.id,
                            attempt,
                            %message,
                            "Payment attempts exhausted"
                        );
                        self.fail(donation.id, FailureKind::GatewayUnavailable, &message)
                            .await?;
                        return Err(LedgerError::GatewayUnavailable {
                            donation_id: donation.id,
                        });
                    }

                    let delay = self.retry.backoff_after(attempt);
                    warn!(
                        donation_id = donation.id,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        %message,
                        "Transient gateway failure (will retry in {}ms)",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// No attempt could be claimed. Another request either settled the
    /// donation, is still charging it, or abandoned it with the budget spent.
    async fn settle_without_budget(&self, donation_id: i64) -> Result<DonationReceipt> {
        let lease = self.retry.attempt_lease;
        let lease_secs = i64::try_from(lease.as_secs().max(1)).unwrap_or(i64::MAX);
        let patience = lease.saturating_add(Duration::from_secs(1));
        let started = Instant::now();
        let mut delay = self.retry.initial_backoff.max(Duration::from_millis(1));

        loop {
            let current = db::get_donation(&self.pool, donation_id).await?;
            if current.status.is_terminal() {
                return self.replay(current).await;
            }

            let stale_before = now().saturating_sub(lease_secs);
            if db::fail_abandoned_donation(
                &self.pool,
                donation_id,
                stale_before,
                "payment attempts exhausted",
            )
            .await?
            {
                warn!(donation_id, "Abandoned donation failed with its attempts spent");
                return Err(LedgerError::GatewayUnavailable { donation_id });
            }

            if started.elapsed() >= patience {
                return Err(LedgerError::PaymentInProgress { donation_id });
            }
            debug!(donation_id, "Waiting for an in-flight charge to settle");
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2).min(self.retry.max_backoff);
        }
    }

    async fn confirm(
        &self,
        mut donation: Donation,
        attempt: u32,
        reference: &str,
    ) -> Result<DonationReceipt> {
        let confirmed_at = now();
        let raised = db::confirm_donation(&self.pool, donation.id, reference, confirmed_at)
            .await
            .map_err(log_state_defect)?;
        self.cache.invalidate(donation.campaign_id);

        info!(
            donation_id = donation.id,
            campaign_id = donation.campaign_id,
            amount = %donation.amount,
            raised = %raised,
            reference,
            "Donation confirmed"
        );

        donation.status = DonationStatus::Confirmed;
        donation.confirmed_at = Some(confirmed_at);
        donation.payment_reference = Some(reference.to_string());
        donation.attempts = i64::from(attempt);
        Ok(DonationReceipt {
            donation,
            raised,
            replayed: false,
        })
    }

    async fn fail(&self, donation_id: i64, failure: FailureKind, reason: &str) -> Result<()> {
        db::fail_donation(&self.pool, donation_id, failure, reason)
            .await
            .map_err(log_state_defect)
    }

    /// Answer a settled donation from the ledger.
    async fn replay(&self, donation: Donation) -> Result<DonationReceipt> {
        debug!(
            donation_id = donation.id,
            status = donation.status.as_str(),
            "Replaying settled donation"
        );
        if let Some(err) = donation.failure_error() {
            return Err(err);
        }
        let campaign = db::get_campaign(&self.pool, donation.campaign_id).await?;
        Ok(DonationReceipt {
            donation,
            raised: campaign.raised,
            replayed: true,
        })
    }
}

/// Derive an idempotency key for clients that do not send one.
///
/// The key covers everything that identifies the donor's intent, so a
/// resubmitted form maps onto the same donation.
pub fn derive_idempotency_key(
    donor_id: &str,
    campaign_id: i64,
    amount: Amount,
    payment_method: &str,
    message: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(donor_id.as_bytes());
    hasher.update([0]);
    hasher.update(campaign_id.to_be_bytes());
    hasher.update(amount.cents().to_be_bytes());
    hasher.update(payment_method.as_bytes());
    hasher.update([0]);
    hasher.update(message.unwrap_or_default().as_bytes());
    hex::encode(hasher.finalize())
}

fn ensure_same_intent(existing: &Donation, request: &DonationRequest) -> Result<()> {
    if existing.campaign_id != request.campaign_id
        || existing.donor_id != request.donor.id
        || existing.amount != request.amount
    {
        return Err(LedgerError::Validation(format!(
            "idempotency key {:?} was already used for a different donation",
            request.idempotency_key
        )));
    }
    Ok(())
}

fn log_state_defect(err: LedgerError) -> LedgerError {
    if let LedgerError::InvalidStateTransition { donation_id, .. } = &err {
        error!(donation_id, error = %err, "Donation settled twice with different outcomes");
    }
    err
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
