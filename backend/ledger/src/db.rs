//! Database layer: migrations, campaign and donation records, and the
//! atomic confirm-and-increment that keeps campaign totals honest.
//!
//! Every mutation of a donation's status is a conditional `UPDATE ... WHERE
//! status = 'pending'`, so concurrent or repeated calls can never move a
//! donation twice. A campaign's `raised_cents` is only ever changed by the
//! single-statement increment inside [`confirm_donation`].

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, error, info};

use crate::errors::{LedgerError, Result};
use crate::models::{
    Amount, Campaign, Donation, DonationStatus, FailureKind, NewCampaign, NewDonation,
};

macro_rules! campaign_columns {
    () => {
        "id, title, description, image_url, owner_id, owner_name, goal_cents, raised_cents, \
         deadline, created_at"
    };
}

macro_rules! donation_columns {
    () => {
        "id, campaign_id, donor_id, donor_name, amount_cents, message, idempotency_key, status, \
         failure, failure_reason, payment_reference, attempts, created_at, confirmed_at"
    };
}

/// Establish a SQLite connection pool and run pending migrations.
///
/// In-memory databases live only as long as their connection, so they are
/// pinned to a single connection that is never recycled.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };
    let in_memory = url.contains(":memory:") || url.contains("mode=memory");

    // Make sure the file is created if it doesn't exist yet.
    let mut options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(max_connections)
    };
    let pool = pool_options.connect_with(options).await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Campaigns
// ─────────────────────────────────────────────────────────

/// Insert a new campaign with nothing raised yet.
pub async fn create_campaign(pool: &SqlitePool, new: &NewCampaign, now: i64) -> Result<Campaign> {
    if new.title.trim().is_empty() {
        return Err(LedgerError::Validation("title is required".to_string()));
    }
    if new.description.trim().is_empty() {
        return Err(LedgerError::Validation("description is required".to_string()));
    }
    if !new.goal.is_positive() {
        return Err(LedgerError::Validation(format!(
            "goal must be positive, got {}",
            new.goal
        )));
    }
    if new.deadline <= now {
        return Err(LedgerError::Validation(
            "deadline must be in the future".to_string(),
        ));
    }

    let campaign = sqlx::query_as::<_, Campaign>(concat!(
        "INSERT INTO campaigns \
             (title, description, image_url, owner_id, owner_name, goal_cents, raised_cents, \
              deadline, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8) \
         RETURNING ",
        campaign_columns!()
    ))
    .bind(new.title.trim())
    .bind(new.description.trim())
    .bind(new.image_url.as_deref())
    .bind(&new.owner.id)
    .bind(&new.owner.display_name)
    .bind(new.goal)
    .bind(new.deadline)
    .bind(now)
    .fetch_one(pool)
    .await?;

    info!(
        campaign_id = campaign.id,
        owner = %campaign.owner_id,
        goal = %campaign.goal,
        "Campaign created"
    );
    Ok(campaign)
}

pub async fn get_campaign(pool: &SqlitePool, campaign_id: i64) -> Result<Campaign> {
    sqlx::query_as::<_, Campaign>(concat!(
        "SELECT ",
        campaign_columns!(),
        " FROM campaigns WHERE id = ?1"
    ))
    .bind(campaign_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| LedgerError::NotFound(format!("campaign {campaign_id}")))
}

/// All campaigns, newest first.
pub async fn list_campaigns(pool: &SqlitePool) -> Result<Vec<Campaign>> {
    let rows = sqlx::query_as::<_, Campaign>(concat!(
        "SELECT ",
        campaign_columns!(),
        " FROM campaigns ORDER BY created_at DESC, id DESC"
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Donation writes
// ─────────────────────────────────────────────────────────

/// Outcome of [`record_donation_attempt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedAttempt {
    /// A fresh `pending` donation was inserted.
    Created(Donation),
    /// The idempotency key was already used; nothing was inserted.
    Duplicate(Donation),
}

/// Insert a `pending` donation, or return the donation that already owns
/// the idempotency key.
///
/// The deadline is only enforced when a new row would be created, so a
/// retried request can still learn its outcome after the campaign ends.
pub async fn record_donation_attempt(
    pool: &SqlitePool,
    new: &NewDonation,
    now: i64,
) -> Result<RecordedAttempt> {
    if !new.amount.is_positive() {
        return Err(LedgerError::Validation(format!(
            "donation amount must be positive, got {}",
            new.amount
        )));
    }
    if new.idempotency_key.trim().is_empty() {
        return Err(LedgerError::Validation(
            "idempotency key must not be empty".to_string(),
        ));
    }

    let campaign = get_campaign(pool, new.campaign_id).await?;

    if let Some(existing) = find_donation_by_key(pool, &new.idempotency_key).await? {
        debug!(
            donation_id = existing.id,
            key = %new.idempotency_key,
            "Idempotency key already recorded"
        );
        return Ok(RecordedAttempt::Duplicate(existing));
    }

    if campaign.has_ended(now) {
        return Err(LedgerError::Validation(format!(
            "campaign {} has ended",
            campaign.id
        )));
    }

    // Every pending donation may still be confirmed, so the total must have
    // room for all of them plus this one.
    let (outstanding,): (i64,) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(amount_cents), 0)
        FROM   donations
        WHERE  campaign_id = ?1 AND status = 'pending'
        "#,
    )
    .bind(campaign.id)
    .fetch_one(pool)
    .await?;
    let fits = campaign
        .raised
        .checked_add(Amount::from_cents(outstanding))
        .and_then(|total| total.checked_add(new.amount))
        .is_some();
    if !fits {
        return Err(LedgerError::Validation(format!(
            "campaign {} cannot accept {} more",
            campaign.id, new.amount
        )));
    }

    let inserted = sqlx::query_as::<_, Donation>(concat!(
        "INSERT INTO donations \
             (campaign_id, donor_id, donor_name, amount_cents, message, idempotency_key, \
              status, attempts, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7) \
         ON CONFLICT (idempotency_key) DO NOTHING \
         RETURNING ",
        donation_columns!()
    ))
    .bind(new.campaign_id)
    .bind(&new.donor.id)
    .bind(&new.donor.display_name)
    .bind(new.amount)
    .bind(new.message.as_deref())
    .bind(&new.idempotency_key)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    match inserted {
        Some(donation) => Ok(RecordedAttempt::Created(donation)),
        // Lost an insert race against a request carrying the same key.
        None => find_donation_by_key(pool, &new.idempotency_key)
            .await?
            .map(RecordedAttempt::Duplicate)
            .ok_or_else(|| {
                LedgerError::NotFound(format!("donation with key {}", new.idempotency_key))
            }),
    }
}

/// Reserve one gateway attempt for a still-pending donation and stamp it
/// with `now`.
///
/// Returns the attempt number, or `None` when the donation is no longer
/// pending or has used up `max_attempts`.
pub async fn claim_payment_attempt(
    pool: &SqlitePool,
    donation_id: i64,
    max_attempts: u32,
    now: i64,
) -> Result<Option<u32>> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        UPDATE donations
        SET    attempts = attempts + 1, last_attempt_at = ?3
        WHERE  id = ?1 AND status = 'pending' AND attempts < ?2
        RETURNING attempts
        "#,
    )
    .bind(donation_id)
    .bind(i64::from(max_attempts))
    .bind(now)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(n,)| n as u32))
}

/// Fail a pending donation whose last attempt started at or before
/// `stale_before`, i.e. one no caller is still charging.
///
/// Returns `false` when the donation is settled or an attempt is still
/// within its lease.
pub async fn fail_abandoned_donation(
    pool: &SqlitePool,
    donation_id: i64,
    stale_before: i64,
    reason: &str,
) -> Result<bool> {
    let transitioned = sqlx::query(
        r#"
        UPDATE donations
        SET    status = 'failed', failure = ?2, failure_reason = ?3
        WHERE  id = ?1
          AND  status = 'pending'
          AND  (last_attempt_at IS NULL OR last_attempt_at <= ?4)
        "#,
    )
    .bind(donation_id)
    .bind(FailureKind::GatewayUnavailable)
    .bind(reason)
    .bind(stale_before)
    .execute(pool)
    .await?
    .rows_affected();

    if transitioned == 1 {
        debug!(donation_id, reason, "Abandoned donation failed");
    }
    Ok(transitioned == 1)
}

/// Move a donation from `pending` to `confirmed` and add its amount to the
/// campaign total in one transaction. Returns the campaign's new total.
///
/// Confirming an already-confirmed donation changes nothing and returns the
/// current total. Confirming a failed donation is an
/// [`LedgerError::InvalidStateTransition`].
pub async fn confirm_donation(
    pool: &SqlitePool,
    donation_id: i64,
    payment_reference: &str,
    now: i64,
) -> Result<Amount> {
    let mut tx = pool.begin().await?;

    let transitioned = sqlx::query(
        r#"
        UPDATE donations
        SET    status = 'confirmed', confirmed_at = ?2, payment_reference = ?3
        WHERE  id = ?1 AND status = 'pending'
        "#,
    )
    .bind(donation_id)
    .bind(now)
    .bind(payment_reference)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if transitioned == 1 {
        let incremented: Option<(Amount,)> = sqlx::query_as(
            r#"
            UPDATE campaigns
            SET    raised_cents = raised_cents
                                  + (SELECT amount_cents FROM donations WHERE id = ?1)
            WHERE  id = (SELECT campaign_id FROM donations WHERE id = ?1)
              AND  raised_cents <= ?2 - (SELECT amount_cents FROM donations WHERE id = ?1)
            RETURNING raised_cents
            "#,
        )
        .bind(donation_id)
        .bind(i64::MAX)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((total,)) = incremented else {
            tx.rollback().await?;
            error!(donation_id, "Confirming donation would overflow the campaign total");
            return Err(LedgerError::Validation(format!(
                "donation {donation_id} would overflow its campaign total"
            )));
        };
        tx.commit().await?;

        debug!(donation_id, raised = %total, "Donation confirmed");
        return Ok(total);
    }

    let current: Option<(DonationStatus, Amount)> = sqlx::query_as(
        r#"
        SELECT d.status, c.raised_cents
        FROM   donations d
        JOIN   campaigns c ON c.id = d.campaign_id
        WHERE  d.id = ?1
        "#,
    )
    .bind(donation_id)
    .fetch_optional(&mut *tx)
    .await?;
    tx.rollback().await?;

    match current {
        None => Err(LedgerError::NotFound(format!("donation {donation_id}"))),
        Some((DonationStatus::Confirmed, total)) => Ok(total),
        Some((status, _)) => Err(LedgerError::InvalidStateTransition {
            donation_id,
            from: status.as_str(),
            to: DonationStatus::Confirmed.as_str(),
        }),
    }
}

/// Move a donation from `pending` to `failed`.
///
/// Failing an already-failed donation is a no-op; failing a confirmed one is
/// an [`LedgerError::InvalidStateTransition`].
pub async fn fail_donation(
    pool: &SqlitePool,
    donation_id: i64,
    failure: FailureKind,
    reason: &str,
) -> Result<()> {
    let transitioned = sqlx::query(
        r#"
        UPDATE donations
        SET    status = 'failed', failure = ?2, failure_reason = ?3
        WHERE  id = ?1 AND status = 'pending'
        "#,
    )
    .bind(donation_id)
    .bind(failure)
    .bind(reason)
    .execute(pool)
    .await?
    .rows_affected();

    if transitioned == 1 {
        debug!(donation_id, failure = failure.as_str(), reason, "Donation failed");
        return Ok(());
    }

    let current: Option<(DonationStatus,)> =
        sqlx::query_as("SELECT status FROM donations WHERE id = ?1")
            .bind(donation_id)
            .fetch_optional(pool)
            .await?;

    match current {
        None => Err(LedgerError::NotFound(format!("donation {donation_id}"))),
        Some((DonationStatus::Failed,)) => Ok(()),
        Some((status,)) => Err(LedgerError::InvalidStateTransition {
            donation_id,
            from: status.as_str(),
            to: DonationStatus::Failed.as_str(),
        }),
    }
}

// ─────────────────────────────────────────────────────────
// Donation reads
// ─────────────────────────────────────────────────────────

pub async fn get_donation(pool: &SqlitePool, donation_id: i64) -> Result<Donation> {
    sqlx::query_as::<_, Donation>(concat!(
        "SELECT ",
        donation_columns!(),
        " FROM donations WHERE id = ?1"
    ))
    .bind(donation_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| LedgerError::NotFound(format!("donation {donation_id}")))
}

pub async fn find_donation_by_key(pool: &SqlitePool, key: &str) -> Result<Option<Donation>> {
    let row = sqlx::query_as::<_, Donation>(concat!(
        "SELECT ",
        donation_columns!(),
        " FROM donations WHERE idempotency_key = ?1"
    ))
    .bind(key)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Confirmed donations for a campaign, newest first.
pub async fn list_donations(pool: &SqlitePool, campaign_id: i64) -> Result<Vec<Donation>> {
    // Distinguish "no donations yet" from "no such campaign".
    get_campaign(pool, campaign_id).await?;

    let rows = sqlx::query_as::<_, Donation>(concat!(
        "SELECT ",
        donation_columns!(),
        " FROM donations \
         WHERE campaign_id = ?1 AND status = 'confirmed' \
         ORDER BY confirmed_at DESC, id DESC"
    ))
    .bind(campaign_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Sum of a campaign's confirmed donations, recomputed from the rows.
pub async fn confirmed_sum(pool: &SqlitePool, campaign_id: i64) -> Result<Amount> {
    let (sum,): (i64,) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(amount_cents), 0)
        FROM   donations
        WHERE  campaign_id = ?1 AND status = 'confirmed'
        "#,
    )
    .bind(campaign_id)
    .fetch_one(pool)
    .await?;
    Ok(Amount::from_cents(sum))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
