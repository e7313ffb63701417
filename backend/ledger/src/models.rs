//! Ledger record types: campaigns, donations and the money amounts they carry.

use std::fmt;
use std::str::FromStr;

use chrono::DateTime;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::LedgerError;

/// Display name used when a principal has none.
pub const ANONYMOUS: &str = "Anonymous";

// ─────────────────────────────────────────────────────────
// Amount
// ─────────────────────────────────────────────────────────

/// A non-negative monetary amount stored as integer cents.
///
/// Serialized as a decimal string (`"12.50"`) so that clients never see
/// binary floating point, while the store can increment totals with plain
/// integer arithmetic.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    sqlx::Type,
)]
#[serde(try_from = "Decimal", into = "Decimal")]
#[sqlx(transparent)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// Largest amount a single donation or goal may carry (one trillion).
    pub const MAX: Amount = Amount(100_000_000_000_000);

    /// Number of decimal places carried by an amount.
    const SCALE: u32 = 2;

    pub fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub fn cents(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Convert a decimal into cents, rejecting sub-cent precision,
    /// negative values and values above [`Amount::MAX`].
    pub fn from_decimal(value: Decimal) -> Result<Self, LedgerError> {
        let value = value.normalize();
        if value.scale() > Self::SCALE {
            return Err(LedgerError::Validation(format!(
                "amount {value} has more than {} decimal places",
                Self::SCALE
            )));
        }
        if value.is_sign_negative() && !value.is_zero() {
            return Err(LedgerError::Validation(format!(
                "amount {value} must not be negative"
            )));
        }
        let cents = value
            .checked_mul(Decimal::ONE_HUNDRED)
            .and_then(|c| c.to_i64())
            .filter(|c| *c <= Self::MAX.0)
            .ok_or_else(|| LedgerError::Validation(format!("amount {value} is out of range")))?;
        Ok(Self(cents))
    }

    pub fn to_decimal(self) -> Decimal {
        Decimal::new(self.0, Self::SCALE)
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Self)
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = LedgerError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::from_decimal(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.to_decimal()
    }
}

impl FromStr for Amount {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = Decimal::from_str(s.trim())
            .map_err(|e| LedgerError::Validation(format!("invalid amount {s:?}: {e}")))?;
        Self::from_decimal(value)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}

// ─────────────────────────────────────────────────────────
// Principals
// ─────────────────────────────────────────────────────────

/// An authenticated caller, as handed to us by the identity layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub display_name: String,
}

impl Principal {
    pub fn new(id: impl Into<String>, display_name: Option<String>) -> Self {
        let display_name = display_name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| ANONYMOUS.to_string());
        Self {
            id: id.into(),
            display_name,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Campaigns
// ─────────────────────────────────────────────────────────

/// A funding campaign as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Campaign {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub image_url: Option<String>,
    pub owner_id: String,
    pub owner_name: String,
    #[sqlx(rename = "goal_cents")]
    pub goal: Amount,
    #[sqlx(rename = "raised_cents")]
    pub raised: Amount,
    /// Unix seconds.
    pub deadline: i64,
    pub created_at: i64,
}

impl Campaign {
    /// Share of the goal raised so far, as a percentage with two decimals.
    pub fn percent_funded(&self) -> Decimal {
        if !self.goal.is_positive() {
            return Decimal::ZERO;
        }
        (self.raised.to_decimal() * Decimal::ONE_HUNDRED / self.goal.to_decimal())
            .round_dp(2)
            .normalize()
    }

    pub fn has_ended(&self, now: i64) -> bool {
        self.deadline <= now
    }
}

/// Fields supplied by a creator for a new campaign.
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub title: String,
    pub description: String,
    pub image_url: Option<String>,
    pub owner: Principal,
    pub goal: Amount,
    pub deadline: i64,
}

// ─────────────────────────────────────────────────────────
// Donations
// ─────────────────────────────────────────────────────────

/// Lifecycle of a donation.
///
/// ```text
/// pending ──capture──► confirmed
///    └──decline | rejected | retries exhausted──► failed
/// ```
///
/// `confirmed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DonationStatus {
    Pending,
    Confirmed,
    Failed,
}

impl DonationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Why a donation ended up `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum FailureKind {
    /// The processor declined the payment method.
    Declined,
    /// Transient gateway errors outlasted the attempt budget.
    GatewayUnavailable,
    /// The gateway refused the request outright.
    GatewayRejected,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Declined => "declined",
            Self::GatewayUnavailable => "gateway_unavailable",
            Self::GatewayRejected => "gateway_rejected",
        }
    }
}

/// A donation row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Donation {
    pub id: i64,
    pub campaign_id: i64,
    pub donor_id: String,
    pub donor_name: String,
    #[sqlx(rename = "amount_cents")]
    pub amount: Amount,
    pub message: Option<String>,
    pub idempotency_key: String,
    pub status: DonationStatus,
    pub failure: Option<FailureKind>,
    pub failure_reason: Option<String>,
    pub payment_reference: Option<String>,
    pub attempts: i64,
    pub created_at: i64,
    pub confirmed_at: Option<i64>,
}

impl Donation {
    /// The error a failed donation replays to its caller.
    ///
    /// Returns `None` unless the donation is `failed`.
    pub fn failure_error(&self) -> Option<LedgerError> {
        if self.status != DonationStatus::Failed {
            return None;
        }
        let reason = self
            .failure_reason
            .clone()
            .unwrap_or_else(|| "unspecified".to_string());
        Some(match self.failure.unwrap_or(FailureKind::Declined) {
            FailureKind::Declined => LedgerError::PaymentDeclined {
                donation_id: self.id,
                reason,
            },
            FailureKind::GatewayUnavailable => LedgerError::GatewayUnavailable {
                donation_id: self.id,
            },
            FailureKind::GatewayRejected => LedgerError::GatewayRejected {
                donation_id: self.id,
                reason,
            },
        })
    }
}

/// A donation attempt about to be recorded as `pending`.
#[derive(Debug, Clone)]
pub struct NewDonation {
    pub campaign_id: i64,
    pub donor: Principal,
    pub amount: Amount,
    pub message: Option<String>,
    pub idempotency_key: String,
}

/// Parse an RFC 3339 timestamp into unix seconds.
pub fn parse_timestamp(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp())
}
