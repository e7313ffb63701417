//! Payment gateway adapter: the one place we talk to the card processor.
//!
//! ## Contract
//!
//! * [`PaymentGateway::charge`] makes exactly one authorize-and-capture
//!   request and classifies the result into a [`ChargeVerdict`]. It never
//!   retries; retry policy belongs to the donation engine.
//! * Every request carries the donation's idempotency key so that a
//!   processor seeing the same key twice captures at most once.
//! * [`TimeoutGateway`] bounds any gateway and reports an elapsed timeout as
//!   a transient failure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::models::Amount;

// ─────────────────────────────────────────────────────────
// Verdicts
// ─────────────────────────────────────────────────────────

/// A single charge against a payment method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    pub donation_id: i64,
    pub amount: Amount,
    pub payment_method: String,
    pub idempotency_key: String,
}

/// Whether a gateway failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeVerdict {
    /// Funds captured; `reference` identifies the capture at the processor.
    Captured { reference: String },
    /// The processor refused the payment method.
    Declined { reason: String },
    /// The request itself failed.
    Failed { class: FailureClass, message: String },
}

impl ChargeVerdict {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Failed {
            class: FailureClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Failed {
            class: FailureClass::Permanent,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Authorize and capture `request.amount`.
    async fn charge(&self, request: &ChargeRequest) -> ChargeVerdict;
}

// ─────────────────────────────────────────────────────────
// Timeout wrapper
// ─────────────────────────────────────────────────────────

/// Enforces an upper bound on every charge of the wrapped gateway.
pub struct TimeoutGateway<G> {
    inner: G,
    timeout: Duration,
}

impl<G: PaymentGateway> TimeoutGateway<G> {
    pub fn new(inner: G, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl<G: PaymentGateway> PaymentGateway for TimeoutGateway<G> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn charge(&self, request: &ChargeRequest) -> ChargeVerdict {
        match tokio::time::timeout(self.timeout, self.inner.charge(request)).await {
            Ok(verdict) => verdict,
            Err(_) => {
                warn!(
                    gateway = self.inner.name(),
                    donation_id = request.donation_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Charge timed out"
                );
                ChargeVerdict::transient(format!(
                    "charge timed out after {}ms",
                    self.timeout.as_millis()
                ))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// HTTP processor
// ─────────────────────────────────────────────────────────

/// JSON body returned by the processor's charge endpoint.
#[derive(Debug, Deserialize, Serialize)]
pub struct ChargeResponse {
    pub status: String,
    pub reference: Option<String>,
    pub reason: Option<String>,
}

/// Talks to a processor that exposes `POST <url>` taking a JSON charge and
/// honouring the `Idempotency-Key` header.
pub struct HttpGateway {
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl HttpGateway {
    pub fn new(client: Client, url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            url: url.into(),
            api_key,
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn charge(&self, request: &ChargeRequest) -> ChargeVerdict {
        let mut builder = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(&json!({
                "amount": request.amount,
                "amount_cents": request.amount.cents(),
                "payment_method": request.payment_method,
                "metadata": { "donation_id": request.donation_id },
            }));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = match builder.send().await {
            Ok(resp) => resp,
            Err(e) if e.is_builder() => {
                return ChargeVerdict::permanent(format!("invalid charge request: {e}"))
            }
            // Connection resets, DNS failures, client-side timeouts.
            Err(e) => return ChargeVerdict::transient(format!("request failed: {e}")),
        };

        let status = response.status();
        let body = response.json::<ChargeResponse>().await.ok();
        debug!(
            donation_id = request.donation_id,
            %status,
            "Processor responded"
        );
        classify_response(status, body)
    }
}

/// Map a processor HTTP response onto a verdict.
pub fn classify_response(status: StatusCode, body: Option<ChargeResponse>) -> ChargeVerdict {
    if status == StatusCode::PAYMENT_REQUIRED {
        let reason = body
            .and_then(|b| b.reason)
            .unwrap_or_else(|| "payment declined".to_string());
        return ChargeVerdict::Declined { reason };
    }
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        return ChargeVerdict::transient(format!("processor returned {status}"));
    }
    if !status.is_success() {
        let reason = body
            .and_then(|b| b.reason)
            .unwrap_or_else(|| format!("processor returned {status}"));
        return ChargeVerdict::permanent(reason);
    }

    let Some(body) = body else {
        return ChargeVerdict::transient("unreadable processor response");
    };
    match body.status.as_str() {
        "captured" | "succeeded" => match body.reference {
            Some(reference) => ChargeVerdict::Captured { reference },
            None => ChargeVerdict::permanent("capture without a reference"),
        },
        "declined" => ChargeVerdict::Declined {
            reason: body
                .reason
                .unwrap_or_else(|| "payment declined".to_string()),
        },
        "processing" | "pending" => ChargeVerdict::transient("charge still processing"),
        other => ChargeVerdict::permanent(format!("unexpected charge status {other:?}")),
    }
}

// ─────────────────────────────────────────────────────────
// Simulated processor
// ─────────────────────────────────────────────────────────

/// Payment-method tokens understood by [`SimulatedGateway`].
pub mod test_tokens {
    pub const DECLINE: &str = "tok_decline";
    pub const INSUFFICIENT_FUNDS: &str = "tok_insufficient_funds";
    pub const UNAVAILABLE: &str = "tok_unavailable";
    pub const REJECTED: &str = "tok_rejected";
}

/// In-process stand-in for a card processor, used when no processor URL is
/// configured. Outcomes are chosen by the payment-method token; any token
/// not listed in [`test_tokens`] captures.
///
/// Captures and declines are remembered per idempotency key, so charging the
/// same key again replays the first outcome instead of capturing twice.
#[derive(Default)]
pub struct SimulatedGateway {
    latency: Duration,
    settled: DashMap<String, ChargeVerdict>,
    next_reference: AtomicU64,
}

impl SimulatedGateway {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Number of distinct idempotency keys that reached a final verdict.
    pub fn settled_count(&self) -> usize {
        self.settled.len()
    }

    fn decide(&self, request: &ChargeRequest) -> ChargeVerdict {
        match request.payment_method.as_str() {
            test_tokens::DECLINE => ChargeVerdict::Declined {
                reason: "Your card was declined.".to_string(),
            },
            test_tokens::INSUFFICIENT_FUNDS => ChargeVerdict::Declined {
                reason: "Insufficient funds.".to_string(),
            },
            test_tokens::UNAVAILABLE => ChargeVerdict::transient("processor unavailable"),
            test_tokens::REJECTED => ChargeVerdict::permanent("payment method rejected"),
            _ => {
                let n = self.next_reference.fetch_add(1, Ordering::Relaxed) + 1;
                ChargeVerdict::Captured {
                    reference: format!("sim_ch_{n:08}"),
                }
            }
        }
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn charge(&self, request: &ChargeRequest) -> ChargeVerdict {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if let Some(previous) = self.settled.get(&request.idempotency_key) {
            return previous.clone();
        }

        let verdict = self.decide(request);
        if matches!(
            verdict,
            ChargeVerdict::Captured { .. } | ChargeVerdict::Declined { .. }
        ) {
            // First verdict for a key wins if two charges race.
            return self
                .settled
                .entry(request.idempotency_key.clone())
                .or_insert(verdict)
                .clone();
        }
        verdict
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
