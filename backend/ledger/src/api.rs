//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::engine::{derive_idempotency_key, DonationEngine, DonationReceipt, DonationRequest};
use crate::errors::LedgerError;
use crate::models::{parse_timestamp, Amount, Campaign, Donation, NewCampaign, Principal};

/// Header carrying the authenticated principal's identifier.
pub const PRINCIPAL_ID_HEADER: &str = "x-principal-id";
/// Header carrying the principal's display name.
pub const PRINCIPAL_NAME_HEADER: &str = "x-principal-name";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

pub struct ApiState {
    pub engine: DonationEngine,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/campaigns", get(list_campaigns).post(create_campaign))
        .route("/campaigns/:id", get(get_campaign))
        .route(
            "/campaigns/:id/donations",
            get(list_donations).post(donate),
        )
        .route("/donations/:id", get(get_donation))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateCampaignBody {
    pub title: String,
    pub description: String,
    pub image_url: Option<String>,
    pub goal: Amount,
    /// RFC 3339 timestamp.
    pub deadline: String,
}

#[derive(Deserialize)]
pub struct DonateBody {
    pub amount: Amount,
    pub payment_method: String,
    pub message: Option<String>,
    pub idempotency_key: Option<String>,
}

/// A campaign plus the progress figures the UI shows next to it.
#[derive(Serialize)]
pub struct CampaignView {
    #[serde(flatten)]
    pub campaign: Campaign,
    pub percent_funded: Decimal,
    pub has_ended: bool,
}

impl From<Campaign> for CampaignView {
    fn from(campaign: Campaign) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            percent_funded: campaign.percent_funded(),
            has_ended: campaign.has_ended(now),
            campaign,
        }
    }
}

#[derive(Serialize)]
pub struct CampaignsResponse {
    pub count: usize,
    pub campaigns: Vec<CampaignView>,
}

#[derive(Serialize)]
pub struct DonationsResponse {
    pub campaign_id: i64,
    pub count: usize,
    pub donations: Vec<Donation>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub donation_id: Option<i64>,
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let status = match &self {
            LedgerError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::Unauthorized => StatusCode::UNAUTHORIZED,
            LedgerError::PaymentDeclined { .. } => StatusCode::PAYMENT_REQUIRED,
            LedgerError::PaymentInProgress { .. } => StatusCode::CONFLICT,
            LedgerError::GatewayRejected { .. } => StatusCode::BAD_GATEWAY,
            LedgerError::GatewayUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {self}");
            "internal error".to_string()
        } else {
            self.to_string()
        };

        (
            status,
            Json(ErrorResponse {
                error: message,
                donation_id: self.donation_id(),
            }),
        )
            .into_response()
    }
}

// ─────────────────────────────────────────────────────────
// Principal extraction
// ─────────────────────────────────────────────────────────

/// The caller as identified by the upstream identity layer.
pub struct Authenticated(pub Principal);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Authenticated {
    type Rejection = LedgerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = header_str(&parts.headers, PRINCIPAL_ID_HEADER).ok_or(LedgerError::Unauthorized)?;
        let name = header_str(&parts.headers, PRINCIPAL_NAME_HEADER).map(String::from);
        Ok(Self(Principal::new(id, name)))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /campaigns`
///
/// Returns every campaign, newest first.
pub async fn list_campaigns(
    State(state): State<Arc<ApiState>>,
) -> Result<impl IntoResponse, LedgerError> {
    let campaigns: Vec<CampaignView> = state
        .engine
        .campaigns()
        .await?
        .into_iter()
        .map(CampaignView::from)
        .collect();
    Ok(Json(CampaignsResponse {
        count: campaigns.len(),
        campaigns,
    }))
}

/// `POST /campaigns`
pub async fn create_campaign(
    State(state): State<Arc<ApiState>>,
    Authenticated(owner): Authenticated,
    Json(body): Json<CreateCampaignBody>,
) -> Result<impl IntoResponse, LedgerError> {
    let deadline = parse_timestamp(&body.deadline).ok_or_else(|| {
        LedgerError::Validation(format!("invalid deadline {:?}", body.deadline))
    })?;

    let campaign = state
        .engine
        .create_campaign(NewCampaign {
            title: body.title,
            description: body.description,
            image_url: body.image_url.filter(|u| !u.trim().is_empty()),
            owner,
            goal: body.goal,
            deadline,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(CampaignView::from(campaign))))
}

/// `GET /campaigns/:id`
///
/// Served from the read cache when possible.
pub async fn get_campaign(
    State(state): State<Arc<ApiState>>,
    Path(campaign_id): Path<i64>,
) -> Result<impl IntoResponse, LedgerError> {
    let campaign = state.engine.campaign(campaign_id).await?;
    Ok(Json(CampaignView::from(campaign)))
}

/// `GET /campaigns/:id/donations`
///
/// Returns confirmed donations, newest first.
pub async fn list_donations(
    State(state): State<Arc<ApiState>>,
    Path(campaign_id): Path<i64>,
) -> Result<impl IntoResponse, LedgerError> {
    let donations = state.engine.donations(campaign_id).await?;
    Ok(Json(DonationsResponse {
        campaign_id,
        count: donations.len(),
        donations,
    }))
}

/// `POST /campaigns/:id/donations`
///
/// The idempotency key comes from the `Idempotency-Key` header, then the
/// body, and is otherwise derived from the request contents.
pub async fn donate(
    State(state): State<Arc<ApiState>>,
    Path(campaign_id): Path<i64>,
    Authenticated(donor): Authenticated,
    headers: HeaderMap,
    Json(body): Json<DonateBody>,
) -> Result<impl IntoResponse, LedgerError> {
    if body.payment_method.trim().is_empty() {
        return Err(LedgerError::Validation(
            "payment_method is required".to_string(),
        ));
    }

    let idempotency_key = header_str(&headers, IDEMPOTENCY_KEY_HEADER)
        .map(String::from)
        .or_else(|| body.idempotency_key.filter(|k| !k.trim().is_empty()))
        .unwrap_or_else(|| {
            derive_idempotency_key(
                &donor.id,
                campaign_id,
                body.amount,
                &body.payment_method,
                body.message.as_deref(),
            )
        });

    let receipt: DonationReceipt = state
        .engine
        .donate(DonationRequest {
            campaign_id,
            donor,
            amount: body.amount,
            idempotency_key,
            payment_method: body.payment_method,
            message: body.message,
        })
        .await?;

    let status = if receipt.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(receipt)))
}

/// `GET /donations/:id`
pub async fn get_donation(
    State(state): State<Arc<ApiState>>,
    Path(donation_id): Path<i64>,
) -> Result<impl IntoResponse, LedgerError> {
    let donation = state.engine.donation(donation_id).await?;
    Ok(Json(donation))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::cache::CampaignCache;
    use crate::config::RetryPolicy;
    use crate::gateway::{test_tokens, SimulatedGateway};
    use crate::test_support::memory_pool;

    async fn app() -> Router {
        let engine = DonationEngine::new(
            memory_pool().await,
            Arc::new(SimulatedGateway::default()),
            Arc::new(CampaignCache::new()),
            RetryPolicy::default(),
        );
        router(Arc::new(ApiState { engine }))
    }

    fn post(uri: &str, principal: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::post(uri).header("content-type", "application/json");
        if let Some(id) = principal {
            builder = builder
                .header(PRINCIPAL_ID_HEADER, id)
                .header(PRINCIPAL_NAME_HEADER, "Test User");
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn campaign_body(goal: &str) -> Value {
        let deadline = chrono::Utc::now() + chrono::Duration::days(30);
        json!({
            "title": "Library books",
            "description": "Restock the children's section",
            "goal": goal,
            "deadline": deadline.to_rfc3339(),
        })
    }

    async fn create(app: &Router) -> i64 {
        let (status, body) = send(app, post("/campaigns", Some("owner"), campaign_body("1000"))).await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (status, body) = send(&app().await, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn writes_require_a_principal() {
        let app = app().await;
        let (status, _) = send(&app, post("/campaigns", None, campaign_body("10"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_and_fetch_campaign() {
        let app = app().await;
        let id = create(&app).await;

        let (status, body) = send(&app, get_req(&format!("/campaigns/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["raised"], "0.00");
        assert_eq!(body["goal"], "1000.00");
        assert_eq!(body["owner_name"], "Test User");
        assert_eq!(body["has_ended"], false);

        let (status, body) = send(&app, get_req("/campaigns")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
    }

    #[tokio::test]
    async fn invalid_campaigns_are_unprocessable() {
        let app = app().await;
        let mut past = campaign_body("10");
        past["deadline"] = json!("2001-01-01T00:00:00Z");
        let (status, _) = send(&app, post("/campaigns", Some("owner"), past)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = send(&app, post("/campaigns", Some("owner"), campaign_body("0"))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn donate_then_replay_with_the_same_key() {
        let app = app().await;
        let id = create(&app).await;
        let uri = format!("/campaigns/{id}/donations");

        let request = || {
            let mut req = post(
                &uri,
                Some("donor"),
                json!({ "amount": "100", "payment_method": "tok_visa", "message": "Go!" }),
            );
            req.headers_mut()
                .insert(IDEMPOTENCY_KEY_HEADER, "abc-123".parse().unwrap());
            req
        };

        let (status, body) = send(&app, request()).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["raised"], "100.00");
        assert_eq!(body["donation"]["status"], "confirmed");

        let (status, body) = send(&app, request()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["replayed"], true);
        assert_eq!(body["raised"], "100.00");

        let (_, campaign) = send(&app, get_req(&format!("/campaigns/{id}"))).await;
        assert_eq!(campaign["raised"], "100.00");
        assert_eq!(campaign["percent_funded"], "10");

        let (_, donations) = send(&app, get_req(&uri)).await;
        assert_eq!(donations["count"], 1);
        assert_eq!(donations["donations"][0]["message"], "Go!");
    }

    #[tokio::test]
    async fn declined_payment_is_payment_required() {
        let app = app().await;
        let id = create(&app).await;

        let (status, body) = send(
            &app,
            post(
                &format!("/campaigns/{id}/donations"),
                Some("donor"),
                json!({ "amount": "50", "payment_method": test_tokens::DECLINE }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        let donation_id = body["donation_id"].as_i64().unwrap();

        let (status, donation) = send(&app, get_req(&format!("/donations/{donation_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(donation["status"], "failed");
        assert_eq!(donation["failure"], "declined");

        let (_, campaign) = send(&app, get_req(&format!("/campaigns/{id}"))).await;
        assert_eq!(campaign["raised"], "0.00");
    }

    #[test]
    fn payment_errors_map_to_distinct_statuses() {
        let cases = [
            (LedgerError::PaymentInProgress { donation_id: 4 }, StatusCode::CONFLICT),
            (LedgerError::GatewayUnavailable { donation_id: 4 }, StatusCode::SERVICE_UNAVAILABLE),
            (
                LedgerError::InvalidStateTransition {
                    donation_id: 4,
                    from: "failed",
                    to: "confirmed",
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[tokio::test]
    async fn unknown_campaign_is_not_found() {
        let app = app().await;
        let (status, _) = send(&app, get_req("/campaigns/77")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &app,
            post(
                "/campaigns/77/donations",
                Some("donor"),
                json!({ "amount": "5", "payment_method": "tok_visa" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
