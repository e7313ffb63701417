//! Crowdfund donation ledger entry point.
//!
//! Opens the SQLite ledger, wires the payment gateway and campaign cache
//! into the donation engine, and exposes a small Axum REST API for the
//! campaign frontend.

mod api;
mod cache;
mod config;
mod db;
mod engine;
mod errors;
mod gateway;
mod models;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use reqwest::Client;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cache::CampaignCache;
use config::Config;
use engine::DonationEngine;
use gateway::{HttpGateway, PaymentGateway, SimulatedGateway, TimeoutGateway};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    // Load config from environment.
    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url, config.db_max_connections).await?;

    // ─── Payment gateway ──────────────────────────────────
    let gateway: Arc<dyn PaymentGateway> = match &config.gateway_url {
        Some(url) => {
            let client = Client::builder().timeout(config.gateway_timeout).build()?;
            info!("Charging payments through {url}");
            Arc::new(TimeoutGateway::new(
                HttpGateway::new(client, url.clone(), config.gateway_api_key.clone()),
                config.gateway_timeout,
            ))
        }
        None => {
            warn!("GATEWAY_URL not set, using the simulated payment gateway");
            Arc::new(TimeoutGateway::new(
                SimulatedGateway::new(config.simulated_latency),
                config.gateway_timeout,
            ))
        }
    };

    // ─── Donation engine ──────────────────────────────────
    let engine = DonationEngine::new(
        pool,
        gateway,
        Arc::new(CampaignCache::new()),
        config.retry,
    );

    // Cross-check stored totals against confirmed donations.
    let drifted = engine.audit_totals().await?;
    if drifted.is_empty() {
        info!("Campaign totals match confirmed donations");
    } else {
        warn!("{} campaign total(s) disagree with their donations", drifted.len());
    }

    // ─── REST API ─────────────────────────────────────────
    let app = api::router(Arc::new(api::ApiState { engine }))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
