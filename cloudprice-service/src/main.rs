use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use uuid::Uuid;

use cloudprice_common::{
    AllowedInstanceAndPriceTypes, CloudPriceError, ContextualResource, InstancePrice,
};
use cloudprice_core::preference::{PgContextualPreferenceResolver, PgPreferenceStore};
use cloudprice_core::run_history::PgRunHistoryStore;
use cloudprice_core::store::{PgOfferStore, PgRegionStore};
use cloudprice_core::InstanceOfferManager;
use cloudprice_providers::{aws::AwsPriceProvider, mock::MockPriceProvider, ProviderRegistry};

struct AppState {
    manager: InstanceOfferManager,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    dotenv::dotenv().ok();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("Failed to connect to Postgres")?;

    // Run shared migrations (workspace root)
    sqlx::migrate!("../sqlx-migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let providers = build_provider_registry()?;
    let manager = InstanceOfferManager::new(
        Arc::new(PgOfferStore::new(pool.clone())),
        Arc::new(PgRegionStore::new(pool.clone())),
        Arc::new(PgPreferenceStore::new(pool.clone())),
        Arc::new(PgContextualPreferenceResolver::new(pool.clone())),
        Arc::new(PgRunHistoryStore::new(pool.clone())),
        Arc::new(providers),
    );
    let state = Arc::new(AppState { manager });

    // Background price list refresher
    {
        let state = state.clone();
        let interval = std::env::var("REFRESH_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600u64);
        tokio::spawn(async move {
            loop {
                if let Err(e) = state.manager.refresh_price_list().await {
                    error!("scheduled price list refresh failed: {:?}", e);
                }
                tokio::time::sleep(Duration::from_secs(interval)).await;
            }
        });
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/offers/publish-date", get(publish_date))
        .route("/offers/refresh", post(refresh_all))
        .route("/offers/refresh/:region_id", post(refresh_region))
        .route("/instance-types/allowed", get(allowed_instance_types))
        .route("/price/estimate", get(estimate_price))
        .layer(cors)
        .with_state(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], 8006));
    info!("Cloud price service listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_provider_registry() -> anyhow::Result<ProviderRegistry> {
    let provider = std::env::var("PROVIDER").unwrap_or_else(|_| "mock".to_string());
    let registry = match provider.trim().to_ascii_lowercase().as_str() {
        "mock" => ProviderRegistry::new().register(Arc::new(MockPriceProvider::new())),
        "aws" => ProviderRegistry::new().register(Arc::new(AwsPriceProvider::from_env())),
        other => anyhow::bail!("Unknown PROVIDER '{}', expected 'mock' or 'aws'", other),
    };
    Ok(registry)
}

async fn health() -> &'static str {
    "ok"
}

async fn publish_date(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Option<chrono::DateTime<chrono::Utc>>>, (StatusCode, String)> {
    let date = state
        .manager
        .price_list_publish_date()
        .await
        .map_err(internal)?;
    Ok(Json(date))
}

async fn refresh_all(
    State(state): State<Arc<AppState>>,
) -> Result<Json<usize>, (StatusCode, String)> {
    let stored = state.manager.refresh_price_list().await.map_err(internal)?;
    Ok(Json(stored))
}

async fn refresh_region(
    State(state): State<Arc<AppState>>,
    Path(region_id): Path<Uuid>,
) -> Result<Json<usize>, (StatusCode, String)> {
    let stored = state
        .manager
        .refresh_price_list_for_region(region_id)
        .await
        .map_err(domain)?;
    Ok(Json(stored))
}

#[derive(Deserialize)]
struct AllowedQuery {
    region_id: Option<Uuid>,
    tool_id: Option<String>,
    #[serde(default)]
    spot: bool,
}

async fn allowed_instance_types(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AllowedQuery>,
) -> Result<Json<AllowedInstanceAndPriceTypes>, (StatusCode, String)> {
    let tool = query.tool_id.map(ContextualResource::tool);
    let bundle = state
        .manager
        .get_allowed_instance_and_price_types(tool.as_ref(), query.region_id, query.spot)
        .await
        .map_err(domain)?;
    Ok(Json(bundle))
}

#[derive(Deserialize)]
struct EstimateQuery {
    instance_type: String,
    #[serde(default)]
    instance_disk: i32,
    #[serde(default)]
    spot: bool,
    region_id: Option<Uuid>,
}

async fn estimate_price(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EstimateQuery>,
) -> Result<Json<InstancePrice>, (StatusCode, String)> {
    let price = state
        .manager
        .get_instance_estimated_price(
            &query.instance_type,
            query.instance_disk,
            query.spot,
            query.region_id,
        )
        .await
        .map_err(domain)?;
    Ok(Json(price))
}

fn internal(err: anyhow::Error) -> (StatusCode, String) {
    error!("request failed: {:?}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn domain(err: CloudPriceError) -> (StatusCode, String) {
    let status = match &err {
        CloudPriceError::InstanceTypeNotAllowed { .. } => StatusCode::BAD_REQUEST,
        CloudPriceError::UnknownRegion { .. }
        | CloudPriceError::RunNotFound { .. }
        | CloudPriceError::NoDefaultRegion => StatusCode::NOT_FOUND,
        CloudPriceError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("request failed: {:?}", err);
    }
    (status, err.to_string())
}
