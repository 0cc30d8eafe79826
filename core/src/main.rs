mod errors;

use crate::errors::AppError;
use axum::{
    extract::{Json, Path},
    http::StatusCode,
    routing::{get, post},
    Extension, Router,
};
use config::{Config, ConfigError};
use debitflow_core::ledger::{LedgerReader, SigningHandle};
use debitflow_core::ledger_config::{resolve_preset, LedgerConfig};
use debitflow_core::notify::{TracingNotifier, TracingProgress};
use debitflow_core::orchestrator::{SubscriptionOrchestrator, SubscriptionRequest};
use debitflow_core::parser::{format_amount, parse_address};
use debitflow_core::rpc_provider::{ProviderHealth, ProviderRegistry, RpcProvider};
use debitflow_core::wallet::{InjectedWalletProvider, LocalKeyProvider, SigningProvider};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::env;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

#[derive(Deserialize)]
struct AppConfig {
    server_port: u16,
    rust_log: String,
    ledger_preset: String,
    /// Comma-separated, in priority order.
    rpc_urls: String,
    wallet_rpc_url: Option<String>,
    signer_private_key: Option<String>,
    health_check_interval_secs: u64,
    token_address: Option<String>,
    treasury_address: Option<String>,
    subscription_manager_address: Option<String>,
}

fn load_config() -> Result<AppConfig, ConfigError> {
    dotenvy::dotenv().ok();

    let settings = Config::builder()
        .add_source(config::Environment::default())
        .set_default("server_port", 8080)?
        .set_default("rust_log", "info")?
        .set_default("ledger_preset", "sepolia")?
        .set_default("rpc_urls", "https://ethereum-sepolia-rpc.publicnode.com")?
        .set_default("health_check_interval_secs", 30)?
        .build()?;

    settings.try_deserialize()
}

fn ledger_config(config: &AppConfig) -> Result<LedgerConfig, Box<dyn Error>> {
    let preset = resolve_preset(&config.ledger_preset)
        .ok_or_else(|| format!("unknown ledger preset: {}", config.ledger_preset))?;
    let parse = |value: &Option<String>| value.as_deref().map(parse_address).transpose();
    Ok(preset.with_overrides(
        parse(&config.token_address)?,
        parse(&config.treasury_address)?,
        parse(&config.subscription_manager_address)?,
    ))
}

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<SubscriptionOrchestrator>,
    registry: Arc<ProviderRegistry>,
}

// ── DTOs ──────────────────────────────────────────────────────────────────────

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    #[schema(example = "Sepolia")]
    ledger: String,
    #[schema(example = 11155111)]
    chain_id: u64,
    providers: Vec<ProviderHealth>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct CreateSubscriptionResponse {
    #[schema(example = "42")]
    subscription_id: String,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct SubscriptionView {
    id: String,
    user: String,
    merchant: String,
    #[schema(example = "15.99")]
    amount: String,
    interval: String,
    active: bool,
    use_treasury: bool,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct BalanceResponse {
    /// Base units.
    #[schema(example = "15990000")]
    raw: String,
    #[schema(example = "15.99")]
    formatted: String,
}

impl BalanceResponse {
    fn new(amount: U256, decimals: u8) -> Self {
        Self {
            raw: amount.to_string(),
            formatted: format_amount(amount, decimals),
        }
    }
}

fn parse_sub_id(raw: &str) -> Result<U256, AppError> {
    U256::from_dec_str(raw)
        .map_err(|e| AppError::BadRequest(format!("invalid subscription id {raw}: {e}")))
}

// ── Handlers ──────────────────────────────────────────────────────────────────

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Ledger and RPC endpoint health", body = HealthResponse)),
    tag = "Health"
)]
async fn health_check(Extension(state): Extension<AppState>) -> Json<HealthResponse> {
    let config = state.orchestrator.config();
    Json(HealthResponse {
        ledger: config.name.clone(),
        chain_id: config.chain_id,
        providers: state.registry.snapshot().await,
    })
}

#[utoipa::path(
    post,
    path = "/subscriptions",
    request_body = SubscriptionRequest,
    responses(
        (status = 201, description = "Subscription created and first payment executed", body = CreateSubscriptionResponse),
        (status = 400, description = "Invalid request or insufficient balance"),
        (status = 401, description = "Wallet connection rejected"),
        (status = 502, description = "A ledger step failed; body reports committed steps and diagnostics"),
        (status = 503, description = "No wallet available")
    ),
    tag = "Subscriptions"
)]
async fn create_subscription(
    Extension(state): Extension<AppState>,
    Json(request): Json<SubscriptionRequest>,
) -> Result<(StatusCode, Json<CreateSubscriptionResponse>), AppError> {
    tracing::info!(
        merchant = %request.merchant,
        amount = %request.amount,
        use_treasury = request.use_treasury,
        "Subscription requested"
    );
    let subscription_id = state
        .orchestrator
        .create_direct_debit_subscription(&request)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSubscriptionResponse { subscription_id }),
    ))
}

#[utoipa::path(
    get,
    path = "/subscriptions/{id}",
    params(("id" = String, Path, description = "Decimal subscription id")),
    responses(
        (status = 200, description = "Subscription record", body = SubscriptionView),
        (status = 404, description = "No such subscription")
    ),
    tag = "Subscriptions"
)]
async fn get_subscription(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SubscriptionView>, AppError> {
    let id = parse_sub_id(&id)?;
    let session = state.orchestrator.session().await?;
    let sub = session.subscription_by_id(id).await?;
    let decimals = state.orchestrator.config().decimals;
    Ok(Json(SubscriptionView {
        id: sub.id.to_string(),
        user: format!("{:?}", sub.user),
        merchant: format!("{:?}", sub.merchant),
        amount: format_amount(sub.amount, decimals),
        interval: sub.interval.to_string(),
        active: sub.active,
        use_treasury: sub.use_treasury,
    }))
}

#[utoipa::path(
    get,
    path = "/treasury/{id}/balance",
    params(("id" = String, Path, description = "Decimal subscription id")),
    responses((status = 200, description = "Treasury balance held for the subscription", body = BalanceResponse)),
    tag = "Balances"
)]
async fn treasury_balance(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BalanceResponse>, AppError> {
    let id = parse_sub_id(&id)?;
    let session = state.orchestrator.session().await?;
    let balance = session.treasury_balance(id).await?;
    Ok(Json(BalanceResponse::new(
        balance,
        state.orchestrator.config().decimals,
    )))
}

#[utoipa::path(
    get,
    path = "/account/balance",
    responses((status = 200, description = "Token balance of the connected account", body = BalanceResponse)),
    tag = "Balances"
)]
async fn account_balance(
    Extension(state): Extension<AppState>,
) -> Result<Json<BalanceResponse>, AppError> {
    let session = state.orchestrator.session().await?;
    let balance = session.token_balance(session.account()).await?;
    Ok(Json(BalanceResponse::new(
        balance,
        state.orchestrator.config().decimals,
    )))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        create_subscription,
        get_subscription,
        treasury_balance,
        account_balance
    ),
    components(schemas(
        HealthResponse, ProviderHealth, SubscriptionRequest, CreateSubscriptionResponse,
        SubscriptionView, BalanceResponse
    )),
    tags(
        (name = "Subscriptions", description = "Direct-debit subscription flow"),
        (name = "Balances", description = "Token and treasury balances"),
        (name = "Health", description = "Service and RPC endpoint health")
    ),
    info(
        title = "DebitFlow API",
        version = "0.1.0",
        description = "Direct-debit subscriptions over an EVM token ledger"
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // -------------------------------
    // Load configuration
    // -------------------------------
    let config = load_config()?;

    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", &config.rust_log);
    }
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let ledger = ledger_config(&config)?;
    tracing::info!(
        ledger = %ledger.name,
        chain_id = ledger.chain_id,
        token = ?ledger.token_address,
        treasury = ?ledger.treasury_address,
        subscription_manager = ?ledger.subscription_manager_address,
        "DebitFlow starting"
    );

    // -------------------------------
    // RPC endpoint selection
    // -------------------------------
    let providers = RpcProvider::from_url_list(&config.rpc_urls);
    let fallback = providers
        .first()
        .cloned()
        .ok_or("RPC_URLS must name at least one endpoint")?;
    let registry = ProviderRegistry::new(providers);
    let rpc = match registry.first_healthy().await {
        Some(provider) => provider,
        None => {
            tracing::warn!(url = %fallback.url, "No RPC endpoint answered, using the first one");
            fallback
        }
    };
    let _health_checker = registry.spawn_health_checker(Duration::from_secs(config.health_check_interval_secs));
    tracing::info!(provider = %rpc.name, url = %rpc.url, "Using RPC endpoint");

    // -------------------------------
    // Wallet
    // -------------------------------
    let signer: Arc<dyn SigningProvider> = match (&config.signer_private_key, &config.wallet_rpc_url) {
        (Some(key), _) => {
            tracing::info!("Signing with local key");
            Arc::new(LocalKeyProvider::new(
                rpc.url.clone(),
                Some(key.clone()),
                ledger.clone(),
            ))
        }
        (None, Some(wallet_url)) => {
            tracing::info!(wallet = %wallet_url, "Signing through injected wallet");
            Arc::new(InjectedWalletProvider::new(wallet_url.clone(), ledger.clone()))
        }
        (None, None) => {
            tracing::info!("Signing with node-managed accounts");
            Arc::new(InjectedWalletProvider::new(rpc.url.clone(), ledger.clone()))
        }
    };

    let orchestrator = SubscriptionOrchestrator::new(
        ledger,
        signer,
        Arc::new(TracingNotifier),
        Arc::new(TracingProgress),
    )?;
    let state = AppState {
        orchestrator: Arc::new(orchestrator),
        registry,
    };

    // -------------------------------
    // Web Server Setup
    // -------------------------------
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(health_check))
        .route("/subscriptions", post(create_subscription))
        .route("/subscriptions/:id", get(get_subscription))
        .route("/treasury/:id/balance", get(treasury_balance))
        .route("/account/balance", get(account_balance))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(Extension(state)),
        );

    let bind_addr = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("Server listening on http://{}", local_addr);
    tracing::info!("Swagger UI available at http://{}/swagger-ui", local_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_config(preset: &str) -> AppConfig {
        AppConfig {
            server_port: 8080,
            rust_log: "info".to_string(),
            ledger_preset: preset.to_string(),
            rpc_urls: "http://127.0.0.1:8545".to_string(),
            wallet_rpc_url: None,
            signer_private_key: None,
            health_check_interval_secs: 30,
            token_address: None,
            treasury_address: None,
            subscription_manager_address: None,
        }
    }

    #[test]
    fn test_ledger_config_applies_overrides() {
        let mut config = app_config("anvil");
        config.treasury_address = Some("0x1111111111111111111111111111111111111111".to_string());
        let ledger = ledger_config(&config).unwrap();
        assert_eq!(ledger.chain_id, 31_337);
        assert_eq!(
            ledger.treasury_address,
            ethers::types::Address::repeat_byte(0x11)
        );
    }

    #[test]
    fn test_ledger_config_rejects_unknown_preset_and_bad_override() {
        assert!(ledger_config(&app_config("mainnet")).is_err());

        let mut config = app_config("sepolia");
        config.token_address = Some("not-an-address".to_string());
        assert!(ledger_config(&config).is_err());
    }

    #[test]
    fn test_parse_sub_id() {
        assert_eq!(parse_sub_id("42").unwrap(), U256::from(42u64));
        assert!(matches!(parse_sub_id("0x2a"), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn test_balance_response_formats() {
        let balance = BalanceResponse::new(U256::from(15_990_000u64), 6);
        assert_eq!(balance.raw, "15990000");
        assert_eq!(balance.formatted, "15.99");
    }
}
