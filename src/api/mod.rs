//! HTTP API for the devnet: balances, transfers, supply and deployments

use crate::config::ApiConfig;
use crate::error::RouterError;
use crate::transfer::TransferOrchestrator;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<TransferOrchestrator>,
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/deployments", get(get_deployments))
        .route("/supply", get(get_supply))
        .route("/chains/:chain/balances/:address", get(get_balance))
        .route("/chains/:chain/deposit", post(deposit))
        .route("/chains/:chain/transfer", post(transfer))
        .route("/chains/:chain/transfer-remote", post(transfer_remote))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> std::io::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router(state)).await
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn get_deployments(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.routers().await?))
}

async fn get_supply(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.supply_report().await?))
}

async fn get_balance(
    State(state): State<AppState>,
    Path((chain, address)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let account = parse_address(&address)?;
    let balance = state.orchestrator.balance_of(&chain, account).await?;
    Ok(Json(BalanceResponse {
        chain,
        account,
        balance: balance.to_string(),
    }))
}

async fn deposit(
    State(state): State<AppState>,
    Path(chain): Path<String>,
    Json(req): Json<DepositRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let amount = parse_amount(&req.amount)?;
    let balance = state.orchestrator.deposit(&chain, req.account, amount).await?;
    Ok(Json(BalanceResponse {
        chain,
        account: req.account,
        balance: balance.to_string(),
    }))
}

async fn transfer(
    State(state): State<AppState>,
    Path(chain): Path<String>,
    Json(req): Json<TransferRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let amount = parse_amount(&req.amount)?;
    state
        .orchestrator
        .transfer(&chain, req.from, req.to, amount)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn transfer_remote(
    State(state): State<AppState>,
    Path(chain): Path<String>,
    Json(req): Json<RemoteTransferRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let amount = parse_amount(&req.amount)?;
    let message = state
        .orchestrator
        .transfer_remote(&chain, req.sender, &req.destination, req.recipient, amount)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RemoteTransferResponse {
            id: format!("{:?}", message.id()),
            origin_chain_id: message.origin_chain_id,
            destination_chain_id: message.destination_chain_id,
            nonce: message.nonce,
            amount: message.amount.to_string(),
        }),
    ))
}

fn parse_amount(raw: &str) -> Result<U256, ApiError> {
    U256::from_dec_str(raw.trim())
        .map_err(|_| ApiError::BadRequest(format!("invalid amount {}", raw)))
}

fn parse_address(raw: &str) -> Result<Address, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid address {}", raw)))
}

/// Errors returned to API callers
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Router(RouterError),
}

impl From<RouterError> for ApiError {
    fn from(err: RouterError) -> Self {
        ApiError::Router(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Router(err) => {
                let status = match &err {
                    RouterError::UnknownChain { .. } => StatusCode::NOT_FOUND,
                    RouterError::Protocol(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    RouterError::Config(_) => StatusCode::BAD_REQUEST,
                    e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string())
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

// Request and response types

#[derive(Deserialize)]
struct DepositRequest {
    account: Address,
    /// Decimal token amount
    amount: String,
}

#[derive(Deserialize)]
struct TransferRequest {
    from: Address,
    to: Address,
    amount: String,
}

#[derive(Deserialize)]
struct RemoteTransferRequest {
    sender: Address,
    /// Destination chain name
    destination: String,
    recipient: Address,
    amount: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct BalanceResponse {
    chain: String,
    account: Address,
    balance: String,
}

#[derive(Serialize)]
struct RemoteTransferResponse {
    id: String,
    origin_chain_id: u64,
    destination_chain_id: u64,
    nonce: u64,
    amount: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devnet;
    use crate::resolver::tests::two_chains;
    use crate::resolver::{ChainConfigResolver, TokenDefinition};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn app() -> (Router, Arc<TransferOrchestrator>) {
        let token = TokenDefinition::new("Faucetful", "FCT", U256::zero()).unwrap();
        let (connections, core) = two_chains();
        let operator = Address::from_low_u64_be(0xaa);
        let resolved = ChainConfigResolver::new(&token, &connections, &core, operator)
            .resolve(&["mumbai".to_string()])
            .unwrap();
        let net = devnet::launch(&resolved, operator).await.unwrap();
        let orchestrator = net.orchestrator.clone();
        (
            router(AppState {
                orchestrator: net.orchestrator,
            }),
            orchestrator,
        )
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    const DEPOSITOR: &str = "0x0000000000000000000000000000000000001001";
    const RECIPIENT: &str = "0x0000000000000000000000000000000000001002";

    #[tokio::test]
    async fn health() {
        let (app, _) = app().await;
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn deposit_and_remote_transfer() {
        let (app, orchestrator) = app().await;

        let (status, body) = send(
            &app,
            "POST",
            "/chains/mumbai/deposit",
            Some(json!({ "account": DEPOSITOR, "amount": "37" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balance"], "37");

        let (status, body) = send(
            &app,
            "POST",
            "/chains/mumbai/transfer-remote",
            Some(json!({
                "sender": DEPOSITOR,
                "destination": "goerli",
                "recipient": RECIPIENT,
                "amount": "12"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["nonce"], 0);
        assert_eq!(body["destination_chain_id"], 5);

        orchestrator.process_messages().await;

        let uri = format!("/chains/goerli/balances/{}", RECIPIENT);
        let (status, body) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balance"], "12");

        let (status, body) = send(&app, "GET", "/supply", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["conserved"], true);
    }

    #[tokio::test]
    async fn protocol_rejections_are_client_errors() {
        let (app, _) = app().await;

        let (status, body) = send(
            &app,
            "POST",
            "/chains/goerli/deposit",
            Some(json!({ "account": DEPOSITOR, "amount": "5" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("mainnet"));

        let (status, _) = send(
            &app,
            "POST",
            "/chains/mumbai/transfer",
            Some(json!({ "from": DEPOSITOR, "to": RECIPIENT, "amount": "1" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = send(
            &app,
            "POST",
            "/chains/mumbai/deposit",
            Some(json!({ "account": DEPOSITOR, "amount": "-3" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "GET", "/chains/fuji/balances/0x00", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let uri = format!("/chains/fuji/balances/{}", DEPOSITOR);
        let (status, _) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn deployments_list_both_routers() {
        let (app, _) = app().await;
        let (status, body) = send(&app, "GET", "/deployments", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mumbai"]["role"], "mainnet");
        assert_eq!(body["goerli"]["role"], "secondary");
        assert_eq!(body["goerli"]["initialized"], true);
    }
}
