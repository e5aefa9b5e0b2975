//! axum routes over [`ApiState`].

use super::ApiState;
use crate::error::IndexerError;
use axum::{
    extract::Query,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{future::Future, net::SocketAddr};
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Header carrying the caller's wallet address.
pub const REQUESTER_HEADER: &str = "x-requester";

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IndexerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::EndpointUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::SyncInProgress => StatusCode::CONFLICT,
            Self::Unauthorized(_) => StatusCode::FORBIDDEN,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for IndexerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!(kind = self.kind(), error = %self, "request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, IndexerError>;

#[derive(Debug, Default, Deserialize)]
struct AddressQuery {
    address: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RequesterQuery {
    requester: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LevelQuery {
    level: u64,
}

#[derive(Debug, Default, Deserialize)]
struct AllowanceQuery {
    address: Option<String>,
    token: Option<String>,
}

fn requester_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUESTER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

fn required_address(query: AddressQuery) -> Result<String, IndexerError> {
    query
        .address
        .ok_or_else(|| IndexerError::InvalidInput("address query parameter is required".into()))
}

async fn user_info(
    Extension(api): Extension<ApiState>,
    headers: HeaderMap,
    Query(query): Query<AddressQuery>,
) -> ApiResult<super::UserInfoDto> {
    let address = query
        .address
        .or_else(|| requester_header(&headers))
        .ok_or_else(|| {
            IndexerError::InvalidInput(format!("address query or {REQUESTER_HEADER} header is required"))
        })?;
    Ok(Json(api.user_info(&address).await?))
}

async fn users(Extension(api): Extension<ApiState>) -> ApiResult<Vec<super::UserAddressDto>> {
    Ok(Json(api.users().await?))
}

async fn help_price(Extension(api): Extension<ApiState>) -> ApiResult<super::HelpPriceDto> {
    Ok(Json(api.help_price().await?))
}

async fn level_amount(
    Extension(api): Extension<ApiState>,
    Query(query): Query<LevelQuery>,
) -> ApiResult<super::LevelAmountDto> {
    Ok(Json(api.level_amount(query.level).await?))
}

async fn allowance(
    Extension(api): Extension<ApiState>,
    Query(query): Query<AllowanceQuery>,
) -> ApiResult<super::AllowanceDto> {
    let token = query.token.unwrap_or_else(|| "USDT".to_string());
    let address = required_address(AddressQuery {
        address: query.address,
    })?;
    Ok(Json(api.allowance(&address, &token).await?))
}

async fn owner(Extension(api): Extension<ApiState>) -> Json<super::OwnerDto> {
    Json(api.owner_info())
}

async fn transactions(
    Extension(api): Extension<ApiState>,
    Query(query): Query<AddressQuery>,
) -> ApiResult<Vec<super::TransactionDto>> {
    Ok(Json(api.transactions(&required_address(query)?).await?))
}

async fn user_donations(
    Extension(api): Extension<ApiState>,
    Query(query): Query<AddressQuery>,
) -> ApiResult<Vec<super::DonationDto>> {
    Ok(Json(api.user_donations(&required_address(query)?).await?))
}

async fn voluntary_donations(
    Extension(api): Extension<ApiState>,
    Query(query): Query<AddressQuery>,
) -> ApiResult<Vec<super::VoluntaryDonationDto>> {
    Ok(Json(api.voluntary_donations(&required_address(query)?).await?))
}

async fn help_transactions(
    Extension(api): Extension<ApiState>,
    Query(query): Query<AddressQuery>,
) -> ApiResult<Vec<super::HelpTransactionDto>> {
    Ok(Json(api.help_transactions(&required_address(query)?).await?))
}

async fn all_contract_transactions(
    Extension(api): Extension<ApiState>,
) -> ApiResult<Vec<super::TransactionDto>> {
    Ok(Json(api.all_contract_transactions().await?))
}

async fn contract_stats(
    Extension(api): Extension<ApiState>,
    headers: HeaderMap,
    Query(query): Query<RequesterQuery>,
) -> ApiResult<super::ContractStatsDto> {
    let requester = requester_header(&headers).or(query.requester);
    Ok(Json(api.contract_stats(requester.as_deref()).await?))
}

async fn sync(
    Extension(api): Extension<ApiState>,
    headers: HeaderMap,
) -> ApiResult<crate::sync::SyncOutcome> {
    let requester = requester_header(&headers);
    Ok(Json(api.sync(requester.as_deref()).await?))
}

async fn health(Extension(api): Extension<ApiState>) -> impl IntoResponse {
    let body = api.health();
    let status = if body.sync.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

pub fn router(api: ApiState) -> Router {
    let routes = Router::new()
        .route("/user-info", get(user_info))
        .route("/users", get(users))
        .route("/help-price", get(help_price))
        .route("/level-amount", get(level_amount))
        .route("/allowance", get(allowance))
        .route("/owner", get(owner))
        .route("/transactions", get(transactions))
        .route("/user-donations", get(user_donations))
        .route("/voluntary-donations", get(voluntary_donations))
        .route("/help-transactions", get(help_transactions))
        .route("/all-contract-transactions", get(all_contract_transactions))
        .route("/contract-stats", get(contract_stats))
        .route("/sync", post(sync));

    Router::new()
        .nest("/api", routes)
        .route("/health", get(health))
        .layer(Extension(api))
}

/// Serves `router` on `bind` until `shutdown` resolves.
pub async fn serve(
    bind: SocketAddr,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> eyre::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "serving REST API");
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(Into::into)
}
