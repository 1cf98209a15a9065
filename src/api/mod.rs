//! HTTP API for submitting transfers and looking up their status

use crate::config::ApiConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::state::{RequestMediator, TransferRequest};

use axum::{
    extract::{rejection::JsonRejection, Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ethers::types::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub mediator: Arc<RequestMediator>,
    /// Expected `Authorization` header value
    pub auth_header: Arc<str>,
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, mediator: Arc<RequestMediator>) -> RelayerResult<()> {
    let state = AppState {
        mediator,
        auth_header: config.auth_header.as_str().into(),
    };

    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RelayerError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/key/:address/tx", post(submit_transaction))
        .route("/tx/:id", get(get_transaction))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health_check))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == &*state.auth_header);

    if !authorized {
        warn!("Rejected unauthorized request to {}", request.uri().path());
        return ApiError::new(StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    next.run(request).await
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Send a transfer from the managed wallet `address`
async fn submit_transaction(
    State(state): State<AppState>,
    Path(address): Path<String>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;

    let from: Address = address
        .parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid wallet address: {}", address)))?;
    let to: Address = body
        .to
        .parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid recipient address: {}", body.to)))?;
    let value = U256::from_dec_str(&body.value)
        .map_err(|_| ApiError::bad_request(format!("Invalid value: {}", body.value)))?;
    let data = body.data.as_deref().map(parse_data).transpose()?;

    let id = state
        .mediator
        .submit(TransferRequest {
            chain_id: body.chain_id,
            from,
            to,
            value,
            data,
        })
        .await?;

    Ok(Json(SubmitResponse { id }))
}

async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = Uuid::parse_str(&id)
        .map_err(|_| ApiError::bad_request(format!("Invalid request id: {}", id)))?;

    match state.mediator.find(id).await? {
        Some(request) => Ok(Json(request).into_response()),
        None => Err(ApiError::new(StatusCode::NOT_FOUND, "Request not found")),
    }
}

fn parse_data(raw: &str) -> Result<Bytes, ApiError> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    hex::decode(digits)
        .map(Bytes::from)
        .map_err(|e| ApiError::bad_request(format!("Invalid data: {}", e)))
}

// Request and response types

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest {
    chain_id: u64,
    to: String,
    /// Wei, as a decimal string
    value: String,
    data: Option<String>,
}

#[derive(Serialize)]
struct SubmitResponse {
    id: Uuid,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Error with the status code it is reported under
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<RelayerError> for ApiError {
    fn from(e: RelayerError) -> Self {
        let status = match e {
            RelayerError::DuplicateId { .. } => StatusCode::CONFLICT,
            RelayerError::ChainNotFound { .. } | RelayerError::WalletNotManaged { .. } => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::FakeLedger;
    use crate::lifecycle::{ManagerSettings, TransactionManager};
    use crate::state::{MockRequestRepository, RequestRepository};
    use crate::tx::AccountRegistry;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use std::collections::HashMap;
    use tower::ServiceExt;

    const TOKEN: &str = "Bearer letmein";

    fn app(repository: MockRequestRepository) -> Router {
        let ledger = Arc::new(FakeLedger::new());
        let manager = Arc::new(TransactionManager::new(
            1,
            ledger.clone(),
            AccountRegistry::new([Address::repeat_byte(1)], ledger, None),
            ManagerSettings {
                blocks_before_retry: 3,
                blocks_before_cancel: 10,
                cancel_recipient: None,
            },
        ));
        let repository: Arc<dyn RequestRepository> = Arc::new(repository);

        router(AppState {
            mediator: Arc::new(RequestMediator::new(HashMap::from([(1, manager)]), repository)),
            auth_header: TOKEN.into(),
        })
    }

    fn submit(address: &str, body: &str, token: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::post(format!("/key/{}/tx", address))
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, token);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn wallet() -> String {
        format!("{:?}", Address::repeat_byte(1))
    }

    fn recipient() -> String {
        format!("{:?}", Address::repeat_byte(2))
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let response = app(MockRequestRepository::new())
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_missing_or_wrong_auth_is_rejected() {
        let body = format!(r#"{{"chainId":1,"to":"{}","value":"1"}}"#, recipient());

        for token in [None, Some("Bearer nope")] {
            let response = app(MockRequestRepository::new())
                .oneshot(submit(&wallet(), &body, token))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[tokio::test]
    async fn test_submit_returns_id() {
        let mut repository = MockRequestRepository::new();
        repository.expect_create().returning(|_| Ok(()));
        let body = format!(
            r#"{{"chainId":1,"to":"{}","value":"1000000000000000000","data":"0xabcd"}}"#,
            recipient()
        );

        let response = app(repository)
            .oneshot(submit(&wallet(), &body, Some(TOKEN)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let id = json(response).await["id"].as_str().unwrap().to_string();
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[tokio::test]
    async fn test_submit_validation_errors() {
        let cases = [
            (wallet(), format!(r#"{{"chainId":1,"to":"{}","value":"ten"}}"#, recipient())),
            (wallet(), r#"{"chainId":1,"to":"0x12","value":"1"}"#.to_string()),
            ("nope".to_string(), format!(r#"{{"chainId":1,"to":"{}","value":"1"}}"#, recipient())),
            (wallet(), format!(r#"{{"chainId":1,"to":"{}","value":"1","data":"0xzz"}}"#, recipient())),
            (wallet(), r#"{"chainId":1}"#.to_string()),
        ];

        for (address, body) in cases {
            let response = app(MockRequestRepository::new())
                .oneshot(submit(&address, &body, Some(TOKEN)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {}", body);
        }
    }

    #[tokio::test]
    async fn test_unknown_chain_and_wallet_are_not_found() {
        let unknown_chain = format!(r#"{{"chainId":99,"to":"{}","value":"1"}}"#, recipient());
        let response = app(MockRequestRepository::new())
            .oneshot(submit(&wallet(), &unknown_chain, Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = format!(r#"{{"chainId":1,"to":"{}","value":"1"}}"#, recipient());
        let stranger = format!("{:?}", Address::repeat_byte(9));
        let response = app(MockRequestRepository::new())
            .oneshot(submit(&stranger, &body, Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_lookup_of_unknown_request() {
        let mut repository = MockRequestRepository::new();
        repository.expect_find().returning(|_| Ok(None));

        let response = app(repository)
            .oneshot(
                HttpRequest::get(format!("/tx/{}", Uuid::new_v4()))
                    .header(header::AUTHORIZATION, TOKEN)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_lookup_with_malformed_id() {
        let response = app(MockRequestRepository::new())
            .oneshot(
                HttpRequest::get("/tx/not-a-uuid")
                    .header(header::AUTHORIZATION, TOKEN)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_error_status_mapping() {
        let duplicate: ApiError = RelayerError::DuplicateId { id: Uuid::nil() }.into();
        assert_eq!(duplicate.status, StatusCode::CONFLICT);

        let internal: ApiError = RelayerError::FeeFormatMismatch.into();
        assert_eq!(internal.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
