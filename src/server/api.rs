use crate::advisor::Advisor;
use crate::cli::Args;
use crate::error::AppError;
use crate::models::report::AnalysisReport;
use crate::models::user::User;
use super::{ api_key_matches, offered_api_key, API_KEY_HEADER };
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use axum::{
    body::Bytes,
    extract::{ DefaultBodyLimit, Request, State },
    http::{ header::CONTENT_TYPE, HeaderMap, HeaderValue, StatusCode },
    middleware::{ self, Next },
    response::Response,
    routing::{ get, post },
    Json,
    Router,
};
use serde::{ Deserialize, Serialize };
use tower_http::cors::{ AllowOrigin, Any, CorsLayer };
use log::{ info, error, warn };

// Room above the upload limit so oversized images reach the handler and get
// the friendly rejection instead of a bare 413.
const BODY_LIMIT_HEADROOM: usize = 1024 * 1024;

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Clone)]
struct AppState {
    advisor: Arc<Advisor>,
}

/// Who may call the HTTP API: the shared API key and the browser origins
/// allowed to send cross-origin requests.
#[derive(Clone, Debug, Default)]
pub struct ApiAccess {
    pub api_key: Option<String>,
    pub allowed_origins: Vec<String>,
}

fn cors_layer(access: &ApiAccess) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if !access.allowed_origins.is_empty() {
        let origins: Vec<HeaderValue> = access.allowed_origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin.trim()) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Ignoring invalid CORS origin '{}'", origin);
                    None
                }
            })
            .collect();
        return cors.allow_origin(AllowOrigin::list(origins));
    }
    if access.api_key.is_some() {
        // No cross-origin access unless origins are listed explicitly.
        return cors;
    }
    cors.allow_origin(Any)
}

async fn require_api_key(
    State(access): State<Arc<ApiAccess>>,
    request: Request,
    next: Next
) -> Result<Response, StatusCode> {
    let required = match &access.api_key {
        Some(key) => key,
        None => {
            return Ok(next.run(request).await);
        }
    };
    let header = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    let offered = offered_api_key(header, request.uri().query());
    if !api_key_matches(offered.as_deref(), required) {
        warn!("Rejected {} {}: bad or missing API key", request.method(), request.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(request).await)
}

pub fn router(advisor: Arc<Advisor>, access: ApiAccess) -> Router {
    let body_limit = advisor.max_upload_bytes().saturating_add(BODY_LIMIT_HEADROOM);
    let cors = cors_layer(&access);

    let protected = Router::new()
        .route("/api/auth/register", post(register_handler))
        .route("/api/auth/login", post(login_handler))
        .route("/api/auth/logout", post(logout_handler))
        .route("/api/auth/me", get(me_handler))
        .route("/api/analyze", post(analyze_handler))
        .route("/api/history", get(history_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(Arc::new(access), require_api_key));

    Router::new()
        .route("/api/health", get(health_handler))
        .merge(protected)
        .layer(cors)
        .with_state(AppState { advisor })
}

pub async fn start_http_server(
    advisor: Arc<Advisor>,
    api_key: Option<String>,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = args.http_addr.parse::<SocketAddr>()?;
    let access = ApiAccess { api_key, allowed_origins: args.cors_origins.clone() };
    let app = router(advisor, access);

    match (args.enable_tls, &args.tls_cert_path, &args.tls_key_path) {
        (true, Some(cert_path), Some(key_path)) => {
            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                cert_path,
                key_path
            ).await?;
            info!("Starting HTTPS API server on: https://{}", addr);

            tokio::spawn(async move {
                let result = axum_server::bind_rustls(addr, tls_config)
                    .serve(app.into_make_service()).await;
                if let Err(e) = result {
                    error!("HTTPS server error: {}", e);
                }
            });
        }
        _ => {
            let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
                error!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e);
                e
            })?;
            info!("Starting HTTP API server on: http://{}", addr);

            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                    error!("HTTP server error: {}", e);
                }
            });
        }
    }

    Ok(())
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn register_handler(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>
) -> Result<(StatusCode, Json<User>), AppError> {
    let user = state.advisor.register(&req.name, &req.email, &req.password).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn login_handler(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>
) -> Result<Json<User>, AppError> {
    Ok(Json(state.advisor.login(&req.email, &req.password).await?))
}

async fn logout_handler(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    state.advisor.logout().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn me_handler(State(state): State<AppState>) -> Result<Json<User>, AppError> {
    Ok(Json(state.advisor.require_user().await?))
}

async fn analyze_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes
) -> Result<Json<AnalysisReport>, AppError> {
    let mime_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    Ok(Json(state.advisor.analyze(&body, mime_type).await?))
}

async fn history_handler(
    State(state): State<AppState>
) -> Result<Json<Vec<AnalysisReport>>, AppError> {
    Ok(Json(state.advisor.history().await?))
}
