use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod auth;
mod config;
mod extract;
mod migrate;
mod reconcile;
mod report;
mod xero;


use auth::AuthService;
use config::AppConfig;
use migrate::MigrationService;
use report::Reporter;
use xero::XeroClient;

const SUPPORTED_UPLOAD_EXTENSION: &str = ".csv";
const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

#[derive(Error, Debug)]
enum AppError {
    #[error("file part missing from upload")]
    MissingFilePart,

    #[error("unsupported upload format; expected {SUPPORTED_UPLOAD_EXTENSION}")]
    UnsupportedFormat,

    #[error("failed to read multipart body: {0}")]
    Multipart(#[from] MultipartError),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("request failed: {}", self);
        let status = match self {
            AppError::MissingFilePart | AppError::UnsupportedFormat | AppError::Multipart(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Clone)]
struct AppState {
    service: Arc<MigrationService>,
    auth: Arc<AuthService>,
    csv_file_location: PathBuf,
    auth_success_redirect_url: String,
    auth_error_redirect_url: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()
        .map_err(|e| anyhow::anyhow!("failed to load configuration from environment: {}", e))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    info!("configuration loaded");

    let client = Arc::new(XeroClient::new(
        &config.xero_endpoint,
        config.auth_token_file_location.clone(),
    )?);
    let reporter = Reporter::from_config(&config);
    let service = Arc::new(MigrationService::new(
        client,
        reporter,
        config.csv_file_location.clone(),
        Duration::from_secs(config.rate_limit_cooldown_secs),
    ));
    let auth = Arc::new(AuthService::new(
        config.xero_client_id.clone(),
        config.xero_secret.clone(),
        config.xero_auth_endpoint.clone(),
        config.xero_redirect_uri.clone(),
        config.auth_token_file_location.clone(),
    )?);

    let state = AppState {
        service,
        auth,
        csv_file_location: config.csv_file_location.clone(),
        auth_success_redirect_url: config.auth_success_redirect_url.clone(),
        auth_error_redirect_url: config.auth_error_redirect_url.clone(),
    };

    let v1_routes = Router::new()
        .route("/migrateLeaves", post(handle_migrate_leaves))
        .route("/oauth/redirect", get(handle_oauth_redirect));
    let app = Router::new()
        .route("/health", get(handle_health))
        .nest("/v1", v1_routes)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    info!("starting server on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn handle_health() -> &'static str {
    "OK"
}

/// Accepts the uploaded leave export, stages it, and runs the migration
/// synchronously. Any accumulated error lines come back as a 500 with the
/// list in the body; a clean run returns 200.
async fn handle_migrate_leaves(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Vec<String>>), AppError> {
    let mut staged = false;
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        if let Some(file_name) = field.file_name() {
            if !file_name
                .to_ascii_lowercase()
                .ends_with(SUPPORTED_UPLOAD_EXTENSION)
            {
                return Err(AppError::UnsupportedFormat);
            }
        }
        let data = field.bytes().await?;
        tokio::fs::write(&state.csv_file_location, &data).await?;
        staged = true;
        break;
    }
    if !staged {
        return Err(AppError::MissingFilePart);
    }

    let errors = state.service.run_migration().await;
    if errors.is_empty() {
        Ok((StatusCode::OK, Json(Vec::new())))
    } else {
        error!(count = errors.len(), "errors during processing leaves");
        Ok((StatusCode::INTERNAL_SERVER_ERROR, Json(errors)))
    }
}

#[derive(Debug, Deserialize)]
struct OAuthCallbackParams {
    code: Option<String>,
}

/// Xero redirects here after the user authorizes the app. The code is
/// exchanged for a token which lands in the token file the API client reads.
async fn handle_oauth_redirect(
    State(state): State<AppState>,
    Query(params): Query<OAuthCallbackParams>,
) -> Redirect {
    let Some(code) = params.code else {
        error!("oauth callback received without an authorization code");
        return Redirect::temporary(&state.auth_error_redirect_url);
    };

    match state.auth.exchange_code(&code).await {
        Ok(_) => {
            info!("oauth code exchanged; token persisted");
            Redirect::temporary(&state.auth_success_redirect_url)
        }
        Err(e) => {
            error!("oauth code exchange failed: {}", e);
            Redirect::temporary(&state.auth_error_redirect_url)
        }
    }
}
