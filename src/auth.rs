// src/auth.rs

use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

use crate::xero::TokenData;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("token endpoint returned status {status}")]
    TokenEndpoint { status: StatusCode },

    #[error("JSON processing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to persist token file: {0}")]
    Io(#[from] std::io::Error),
}

/// Exchanges OAuth2 authorization codes at Xero's token endpoint and persists
/// the resulting token JSON where the API client reads it.
pub struct AuthService {
    http: Client,
    client_id: String,
    client_secret: String,
    token_endpoint: String,
    redirect_uri: String,
    token_file: PathBuf,
}

impl AuthService {
    pub fn new(
        client_id: String,
        client_secret: String,
        token_endpoint: String,
        redirect_uri: String,
        token_file: PathBuf,
    ) -> Result<Self, AuthError> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            http,
            client_id,
            client_secret,
            token_endpoint,
            redirect_uri,
            token_file,
        })
    }

    pub async fn exchange_code(&self, code: &str) -> Result<TokenData, AuthError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &self.redirect_uri),
        ];

        let response = self
            .http
            .post(&self.token_endpoint)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .header(ACCEPT, "application/json")
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            error!("xero auth service returned status {}", status);
            return Err(AuthError::TokenEndpoint { status });
        }

        let token: TokenData = response.json().await?;

        let json = serde_json::to_string_pretty(&token)?;
        tokio::fs::write(&self.token_file, json).await?;
        info!("token data saved to {}", self.token_file.display());

        Ok(token)
    }
}
