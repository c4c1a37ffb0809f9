// src/config.rs

use serde::Deserialize;
use std::path::PathBuf;

/// Application configuration, parsed from the environment (optionally seeded
/// from a .env file).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    // Xero
    pub xero_endpoint: String,
    pub xero_auth_endpoint: String,
    pub xero_client_id: String,
    pub xero_secret: String,
    pub xero_redirect_uri: String,
    pub auth_token_file_location: PathBuf,
    #[serde(default)]
    pub auth_success_redirect_url: String,
    #[serde(default)]
    pub auth_error_redirect_url: String,

    /// Where the uploaded export is staged before a run.
    pub csv_file_location: PathBuf,

    // Report email
    pub email_to: String,
    pub email_from: String,
    #[serde(default)]
    pub smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_username: Option<String>,
    #[serde(default)]
    pub smtp_password: Option<String>,

    /// How long a run pauses when the remaining Xero call quota gets low.
    #[serde(default = "default_rate_limit_cooldown_secs")]
    pub rate_limit_cooldown_secs: u64,
}

fn default_server_port() -> u16 {
    8080
}

fn default_smtp_port() -> u16 {
    587
}

fn default_rate_limit_cooldown_secs() -> u64 {
    60
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        // Load .env file if it exists
        dotenv::dotenv().ok();

        envy::from_env::<AppConfig>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_optional_values_are_absent() {
        let config: AppConfig = envy::from_iter(vec![
            ("XERO_ENDPOINT".to_string(), "https://api.xero.com".to_string()),
            (
                "XERO_AUTH_ENDPOINT".to_string(),
                "https://identity.xero.com/connect/token".to_string(),
            ),
            ("XERO_CLIENT_ID".to_string(), "client".to_string()),
            ("XERO_SECRET".to_string(), "secret".to_string()),
            (
                "XERO_REDIRECT_URI".to_string(),
                "https://example.com/v1/oauth/redirect".to_string(),
            ),
            (
                "AUTH_TOKEN_FILE_LOCATION".to_string(),
                "/tmp/token.json".to_string(),
            ),
            ("CSV_FILE_LOCATION".to_string(), "/tmp/leave.csv".to_string()),
            ("EMAIL_TO".to_string(), "ops@example.com".to_string()),
            ("EMAIL_FROM".to_string(), "noreply@example.com".to_string()),
        ])
        .unwrap();

        assert_eq!(config.server_port, 8080);
        assert_eq!(config.smtp_port, 587);
        assert_eq!(config.rate_limit_cooldown_secs, 60);
        assert!(config.smtp_host.is_none());
    }
}
