use std::time::Duration;

use colony_save_core::SaveError;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};

/// Connection settings for the REST backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestConfig {
    /// Project base URL, e.g. `https://example.supabase.co`
    pub base_url: String,
    /// Public API key sent as the `apikey` header
    pub api_key: String,
    #[serde(default = "default_table")]
    pub table: String,
    /// Per-request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_table() -> String {
    "game_saves".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl RestConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            table: default_table(),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn validate(&self) -> Result<(), SaveError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(SaveError::Config(format!(
                "remote URL must be http(s), got '{}'",
                self.base_url
            )));
        }
        if self.api_key.trim().is_empty() {
            return Err(SaveError::Config("remote API key is empty".into()));
        }
        if self.table.trim().is_empty() {
            return Err(SaveError::Config("remote table name is empty".into()));
        }
        Ok(())
    }

    pub(crate) fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub(crate) fn http_client(&self) -> Result<HttpClient, SaveError> {
        HttpClient::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| SaveError::Config(format!("Failed to build HTTP client: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        assert!(RestConfig::new("https://saves.example.com/", "anon").validate().is_ok());
        assert!(RestConfig::new("ftp://saves", "anon").validate().is_err());
        assert!(RestConfig::new("https://saves", " ").validate().is_err());
        assert_eq!(
            RestConfig::new("https://saves.example.com/", "anon").base(),
            "https://saves.example.com"
        );
    }
}
