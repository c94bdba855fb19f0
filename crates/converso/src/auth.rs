//! Caller credentials attached to module requests and job API calls.
//!
//! Tokens are opaque here. Obtaining and refreshing them is the auth layer's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const ACCESS_TOKEN_ENV: &str = "CONVERSO_ACCESS_TOKEN";
pub const DEVICE_TOKEN_ENV: &str = "CONVERSO_DEVICE_TOKEN";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub device_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>, device_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            device_token: device_token.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Read tokens from the environment. Missing variables yield empty tokens.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self::new(
            lookup(ACCESS_TOKEN_ENV).unwrap_or_default(),
            lookup(DEVICE_TOKEN_ENV).unwrap_or_default(),
        )
    }

    pub fn is_present(&self) -> bool {
        !self.access_token.is_empty()
    }

    /// Absent tokens count as expired. Tokens without an expiry never expire.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if !self.is_present() {
            return true;
        }
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// Bearer value for HTTP authorization, without double-prefixing.
    pub fn bearer(&self) -> String {
        if self.access_token.starts_with("Bearer ") {
            self.access_token.clone()
        } else {
            format!("Bearer {}", self.access_token)
        }
    }
}
