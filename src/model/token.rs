//! Provisioning tokens used by agents to authenticate to the installer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Install,
    Expand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningToken {
    pub token: String,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    pub account_id: String,
    pub site_domain: String,
    pub operation_id: String,
    pub user_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

impl ProvisioningToken {
    pub fn new(
        token_type: TokenType,
        account_id: &str,
        site_domain: &str,
        operation_id: &str,
        user_email: &str,
        ttl: Option<chrono::Duration>,
    ) -> Self {
        Self {
            token: Uuid::new_v4().simple().to_string(),
            token_type,
            account_id: account_id.to_string(),
            site_domain: site_domain.to_string(),
            operation_id: operation_id.to_string(),
            user_email: user_email.to_string(),
            expires: ttl.map(|d| Utc::now() + d),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|e| e <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_without_ttl_never_expires() {
        let t = ProvisioningToken::new(TokenType::Install, "acc", "example.com", "op", "wizard@example.com", None);
        assert!(!t.is_expired(Utc::now() + chrono::Duration::days(365)));
    }

    #[test]
    fn token_with_ttl_expires() {
        let t = ProvisioningToken::new(
            TokenType::Expand,
            "acc",
            "example.com",
            "op",
            "admin@example.com",
            Some(chrono::Duration::minutes(30)),
        );
        assert!(!t.is_expired(Utc::now()));
        assert!(t.is_expired(Utc::now() + chrono::Duration::hours(1)));
    }

    #[test]
    fn tokens_are_unique() {
        let a = ProvisioningToken::new(TokenType::Install, "acc", "d", "op", "e", None);
        let b = ProvisioningToken::new(TokenType::Install, "acc", "d", "op", "e", None);
        assert_ne!(a.token, b.token);
    }
}
