//! Cluster licenses: opaque strings carrying a signed JSON payload.
//!
//! A license is `<payload-json>.<hex signature>` where the signature is
//! SHA-256 over the payload bytes concatenated with the issuing CA secret.
//! The engine needs three things from a license: the package encryption
//! key, the expiration gate, and a verdict against the Hub's CA.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{EngineError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LicensePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_nodes: Option<usize>,
    /// Key used by the `decrypt` phase to unlock encrypted packages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    /// Forwarded to the application hook on a degraded cluster; the engine
    /// performs no additional enforcement.
    #[serde(default)]
    pub stop_app: bool,
}

#[derive(Debug, Clone)]
pub struct License {
    pub payload: LicensePayload,
    payload_bytes: Vec<u8>,
    signature: String,
}

impl License {
    /// Parse the opaque license string. Malformed input is a
    /// `bad_parameter` error: licenses are operator-supplied configuration,
    /// not runtime data.
    pub fn parse(raw: &str) -> Result<Self> {
        let (payload_part, signature) = raw
            .rsplit_once('.')
            .ok_or_else(|| EngineError::bad_parameter("license is missing its signature"))?;
        let payload: LicensePayload = serde_json::from_str(payload_part)
            .map_err(|e| EngineError::bad_parameter(format!("malformed license payload: {e}")))?;
        Ok(Self {
            payload,
            payload_bytes: payload_part.as_bytes().to_vec(),
            signature: signature.to_string(),
        })
    }

    /// Issue a license signed by `ca_secret`.
    pub fn issue(payload: &LicensePayload, ca_secret: &[u8]) -> Result<String> {
        let payload_json = serde_json::to_string(payload)?;
        let signature = sign(payload_json.as_bytes(), ca_secret);
        Ok(format!("{payload_json}.{signature}"))
    }

    /// Verify the signature against the issuing CA and the expiration
    /// against the current time.
    pub fn verify(&self, ca_secret: &[u8], now: DateTime<Utc>) -> Result<()> {
        let expected = sign(&self.payload_bytes, ca_secret);
        if expected != self.signature {
            return Err(EngineError::access_denied("license signature does not verify"));
        }
        if let Some(expiration) = self.payload.expiration
            && expiration <= now
        {
            return Err(EngineError::access_denied(format!(
                "license expired at {expiration}"
            )));
        }
        Ok(())
    }

    /// Extract the package encryption key. Absence is a `bad_parameter`
    /// error: the caller only asks when encrypted packages exist, and a
    /// license without the key cannot install them.
    pub fn encryption_key(&self) -> Result<&str> {
        self.payload
            .encryption_key
            .as_deref()
            .ok_or_else(|| EngineError::bad_parameter("license carries no encryption key"))
    }
}

fn sign(payload: &[u8], ca_secret: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(ca_secret);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CA: &[u8] = b"test-ca-secret";

    fn issue(payload: LicensePayload) -> License {
        let raw = License::issue(&payload, CA).unwrap();
        License::parse(&raw).unwrap()
    }

    #[test]
    fn issued_license_verifies() {
        let license = issue(LicensePayload::default());
        license.verify(CA, Utc::now()).unwrap();
    }

    #[test]
    fn wrong_ca_fails_verification() {
        let license = issue(LicensePayload::default());
        assert!(license.verify(b"other-ca", Utc::now()).is_err());
    }

    #[test]
    fn expired_license_fails_verification() {
        let license = issue(LicensePayload {
            expiration: Some(Utc::now() - chrono::Duration::hours(1)),
            ..Default::default()
        });
        let err = license.verify(CA, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn encryption_key_extraction() {
        let license = issue(LicensePayload {
            encryption_key: Some("k1".into()),
            ..Default::default()
        });
        assert_eq!(license.encryption_key().unwrap(), "k1");

        let bare = issue(LicensePayload::default());
        let err = bare.encryption_key().unwrap_err();
        assert!(matches!(err, EngineError::BadParameter(_)));
    }

    #[test]
    fn tampered_payload_fails() {
        let raw = License::issue(
            &LicensePayload {
                max_nodes: Some(3),
                ..Default::default()
            },
            CA,
        )
        .unwrap();
        let tampered = raw.replace("\"max_nodes\":3", "\"max_nodes\":30");
        let license = License::parse(&tampered).unwrap();
        assert!(license.verify(CA, Utc::now()).is_err());
    }

    #[test]
    fn garbage_is_bad_parameter() {
        assert!(matches!(
            License::parse("not a license").unwrap_err(),
            EngineError::BadParameter(_)
        ));
    }
}
