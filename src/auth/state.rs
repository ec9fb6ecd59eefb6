//! Signed, TTL-bound state blobs for SSO flows.
//!
//! The OIDC begin step stashes `{provider, nonce, code_verifier?,
//! next?, mode?}` in an opaque token the identity provider echoes back
//! as `state`. Format: `base64url(payload).base64url(ts).base64url(sig)`
//! where the signature is HMAC-SHA256 over the salt, payload, and
//! timestamp.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Serialize, de::DeserializeOwned};
use sha2::Sha256;
use subtle::ConstantTimeEq;

const STATE_SALT: &str = "opsdeck.sso.state";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Invalid SSO state token")]
    Invalid,

    #[error("SSO state token expired")]
    Expired,
}

#[derive(Clone)]
pub struct StateSigner {
    secret: SecretString,
    max_age_seconds: i64,
}

impl StateSigner {
    pub fn new(secret: SecretString, max_age_seconds: i64) -> Self {
        Self {
            secret,
            max_age_seconds,
        }
    }

    fn signature(&self, payload_b64: &str, ts_b64: &str) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .expect("hmac accepts any key length");
        mac.update(STATE_SALT.as_bytes());
        mac.update(b".");
        mac.update(payload_b64.as_bytes());
        mac.update(b".");
        mac.update(ts_b64.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    pub fn sign<T: Serialize>(&self, payload: &T) -> String {
        let raw = serde_json::to_vec(payload).expect("state payload serializes");
        let payload_b64 = URL_SAFE_NO_PAD.encode(raw);
        let ts_b64 = URL_SAFE_NO_PAD.encode(chrono::Utc::now().timestamp().to_string());
        let sig = URL_SAFE_NO_PAD.encode(self.signature(&payload_b64, &ts_b64));
        format!("{payload_b64}.{ts_b64}.{sig}")
    }

    pub fn verify<T: DeserializeOwned>(&self, token: &str) -> Result<T, StateError> {
        let mut parts = token.splitn(3, '.');
        let payload_b64 = parts.next().ok_or(StateError::Invalid)?;
        let ts_b64 = parts.next().ok_or(StateError::Invalid)?;
        let sig_b64 = parts.next().ok_or(StateError::Invalid)?;

        let presented = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| StateError::Invalid)?;
        let expected = self.signature(payload_b64, ts_b64);
        if expected.ct_eq(&presented).unwrap_u8() != 1 {
            return Err(StateError::Invalid);
        }

        let ts_raw = URL_SAFE_NO_PAD
            .decode(ts_b64)
            .map_err(|_| StateError::Invalid)?;
        let issued_at: i64 = String::from_utf8(ts_raw)
            .ok()
            .and_then(|raw| raw.parse().ok())
            .ok_or(StateError::Invalid)?;
        let age = chrono::Utc::now().timestamp() - issued_at;
        if age < 0 || age > self.max_age_seconds {
            return Err(StateError::Expired);
        }

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| StateError::Invalid)?;
        serde_json::from_slice(&payload).map_err(|_| StateError::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payload {
        provider: String,
        nonce: String,
    }

    fn signer(max_age: i64) -> StateSigner {
        StateSigner::new(
            SecretString::from("0123456789abcdef0123456789abcdef".to_string()),
            max_age,
        )
    }

    #[test]
    fn roundtrip() {
        let signer = signer(600);
        let payload = Payload {
            provider: "corp".into(),
            nonce: "n1".into(),
        };
        let token = signer.sign(&payload);
        let verified: Payload = signer.verify(&token).unwrap();
        assert_eq!(verified, payload);
    }

    #[test]
    fn tampered_tokens_fail() {
        let signer = signer(600);
        let token = signer.sign(&Payload {
            provider: "corp".into(),
            nonce: "n1".into(),
        });
        let mut tampered = token.clone();
        tampered.replace_range(0..1, if token.starts_with('A') { "B" } else { "A" });
        assert!(signer.verify::<Payload>(&tampered).is_err());

        // A different secret fails too.
        let other = StateSigner::new(
            SecretString::from("ffffffffffffffffffffffffffffffff".to_string()),
            600,
        );
        assert!(other.verify::<Payload>(&token).is_err());
    }

    #[test]
    fn expired_tokens_fail() {
        let signer = signer(0);
        let token = signer.sign(&Payload {
            provider: "corp".into(),
            nonce: "n1".into(),
        });
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(matches!(
            signer.verify::<Payload>(&token),
            Err(StateError::Expired)
        ));
    }
}
