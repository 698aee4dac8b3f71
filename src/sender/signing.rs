//! Request signing: a narrow stand-in for a real V4-style wire signature.
//!
//! Full protocol compliance is out of scope (§1); this trait exists so the
//! sender/shipper contract is exercised end to end, and so tests can inject a
//! non-cryptographic double.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub authorization: String,
    pub content_sha256: String,
    pub timestamp: i64,
}

pub trait RequestSigner: Send + Sync {
    fn sign(&self, method: &str, path: &str, body: &[u8], timestamp: i64) -> SignedRequest;
}

/// Simplified canonical-request HMAC-SHA256 over method/path/body-hash/timestamp.
pub struct HmacV4Signer {
    access_key_id: String,
    access_key_secret: String,
}

impl HmacV4Signer {
    pub fn new(access_key_id: impl Into<String>, access_key_secret: impl Into<String>) -> Self {
        HmacV4Signer {
            access_key_id: access_key_id.into(),
            access_key_secret: access_key_secret.into(),
        }
    }

    fn canonical_request(method: &str, path: &str, body_hash: &str, timestamp: i64) -> String {
        format!("{method}\n{path}\n{body_hash}\n{timestamp}")
    }
}

impl RequestSigner for HmacV4Signer {
    fn sign(&self, method: &str, path: &str, body: &[u8], timestamp: i64) -> SignedRequest {
        let body_hash = hex::encode(blake3::hash(body).as_bytes());
        let canonical = Self::canonical_request(method, path, &body_hash, timestamp);

        let mut mac = HmacSha256::new_from_slice(self.access_key_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(canonical.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        SignedRequest {
            authorization: format!("TAILSHIP-HMAC-SHA256 Credential={}, Signature={}", self.access_key_id, signature),
            content_sha256: body_hash,
            timestamp,
        }
    }
}

/// Deterministic test double: never fails, signature is just a marker.
#[cfg(any(test, feature = "test-support"))]
pub struct NullSigner;

#[cfg(any(test, feature = "test-support"))]
impl RequestSigner for NullSigner {
    fn sign(&self, _method: &str, _path: &str, body: &[u8], timestamp: i64) -> SignedRequest {
        SignedRequest {
            authorization: "NULL-SIGNATURE".to_string(),
            content_sha256: hex::encode(blake3::hash(body).as_bytes()),
            timestamp,
        }
    }
}
