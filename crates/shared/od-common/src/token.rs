//! Capability tokens: HMAC-SHA256 of an identity under the API root key.
//!
//! A token grants a narrow, fixed action set to one identity (a domain, an
//! app). Derivation is deterministic so both the API server and the app
//! launcher compute the same value without storing it.

use ring::hmac;

/// Derive the capability token for `identity`.
pub fn derive(root_key_hex: &str, identity: &str) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, root_key_hex.as_bytes());
    let tag = hmac::sign(&key, identity.as_bytes());
    hex::encode(tag.as_ref())
}

/// Constant-time verification that `token` belongs to `identity`.
pub fn verify(root_key_hex: &str, identity: &str, token: &str) -> bool {
    let key = hmac::Key::new(hmac::HMAC_SHA256, root_key_hex.as_bytes());
    let Ok(raw) = hex::decode(token) else {
        return false;
    };
    hmac::verify(&key, identity.as_bytes(), &raw).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let a = derive("rootkey", "example.com");
        let b = derive("rootkey", "example.com");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn different_identities_differ() {
        assert_ne!(derive("rootkey", "a.com"), derive("rootkey", "b.com"));
    }

    #[test]
    fn verify_accepts_derived_token() {
        let token = derive("rootkey", "example.com");
        assert!(verify("rootkey", "example.com", &token));
    }

    #[test]
    fn verify_rejects_wrong_identity_or_garbage() {
        let token = derive("rootkey", "example.com");
        assert!(!verify("rootkey", "other.com", &token));
        assert!(!verify("rootkey", "example.com", "zz-not-hex"));
        assert!(!verify("otherkey", "example.com", &token));
    }
}
