//! API key validation for the control plane

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use subtle::ConstantTimeEq;

/// Validates client credentials presented in `Auth` frames.
///
/// With a master key configured, keys are compared in constant time.
/// Without one (but auth still required), any non-empty key is accepted -
/// the documented self-hosted mode where the key only names the account.
pub struct Authenticator {
    master_key: Option<String>,
}

impl Authenticator {
    pub fn new(master_key: Option<String>) -> Self {
        Self { master_key }
    }

    pub fn validate(&self, api_key: &str) -> bool {
        match &self.master_key {
            Some(master) => constant_time_eq(master.as_bytes(), api_key.as_bytes()),
            None => !api_key.is_empty(),
        }
    }

    pub fn account_id_for(&self, api_key: &str) -> String {
        if self.master_key.is_some() {
            "master".to_string()
        } else {
            // Stable opaque label; never echo key material back
            let mut hasher = DefaultHasher::new();
            api_key.hash(&mut hasher);
            format!("acct-{:016x}", hasher.finish())
        }
    }
}

/// Length check first, then a constant-time byte compare.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).unwrap_u8() == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_key_exact_match() {
        let auth = Authenticator::new(Some("s3cret".to_string()));
        assert!(auth.validate("s3cret"));
        assert!(!auth.validate("s3cret "));
        assert!(!auth.validate("S3CRET"));
        assert!(!auth.validate(""));
        assert_eq!(auth.account_id_for("s3cret"), "master");
    }

    #[test]
    fn test_open_mode_accepts_any_nonempty_key() {
        let auth = Authenticator::new(None);
        assert!(auth.validate("anything"));
        assert!(!auth.validate(""));

        let a = auth.account_id_for("key-one");
        let b = auth.account_id_for("key-two");
        assert_ne!(a, b);
        assert_eq!(a, auth.account_id_for("key-one"));
        assert!(!a.contains("key-one"));
    }

    #[test]
    fn test_constant_time_eq_handles_length_mismatch() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(!constant_time_eq(b"abc", b"abd"));
    }
}
