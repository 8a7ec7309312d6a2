//! Tunnel registry - subdomain and session indexes plus label validation
//!
//! Three indexes live under one mutex so every mutator leaves them
//! consistent: a subdomain key always resolves to a tunnel present in the
//! id index and vice versa.

use burrow_common::TunnelProtocol;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Labels that can never be claimed, regardless of deployment config
static DEFAULT_RESERVED: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "www", "api", "app", "mail", "smtp", "imap", "ftp", "ssh", "vpn",
        "cdn", "static", "assets", "status", "health", "metrics", "docs",
        "blog", "admin", "dashboard", "console", "login", "auth", "account",
        "support", "billing", "internal", "dev", "staging", "prod", "test",
        "burrow", "tunnel", "tunnels",
    ]
    .into_iter()
    .collect()
});

/// How many random labels to try before giving up
const GENERATE_ATTEMPTS: usize = 1000;

/// An active route from a public subdomain to one control session.
#[derive(Debug, Clone)]
pub struct Tunnel {
    pub id: String,
    pub subdomain: String,
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Optional `user:pass` required from public callers
    pub basic_auth: Option<String>,
    pub protocol: TunnelProtocol,
}

impl Tunnel {
    pub fn new(
        subdomain: String,
        session_id: Uuid,
        basic_auth: Option<String>,
        protocol: TunnelProtocol,
    ) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            subdomain,
            session_id,
            created_at: Utc::now(),
            basic_auth,
            protocol,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubdomainError {
    #[error("Subdomain must be 3-63 characters")]
    BadLength,

    #[error("Subdomain can only contain lowercase letters, digits, and hyphens")]
    InvalidCharacters,

    #[error("Subdomain cannot begin or end with a hyphen")]
    EdgeHyphen,

    #[error("Subdomain cannot contain consecutive hyphens")]
    DoubleHyphen,

    #[error("'{0}' is a reserved name")]
    Reserved(String),

    #[error("Subdomain '{0}' is not available")]
    NotAvailable(String),

    #[error("Could not mint a unique subdomain")]
    PoolExhausted,
}

#[derive(Default)]
struct Indexes {
    by_id: HashMap<String, Arc<Tunnel>>,
    by_subdomain: HashMap<String, Arc<Tunnel>>,
    by_session: HashMap<Uuid, Vec<Arc<Tunnel>>>,
    reserved: HashSet<String>,
}

/// Process-local tunnel index.
pub struct TunnelRegistry {
    inner: Mutex<Indexes>,
}

impl TunnelRegistry {
    pub fn new(extra_reserved: impl IntoIterator<Item = String>) -> Self {
        let mut reserved: HashSet<String> =
            DEFAULT_RESERVED.iter().map(|s| s.to_string()).collect();
        reserved.extend(extra_reserved.into_iter().map(|s| s.to_lowercase()));
        Self {
            inner: Mutex::new(Indexes {
                reserved,
                ..Indexes::default()
            }),
        }
    }

    /// Validate and claim the tunnel's subdomain, then index it. The
    /// availability check and the insert happen under one lock.
    pub fn register(&self, tunnel: Tunnel) -> Result<Arc<Tunnel>, SubdomainError> {
        let mut inner = self.inner.lock().unwrap();
        validate_label(&tunnel.subdomain, &inner.reserved)?;
        if inner.by_subdomain.contains_key(&tunnel.subdomain) {
            return Err(SubdomainError::NotAvailable(tunnel.subdomain));
        }

        let tunnel = Arc::new(tunnel);
        inner.by_id.insert(tunnel.id.clone(), tunnel.clone());
        inner
            .by_subdomain
            .insert(tunnel.subdomain.clone(), tunnel.clone());
        inner
            .by_session
            .entry(tunnel.session_id)
            .or_default()
            .push(tunnel.clone());
        Ok(tunnel)
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<Tunnel>> {
        let mut inner = self.inner.lock().unwrap();
        let tunnel = inner.by_id.remove(id)?;
        inner.by_subdomain.remove(&tunnel.subdomain);
        if let Some(list) = inner.by_session.get_mut(&tunnel.session_id) {
            list.retain(|t| t.id != tunnel.id);
            if list.is_empty() {
                inner.by_session.remove(&tunnel.session_id);
            }
        }
        Some(tunnel)
    }

    /// Remove every tunnel owned by a session, returning them for
    /// downstream cleanup.
    pub fn unregister_session(&self, session_id: Uuid) -> Vec<Arc<Tunnel>> {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.by_session.remove(&session_id).unwrap_or_default();
        for tunnel in &removed {
            inner.by_id.remove(&tunnel.id);
            inner.by_subdomain.remove(&tunnel.subdomain);
        }
        removed
    }

    pub fn find_by_id(&self, id: &str) -> Option<Arc<Tunnel>> {
        self.inner.lock().unwrap().by_id.get(id).cloned()
    }

    pub fn find_by_subdomain(&self, subdomain: &str) -> Option<Arc<Tunnel>> {
        let folded = subdomain.to_lowercase();
        self.inner.lock().unwrap().by_subdomain.get(&folded).cloned()
    }

    pub fn is_available(&self, subdomain: &str) -> bool {
        let folded = subdomain.to_lowercase();
        let inner = self.inner.lock().unwrap();
        !inner.by_subdomain.contains_key(&folded) && !inner.reserved.contains(&folded)
    }

    /// Grammar and reserved-set check. Returns the case-folded label.
    pub fn validate(&self, subdomain: &str) -> Result<String, SubdomainError> {
        let folded = subdomain.to_lowercase();
        let inner = self.inner.lock().unwrap();
        validate_label(&folded, &inner.reserved)?;
        Ok(folded)
    }

    /// Mint a random 8-hex-char label not currently claimed or reserved.
    pub fn generate_subdomain(&self) -> Result<String, SubdomainError> {
        let inner = self.inner.lock().unwrap();
        let mut rng = rand::thread_rng();
        for _ in 0..GENERATE_ATTEMPTS {
            let label = hex::encode(rng.gen::<[u8; 4]>());
            if !inner.by_subdomain.contains_key(&label) && !inner.reserved.contains(&label) {
                return Ok(label);
            }
        }
        Err(SubdomainError::PoolExhausted)
    }

    /// Swap in a new reserved set atomically. Defaults stay in force.
    pub fn reload_reserved(&self, extra: impl IntoIterator<Item = String>) {
        let mut reserved: HashSet<String> =
            DEFAULT_RESERVED.iter().map(|s| s.to_string()).collect();
        reserved.extend(extra.into_iter().map(|s| s.to_lowercase()));
        self.inner.lock().unwrap().reserved = reserved;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all active tunnels, for the admin surface.
    pub fn list(&self) -> Vec<Arc<Tunnel>> {
        self.inner.lock().unwrap().by_id.values().cloned().collect()
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let inner = self.inner.lock().unwrap();
        assert_eq!(inner.by_id.len(), inner.by_subdomain.len());
        for (sub, tunnel) in &inner.by_subdomain {
            let by_id = inner.by_id.get(&tunnel.id).expect("id index missing entry");
            assert_eq!(&by_id.subdomain, sub);
        }
        let session_total: usize = inner.by_session.values().map(Vec::len).sum();
        assert_eq!(session_total, inner.by_id.len());
    }
}

/// DNS-label grammar: 3-63 chars, lowercase alphanumeric with single
/// internal hyphens.
fn validate_label(label: &str, reserved: &HashSet<String>) -> Result<(), SubdomainError> {
    if label.len() < 3 || label.len() > 63 {
        return Err(SubdomainError::BadLength);
    }
    if !label
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(SubdomainError::InvalidCharacters);
    }
    if label.starts_with('-') || label.ends_with('-') {
        return Err(SubdomainError::EdgeHyphen);
    }
    if label.contains("--") {
        return Err(SubdomainError::DoubleHyphen);
    }
    if reserved.contains(label) {
        return Err(SubdomainError::Reserved(label.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TunnelRegistry {
        TunnelRegistry::new(["keepout".to_string()])
    }

    fn tunnel(subdomain: &str, session: Uuid) -> Tunnel {
        Tunnel::new(subdomain.to_string(), session, None, TunnelProtocol::Http)
    }

    #[test]
    fn test_register_and_lookup() {
        let reg = registry();
        let session = Uuid::new_v4();
        let t = reg.register(tunnel("demo", session)).unwrap();

        assert_eq!(reg.find_by_id(&t.id).unwrap().subdomain, "demo");
        assert_eq!(reg.find_by_subdomain("demo").unwrap().id, t.id);
        assert_eq!(reg.find_by_subdomain("DEMO").unwrap().id, t.id);
        assert_eq!(reg.len(), 1);
        reg.assert_consistent();
    }

    #[test]
    fn test_duplicate_subdomain_rejected() {
        let reg = registry();
        reg.register(tunnel("demo", Uuid::new_v4())).unwrap();
        let err = reg.register(tunnel("demo", Uuid::new_v4())).unwrap_err();
        assert!(matches!(err, SubdomainError::NotAvailable(_)));
        assert!(err.to_string().contains("not available"));
        assert_eq!(reg.len(), 1);
        reg.assert_consistent();
    }

    #[test]
    fn test_unregister_clears_all_indexes() {
        let reg = registry();
        let session = Uuid::new_v4();
        let t = reg.register(tunnel("demo", session)).unwrap();
        reg.register(tunnel("other", session)).unwrap();

        reg.unregister(&t.id);
        assert!(reg.find_by_subdomain("demo").is_none());
        assert!(reg.find_by_id(&t.id).is_none());
        assert_eq!(reg.unregister_session(session).len(), 1);
        assert!(reg.is_empty());
        reg.assert_consistent();
    }

    #[test]
    fn test_unregister_session_returns_all_tunnels() {
        let reg = registry();
        let session = Uuid::new_v4();
        reg.register(tunnel("one-a", session)).unwrap();
        reg.register(tunnel("two-b", session)).unwrap();
        reg.register(tunnel("kept", Uuid::new_v4())).unwrap();

        let removed = reg.unregister_session(session);
        assert_eq!(removed.len(), 2);
        assert_eq!(reg.len(), 1);
        assert!(reg.find_by_subdomain("kept").is_some());
        reg.assert_consistent();
    }

    #[test]
    fn test_validate_grammar() {
        let reg = registry();
        assert_eq!(reg.validate("My-App").unwrap(), "my-app");
        assert_eq!(reg.validate("abc").unwrap(), "abc");

        assert_eq!(reg.validate("ab").unwrap_err(), SubdomainError::BadLength);
        assert_eq!(
            reg.validate(&"a".repeat(64)).unwrap_err(),
            SubdomainError::BadLength
        );
        assert_eq!(
            reg.validate("under_score").unwrap_err(),
            SubdomainError::InvalidCharacters
        );
        assert_eq!(
            reg.validate("-edge").unwrap_err(),
            SubdomainError::EdgeHyphen
        );
        assert_eq!(
            reg.validate("edge-").unwrap_err(),
            SubdomainError::EdgeHyphen
        );
        assert_eq!(
            reg.validate("a--b").unwrap_err(),
            SubdomainError::DoubleHyphen
        );
    }

    #[test]
    fn test_reserved_labels_rejected() {
        let reg = registry();
        assert!(matches!(
            reg.validate("www").unwrap_err(),
            SubdomainError::Reserved(_)
        ));
        assert!(matches!(
            reg.validate("keepout").unwrap_err(),
            SubdomainError::Reserved(_)
        ));
        assert!(!reg.is_available("keepout"));
    }

    #[test]
    fn test_reload_reserved_is_atomic_swap() {
        let reg = registry();
        reg.reload_reserved(["fresh".to_string()]);
        assert!(reg.validate("keepout").is_ok());
        assert!(reg.validate("fresh").is_err());
        // Built-in defaults survive a reload
        assert!(reg.validate("www").is_err());
    }

    #[test]
    fn test_generate_subdomain_shape() {
        let reg = registry();
        let label = reg.generate_subdomain().unwrap();
        assert_eq!(label.len(), 8);
        assert!(label.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(reg.validate(&label).is_ok());
    }
}
