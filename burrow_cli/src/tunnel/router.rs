//! Local path routing
//!
//! An ordered list of glob patterns mapping request paths to local
//! targets; the first match wins and a configured default catches the
//! rest. Purely functional - the tunnel client consults it per request.

use glob::Pattern;

#[derive(Debug, Clone)]
struct Route {
    pattern: Pattern,
    host: String,
    port: u16,
}

/// First-match-wins path router with a default fallback target.
#[derive(Debug, Clone)]
pub struct PathRouter {
    routes: Vec<Route>,
    default_host: String,
    default_port: u16,
}

impl PathRouter {
    pub fn new(default_host: impl Into<String>, default_port: u16) -> Self {
        Self {
            routes: Vec::new(),
            default_host: default_host.into(),
            default_port,
        }
    }

    /// Append a route. Order of insertion is match order.
    pub fn add(
        &mut self,
        pattern: &str,
        host: impl Into<String>,
        port: u16,
    ) -> Result<(), glob::PatternError> {
        self.routes.push(Route {
            pattern: Pattern::new(pattern)?,
            host: host.into(),
            port,
        });
        Ok(())
    }

    /// Resolve a request path (query string ignored) to `(host, port)`.
    pub fn target(&self, path: &str) -> (&str, u16) {
        let path = path.split('?').next().unwrap_or(path);
        for route in &self.routes {
            if route.pattern.matches(path) {
                return (&route.host, route.port);
            }
        }
        (&self.default_host, self.default_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> PathRouter {
        let mut router = PathRouter::new("localhost", 3000);
        router.add("/api/*", "localhost", 4000).unwrap();
        router.add("/ws", "localhost", 5000).unwrap();
        router.add("/*", "localhost", 3001).unwrap();
        router
    }

    #[test]
    fn test_first_match_wins() {
        let router = router();
        assert_eq!(router.target("/api/users"), ("localhost", 4000));
        assert_eq!(router.target("/api/deep/nested/path"), ("localhost", 4000));
        assert_eq!(router.target("/ws"), ("localhost", 5000));
    }

    #[test]
    fn test_terminal_wildcard_catches_all() {
        let router = router();
        assert_eq!(router.target("/anything"), ("localhost", 3001));
        assert_eq!(router.target("/deep/path/here"), ("localhost", 3001));
    }

    #[test]
    fn test_query_string_ignored() {
        let router = router();
        assert_eq!(router.target("/api/users?id=1"), ("localhost", 4000));
    }

    #[test]
    fn test_no_match_falls_back_to_default() {
        let mut router = PathRouter::new("upstream", 9000);
        router.add("/only-this", "localhost", 1234).unwrap();
        assert_eq!(router.target("/something-else"), ("upstream", 9000));
        assert_eq!(router.target("/only-this"), ("localhost", 1234));
    }

    #[test]
    fn test_empty_router_always_default() {
        let router = PathRouter::new("localhost", 8080);
        assert_eq!(router.target("/"), ("localhost", 8080));
        assert_eq!(router.target("/x/y"), ("localhost", 8080));
    }
}
