//! IP allow/deny lists and shared-secret header checks.

use std::collections::HashSet;
use std::net::IpAddr;

use infermesh_config::AccessControlConfig;

/// Static access-control policy evaluated before any rate limiting.
pub struct AccessControl {
    allow: HashSet<IpAddr>,
    deny: HashSet<IpAddr>,
    token_header: Option<String>,
    token_value: Option<String>,
}

impl AccessControl {
    pub fn new(cfg: &AccessControlConfig) -> Self {
        Self {
            allow: cfg.allow_ips.iter().filter_map(|s| s.parse().ok()).collect(),
            deny: cfg.deny_ips.iter().filter_map(|s| s.parse().ok()).collect(),
            token_header: cfg.token_header.clone(),
            token_value: cfg.token_value.clone(),
        }
    }

    /// Evaluate the policy. `token` is the value of the configured
    /// header on the request, when present.
    pub fn check(&self, client: IpAddr, token: Option<&str>) -> bool {
        if self.deny.contains(&client) {
            return false;
        }
        if !self.allow.is_empty() && !self.allow.contains(&client) {
            return false;
        }
        if let (Some(_), Some(expected)) = (&self.token_header, &self.token_value) {
            match token {
                Some(v) if v == expected => {}
                _ => return false,
            }
        }
        true
    }

    pub fn token_header(&self) -> Option<&str> {
        self.token_header.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn deny_list_wins() {
        let ac = AccessControl::new(&AccessControlConfig {
            allow_ips: vec![],
            deny_ips: vec!["10.0.0.5".into()],
            token_header: None,
            token_value: None,
        });
        assert!(!ac.check(ip("10.0.0.5"), None));
        assert!(ac.check(ip("10.0.0.6"), None));
    }

    #[test]
    fn allow_list_restricts() {
        let ac = AccessControl::new(&AccessControlConfig {
            allow_ips: vec!["192.168.1.1".into()],
            deny_ips: vec![],
            token_header: None,
            token_value: None,
        });
        assert!(ac.check(ip("192.168.1.1"), None));
        assert!(!ac.check(ip("192.168.1.2"), None));
    }

    #[test]
    fn token_must_match() {
        let ac = AccessControl::new(&AccessControlConfig {
            allow_ips: vec![],
            deny_ips: vec![],
            token_header: Some("X-Proxy-Token".into()),
            token_value: Some("s3cret".into()),
        });
        assert!(ac.check(ip("1.2.3.4"), Some("s3cret")));
        assert!(!ac.check(ip("1.2.3.4"), Some("wrong")));
        assert!(!ac.check(ip("1.2.3.4"), None));
    }
}
