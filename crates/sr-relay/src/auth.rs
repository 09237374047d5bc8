//! Admission checks for agent upgrade requests
//!
//! With the default configuration every agent is admitted: no token is
//! required and any `Origin` is accepted. Both checks are opt-in.

use axum::http::{header, HeaderMap, StatusCode};
use sha2::{Digest, Sha256};

use sr_core::config::RelayConfig;

/// Why an upgrade request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    /// Missing or wrong bearer token
    Unauthorized,
    /// `Origin` header not in the allow-list
    ForbiddenOrigin,
}

impl Denial {
    /// HTTP status sent back for this denial
    pub fn status(&self) -> StatusCode {
        match self {
            Denial::Unauthorized => StatusCode::UNAUTHORIZED,
            Denial::ForbiddenOrigin => StatusCode::FORBIDDEN,
        }
    }
}

/// Token and origin policy applied before the upgrade
#[derive(Debug, Default)]
pub struct AccessPolicy {
    /// SHA-256 of the expected bearer token
    token_digest: Option<[u8; 32]>,
    /// Allowed origins; `None` accepts any
    origins: Option<Vec<String>>,
}

impl AccessPolicy {
    /// Build the policy from relay configuration
    pub fn from_config(config: &RelayConfig) -> Self {
        let origins = if config.allowed_origins.iter().any(|o| o == "*") {
            None
        } else {
            Some(config.allowed_origins.clone())
        };

        Self {
            token_digest: config.auth_token.as_deref().map(digest),
            origins,
        }
    }

    /// Whether agents must present a token
    pub fn requires_token(&self) -> bool {
        self.token_digest.is_some()
    }

    /// Check an upgrade request's headers
    pub fn check(&self, headers: &HeaderMap) -> Result<(), Denial> {
        if let Some(expected) = &self.token_digest {
            let presented = headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|token| digest(token.trim()));

            if presented.as_ref() != Some(expected) {
                return Err(Denial::Unauthorized);
            }
        }

        if let Some(origins) = &self.origins {
            // Non-browser agents send no Origin at all
            if let Some(origin) = headers.get(header::ORIGIN) {
                let origin = origin.to_str().map_err(|_| Denial::ForbiddenOrigin)?;
                if !origins.iter().any(|allowed| allowed.eq_ignore_ascii_case(origin)) {
                    return Err(Denial::ForbiddenOrigin);
                }
            }
        }

        Ok(())
    }
}

/// Compare tokens through fixed-size digests rather than the raw strings
fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_default_policy_admits_everyone() {
        let policy = AccessPolicy::from_config(&RelayConfig::default());
        assert!(!policy.requires_token());
        assert_eq!(policy.check(&HeaderMap::new()), Ok(()));
        assert_eq!(
            policy.check(&headers(&[(header::ORIGIN, "https://evil.example")])),
            Ok(())
        );
    }

    #[test]
    fn test_token_required_when_configured() {
        let config = RelayConfig {
            auth_token: Some("hunter2".to_string()),
            ..RelayConfig::default()
        };
        let policy = AccessPolicy::from_config(&config);

        assert_eq!(policy.check(&HeaderMap::new()), Err(Denial::Unauthorized));
        assert_eq!(
            policy.check(&headers(&[(header::AUTHORIZATION, "Bearer wrong")])),
            Err(Denial::Unauthorized)
        );
        assert_eq!(
            policy.check(&headers(&[(header::AUTHORIZATION, "hunter2")])),
            Err(Denial::Unauthorized)
        );
        assert_eq!(
            policy.check(&headers(&[(header::AUTHORIZATION, "Bearer hunter2")])),
            Ok(())
        );
    }

    #[test]
    fn test_origin_allow_list() {
        let config = RelayConfig {
            allowed_origins: vec!["https://app.example.com".to_string()],
            ..RelayConfig::default()
        };
        let policy = AccessPolicy::from_config(&config);

        assert_eq!(policy.check(&HeaderMap::new()), Ok(()));
        assert_eq!(
            policy.check(&headers(&[(header::ORIGIN, "https://app.example.com")])),
            Ok(())
        );
        assert_eq!(
            policy.check(&headers(&[(header::ORIGIN, "https://other.example.com")])),
            Err(Denial::ForbiddenOrigin)
        );
        assert_eq!(Denial::ForbiddenOrigin.status(), StatusCode::FORBIDDEN);
    }
}
