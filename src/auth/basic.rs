use super::{AuthError, Identity};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::HeaderMap;
use std::collections::HashMap;

/// HTTP Basic authentication against a static credential table.
pub struct BasicAuthenticator {
    users: HashMap<String, String>,
}

impl BasicAuthenticator {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, AuthError> {
        let header = headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Basic "))
            .ok_or_else(|| AuthError::InvalidCredentials("missing basic credentials".into()))?;

        let decoded = BASE64
            .decode(header.trim())
            .map_err(|_| AuthError::InvalidCredentials("bad basic encoding".into()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| AuthError::InvalidCredentials("bad basic encoding".into()))?;
        let (user, password) = decoded
            .split_once(':')
            .ok_or_else(|| AuthError::InvalidCredentials("bad basic format".into()))?;

        let valid = self
            .users
            .get(user)
            .map(|expected| constant_time_eq(expected.as_bytes(), password.as_bytes()))
            .unwrap_or(false);

        if !valid {
            return Err(AuthError::InvalidCredentials("bad credentials".into()));
        }
        Ok(Identity::new(user, "basic"))
    }
}

/// Length-leaking but content-constant comparison; enough to keep password
/// byte content off the timing side channel.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> BasicAuthenticator {
        BasicAuthenticator::new(HashMap::from([("alice".to_string(), "s3cret".to_string())]))
    }

    fn basic_header(user: &str, password: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            format!("Basic {}", BASE64.encode(format!("{}:{}", user, password)))
                .parse()
                .unwrap(),
        );
        headers
    }

    #[test]
    fn test_valid_credentials() {
        let identity = authenticator()
            .authenticate(&basic_header("alice", "s3cret"))
            .unwrap();
        assert_eq!(identity.client_id, "alice");
        assert_eq!(identity.auth_type, "basic");
    }

    #[test]
    fn test_wrong_password() {
        let err = authenticator()
            .authenticate(&basic_header("alice", "wrong"))
            .unwrap_err();
        assert_eq!(err.status(), 401);
    }

    #[test]
    fn test_unknown_user() {
        let err = authenticator()
            .authenticate(&basic_header("bob", "s3cret"))
            .unwrap_err();
        assert_eq!(err.status(), 401);
    }

    #[test]
    fn test_missing_header() {
        let err = authenticator().authenticate(&HeaderMap::new()).unwrap_err();
        assert_eq!(err.status(), 401);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
