use bytes::Bytes;
use serde::Serialize;
use std::borrow::Cow;
use std::fmt;
use std::sync::OnceLock;

/// Gateway error envelope written to clients as JSON.
///
/// The envelope is `{"code", "message", "details"?, "request_id"?}` with
/// `Content-Type: application/json`. A fixed set of hot-path statuses keep a
/// pre-serialized body so rejection paths (404, 429, ...) do not allocate per
/// request; `with_details` / `with_request_id` produce owned values that
/// serialize on demand.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: u16,
    pub message: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// (status, canonical message) for every pre-serialized singleton.
const SINGLETONS: &[(u16, &str)] = &[
    (400, "bad request"),
    (401, "unauthorized"),
    (403, "forbidden"),
    (404, "not found"),
    (405, "method not allowed"),
    (413, "payload too large"),
    (429, "too many requests"),
    (500, "internal server error"),
    (502, "bad gateway"),
    (503, "service unavailable"),
    (504, "gateway timeout"),
];

fn prerendered(code: u16) -> Option<&'static Bytes> {
    static BODIES: OnceLock<Vec<(u16, Bytes)>> = OnceLock::new();
    let bodies = BODIES.get_or_init(|| {
        SINGLETONS
            .iter()
            .map(|(code, message)| {
                let body = serde_json::to_vec(&ApiError {
                    code: *code,
                    message: Cow::Borrowed(*message),
                    details: None,
                    request_id: None,
                })
                .expect("singleton envelope serializes");
                (*code, Bytes::from(body))
            })
            .collect()
    });
    bodies.iter().find(|(c, _)| *c == code).map(|(_, b)| b)
}

impl ApiError {
    pub fn new(code: u16, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            request_id: None,
        }
    }

    pub fn bad_request() -> Self {
        Self::singleton(400)
    }

    pub fn unauthorized() -> Self {
        Self::singleton(401)
    }

    pub fn forbidden() -> Self {
        Self::singleton(403)
    }

    pub fn not_found() -> Self {
        Self::singleton(404)
    }

    pub fn method_not_allowed() -> Self {
        Self::singleton(405)
    }

    pub fn payload_too_large() -> Self {
        Self::singleton(413)
    }

    pub fn too_many_requests() -> Self {
        Self::singleton(429)
    }

    pub fn internal() -> Self {
        Self::singleton(500)
    }

    pub fn bad_gateway() -> Self {
        Self::singleton(502)
    }

    pub fn service_unavailable() -> Self {
        Self::singleton(503)
    }

    pub fn gateway_timeout() -> Self {
        Self::singleton(504)
    }

    fn singleton(code: u16) -> Self {
        let message = SINGLETONS
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, m)| *m)
            .unwrap_or("error");
        Self {
            code,
            message: Cow::Borrowed(message),
            details: None,
            request_id: None,
        }
    }

    /// Attach human-readable detail. The result no longer uses the
    /// pre-serialized fast path.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Serialize the envelope. Singleton values without details or request id
    /// return the shared pre-serialized bytes.
    pub fn to_body(&self) -> Bytes {
        if self.details.is_none() && self.request_id.is_none() {
            if let Some(body) = prerendered(self.code) {
                if SINGLETONS
                    .iter()
                    .any(|(c, m)| *c == self.code && *m == self.message)
                {
                    return body.clone();
                }
            }
        }
        match serde_json::to_vec(self) {
            Ok(body) => Bytes::from(body),
            Err(_) => Bytes::from_static(b"{\"code\":500,\"message\":\"internal server error\"}"),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.details {
            Some(details) => write!(f, "{} {}: {}", self.code, self.message, details),
            None => write!(f, "{} {}", self.code, self.message),
        }
    }
}

impl std::error::Error for ApiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singleton_matches_dynamic_serialization() {
        for (code, message) in SINGLETONS {
            let singleton = ApiError::singleton(*code);
            let dynamic = serde_json::to_vec(&ApiError {
                code: *code,
                message: Cow::Borrowed(*message),
                details: None,
                request_id: None,
            })
            .unwrap();
            assert_eq!(singleton.to_body().as_ref(), dynamic.as_slice());
        }
    }

    #[test]
    fn test_singleton_body_is_shared() {
        let a = ApiError::too_many_requests().to_body();
        let b = ApiError::too_many_requests().to_body();
        // Bytes clones of the same prerendered body share the backing allocation.
        assert_eq!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn test_details_bypass_fast_path() {
        let plain = ApiError::not_found().to_body();
        let detailed = ApiError::not_found().with_details("no such route").to_body();
        assert_ne!(plain, detailed);

        let value: serde_json::Value = serde_json::from_slice(&detailed).unwrap();
        assert_eq!(value["code"], 404);
        assert_eq!(value["message"], "not found");
        assert_eq!(value["details"], "no such route");
        assert!(value.get("request_id").is_none());
    }

    #[test]
    fn test_request_id_round_trip() {
        let body = ApiError::bad_gateway().with_request_id("req-123").to_body();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["request_id"], "req-123");
    }

    #[test]
    fn test_custom_error() {
        let body = ApiError::new(418, "short and stout").to_body();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["code"], 418);
        assert_eq!(value["message"], "short and stout");
    }
}
