use axum::http::{header::AUTHORIZATION, HeaderMap};

/// Header peers may use instead of `Authorization: Bearer`.
pub const DEVICE_TOKEN_HEADER: &str = "x-device-token";

/// Checks the per-machine bearer token presented by peers and clients.
#[derive(Clone)]
pub struct AuthManager {
    token: String,
}

impl AuthManager {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Accept `Authorization: Bearer <token>`, `X-Device-Token`, or (for
    /// event streams opened by browsers) a `token` query parameter.
    pub fn validate(&self, headers: &HeaderMap, query_token: Option<&str>) -> bool {
        let bearer = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(|raw| {
                let raw = raw.trim();
                raw.strip_prefix("Bearer ")
                    .or_else(|| raw.strip_prefix("bearer "))
                    .unwrap_or(raw)
                    .trim()
            });
        let device_token = headers
            .get(DEVICE_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim);

        [bearer, device_token, query_token.map(str::trim)]
            .into_iter()
            .flatten()
            .any(|candidate| !candidate.is_empty() && candidate == self.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn accepts_each_token_carrier() {
        let auth = AuthManager::new("s3cret");

        let mut bearer = HeaderMap::new();
        bearer.insert(AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        assert!(auth.validate(&bearer, None));

        let mut device = HeaderMap::new();
        device.insert(DEVICE_TOKEN_HEADER, HeaderValue::from_static("s3cret"));
        assert!(auth.validate(&device, None));

        assert!(auth.validate(&HeaderMap::new(), Some("s3cret")));
    }

    #[test]
    fn rejects_missing_or_wrong_token() {
        let auth = AuthManager::new("s3cret");
        assert!(!auth.validate(&HeaderMap::new(), None));
        assert!(!auth.validate(&HeaderMap::new(), Some("")));

        let mut wrong = HeaderMap::new();
        wrong.insert(AUTHORIZATION, HeaderValue::from_static("Bearer nope"));
        assert!(!auth.validate(&wrong, None));
    }
}
