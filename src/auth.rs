use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Role name of the least privileged tier.
pub const ROLE_USER: &str = "user";

/// Verified caller as supplied by the surrounding auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: String,
    #[serde(default)]
    pub location: Option<String>,
}

impl CallerIdentity {
    pub fn is_least_privileged(&self) -> bool {
        self.role == ROLE_USER
    }

    /// Identity block attached to payloads bound for pipeline models.
    pub fn envelope(&self) -> Value {
        json!({
            "name": self.name,
            "id": self.id,
            "email": self.email,
            "role": self.role,
        })
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "email": self.email,
            "role": self.role,
            "info": { "location": self.location },
        })
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    async fn verify(&self, headers: &HeaderMap) -> Option<CallerIdentity>;
}

/// Trusts identity headers injected by an authenticating reverse proxy.
#[derive(Debug, Clone, Default)]
pub struct TrustedHeaderIdentity;

pub const HEADER_USER_ID: &str = "x-user-id";
pub const HEADER_USER_NAME: &str = "x-user-name";
pub const HEADER_USER_EMAIL: &str = "x-user-email";
pub const HEADER_USER_ROLE: &str = "x-user-role";
pub const HEADER_USER_LOCATION: &str = "x-user-location";

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl IdentityProvider for TrustedHeaderIdentity {
    async fn verify(&self, headers: &HeaderMap) -> Option<CallerIdentity> {
        let id = header_str(headers, HEADER_USER_ID)?;
        Some(CallerIdentity {
            name: header_str(headers, HEADER_USER_NAME).unwrap_or_else(|| id.clone()),
            email: header_str(headers, HEADER_USER_EMAIL).unwrap_or_default(),
            role: header_str(headers, HEADER_USER_ROLE).unwrap_or_else(|| ROLE_USER.to_string()),
            location: header_str(headers, HEADER_USER_LOCATION),
            id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn trusted_headers_require_user_id() {
        let provider = TrustedHeaderIdentity;
        let mut headers = HeaderMap::new();
        assert!(provider.verify(&headers).await.is_none());

        headers.insert(HEADER_USER_ID, HeaderValue::from_static("u-1"));
        headers.insert(HEADER_USER_ROLE, HeaderValue::from_static("admin"));
        headers.insert(HEADER_USER_LOCATION, HeaderValue::from_static("Lyon"));
        let caller = provider.verify(&headers).await.unwrap();
        assert_eq!(caller.name, "u-1");
        assert_eq!(caller.role, "admin");
        assert_eq!(caller.location.as_deref(), Some("Lyon"));
        assert!(!caller.is_least_privileged());
    }

    #[test]
    fn envelope_carries_only_identity_fields() {
        let caller = CallerIdentity {
            id: "u-2".into(),
            name: "Ada".into(),
            email: "ada@example.com".into(),
            role: "user".into(),
            location: Some("London".into()),
        };
        let envelope = caller.envelope();
        assert_eq!(envelope["email"], "ada@example.com");
        assert!(envelope.get("location").is_none());
        assert!(caller.is_least_privileged());
    }
}
