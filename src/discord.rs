//! The external API boundary: a trait with one method per mutation, and the
//! reqwest-backed client used in production.

use async_trait::async_trait;
use reqwest::{header::HeaderMap, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;

use crate::payload::{
    AssignRole, CreateChannel, CreateRole, DeleteChannel, DeleteRole, RemoveRole, UpdatePermissions,
};

/// Who a 429 applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    /// The whole bot identity. Repeated violations risk a ban.
    Global,
    /// A resource shared with other clients.
    Shared,
    /// This client's per-route bucket.
    User,
}

impl RateLimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitScope::Global => "global",
            RateLimitScope::Shared => "shared",
            RateLimitScope::User => "user",
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, RateLimitScope::Global)
    }
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitInfo {
    pub endpoint: String,
    pub scope: RateLimitScope,
    pub retry_after: Option<Duration>,
    pub bucket: Option<String>,
}

/// Errors returned by the external API client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DiscordError {
    #[error("Rate limited on {} ({} scope)", .0.endpoint, .0.scope)]
    RateLimited(RateLimitInfo),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },
}

/// One method per mutation type. Creating calls return the new resource id,
/// or `None` when the call succeeded but the id could not be read back.
#[async_trait]
pub trait DiscordClient: Send + Sync {
    async fn create_role(&self, req: &CreateRole) -> Result<Option<String>, DiscordError>;
    async fn delete_role(&self, req: &DeleteRole) -> Result<(), DiscordError>;
    async fn assign_role(&self, req: &AssignRole) -> Result<(), DiscordError>;
    async fn remove_role(&self, req: &RemoveRole) -> Result<(), DiscordError>;
    async fn create_channel(&self, req: &CreateChannel) -> Result<Option<String>, DiscordError>;
    async fn delete_channel(&self, req: &DeleteChannel) -> Result<(), DiscordError>;
    async fn update_permissions(&self, req: &UpdatePermissions) -> Result<(), DiscordError>;
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    #[serde(default)]
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
}

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

/// Longest server-requested back-off honoured.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

fn retry_after_hint(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs.min(MAX_RETRY_AFTER.as_secs_f64())).ok()
}

/// Maps a non-success response onto the error taxonomy.
pub fn classify_response(status: StatusCode, headers: &HeaderMap, body: &str, endpoint: &str) -> DiscordError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        let parsed: Option<RateLimitBody> = serde_json::from_str(body).ok();
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

        let global_flag = parsed.as_ref().map(|b| b.global).unwrap_or(false)
            || header("x-ratelimit-global").is_some_and(|v| v.eq_ignore_ascii_case("true"));
        let scope = match header("x-ratelimit-scope") {
            _ if global_flag => RateLimitScope::Global,
            Some(s) if s.eq_ignore_ascii_case("global") => RateLimitScope::Global,
            Some(s) if s.eq_ignore_ascii_case("shared") => RateLimitScope::Shared,
            _ => RateLimitScope::User,
        };

        let retry_after = parsed
            .and_then(|b| b.retry_after)
            .or_else(|| header("retry-after").and_then(|v| v.parse::<f64>().ok()))
            .and_then(retry_after_hint);

        return DiscordError::RateLimited(RateLimitInfo {
            endpoint: endpoint.to_string(),
            scope,
            retry_after,
            bucket: header("x-ratelimit-bucket").map(str::to_string),
        });
    }

    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());

    match status {
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => DiscordError::Forbidden(message),
        StatusCode::NOT_FOUND => DiscordError::NotFound(message),
        s if s.is_server_error() => DiscordError::ServerError {
            status: s.as_u16(),
            message,
        },
        s => DiscordError::Rejected {
            status: s.as_u16(),
            message,
        },
    }
}

/// REST client for the Discord HTTP API.
pub struct HttpDiscordClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpDiscordClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, DiscordError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("synthesis/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DiscordError::TransientNetwork(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// `endpoint` is the route template used as the metrics label.
    async fn send(
        &self,
        method: Method,
        path: &str,
        endpoint: &str,
        body: Option<Value>,
        reason: Option<&str>,
    ) -> Result<Option<String>, DiscordError> {
        let mut request = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header("Authorization", format!("Bot {}", self.token));

        if let Some(reason) = reason {
            request = request.header("X-Audit-Log-Reason", reason);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DiscordError::TransientNetwork(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();

        if status.is_success() {
            tracing::debug!(endpoint, status = status.as_u16(), "Discord call succeeded");
            // The mutation is applied once the status arrives; a broken body
            // must not turn into a retry that applies it again.
            return match response.text().await {
                Ok(text) if text.is_empty() => Ok(None),
                Ok(text) => Ok(Some(text)),
                Err(e) => {
                    tracing::warn!(endpoint, error = %e, "Applied but the response body was lost");
                    Ok(None)
                }
            };
        }

        let text = response.text().await.unwrap_or_default();
        Err(classify_response(status, &headers, &text, endpoint))
    }

    /// Id of the created resource, if the success body carries one.
    fn created_id(body: Option<String>, endpoint: &str) -> Option<String> {
        let body = body?;
        match serde_json::from_str::<Created>(&body) {
            Ok(created) => Some(created.id),
            Err(e) => {
                tracing::warn!(endpoint, error = %e, "Applied but the created id is unreadable");
                None
            }
        }
    }
}

#[async_trait]
impl DiscordClient for HttpDiscordClient {
    async fn create_role(&self, req: &CreateRole) -> Result<Option<String>, DiscordError> {
        let mut body = json!({
            "name": req.name,
            "hoist": req.hoist,
            "mentionable": req.mentionable,
        });
        if let Some(permissions) = &req.permissions {
            body["permissions"] = json!(permissions);
        }
        if let Some(color) = req.color {
            body["color"] = json!(color);
        }

        let created = self
            .send(
                Method::POST,
                &format!("/guilds/{}/roles", req.guild_id),
                "POST /guilds/:id/roles",
                Some(body),
                req.reason.as_deref(),
            )
            .await?;
        Ok(Self::created_id(created, "POST /guilds/:id/roles"))
    }

    async fn delete_role(&self, req: &DeleteRole) -> Result<(), DiscordError> {
        self.send(
            Method::DELETE,
            &format!("/guilds/{}/roles/{}", req.guild_id, req.role_id),
            "DELETE /guilds/:id/roles/:id",
            None,
            req.reason.as_deref(),
        )
        .await
        .map(|_| ())
    }

    async fn assign_role(&self, req: &AssignRole) -> Result<(), DiscordError> {
        self.send(
            Method::PUT,
            &format!("/guilds/{}/members/{}/roles/{}", req.guild_id, req.user_id, req.role_id),
            "PUT /guilds/:id/members/:id/roles/:id",
            None,
            req.reason.as_deref(),
        )
        .await
        .map(|_| ())
    }

    async fn remove_role(&self, req: &RemoveRole) -> Result<(), DiscordError> {
        self.send(
            Method::DELETE,
            &format!("/guilds/{}/members/{}/roles/{}", req.guild_id, req.user_id, req.role_id),
            "DELETE /guilds/:id/members/:id/roles/:id",
            None,
            req.reason.as_deref(),
        )
        .await
        .map(|_| ())
    }

    async fn create_channel(&self, req: &CreateChannel) -> Result<Option<String>, DiscordError> {
        let mut body = json!({
            "name": req.name,
            "type": req.kind.code(),
        });
        if let Some(parent) = &req.parent_id {
            body["parent_id"] = json!(parent);
        }
        if let Some(topic) = &req.topic {
            body["topic"] = json!(topic);
        }

        let created = self
            .send(
                Method::POST,
                &format!("/guilds/{}/channels", req.guild_id),
                "POST /guilds/:id/channels",
                Some(body),
                req.reason.as_deref(),
            )
            .await?;
        Ok(Self::created_id(created, "POST /guilds/:id/channels"))
    }

    async fn delete_channel(&self, req: &DeleteChannel) -> Result<(), DiscordError> {
        self.send(
            Method::DELETE,
            &format!("/channels/{}", req.channel_id),
            "DELETE /channels/:id",
            None,
            req.reason.as_deref(),
        )
        .await
        .map(|_| ())
    }

    async fn update_permissions(&self, req: &UpdatePermissions) -> Result<(), DiscordError> {
        let body = json!({
            "allow": req.allow,
            "deny": req.deny,
            "type": req.target.code(),
        });

        self.send(
            Method::PUT,
            &format!("/channels/{}/permissions/{}", req.channel_id, req.target_id),
            "PUT /channels/:id/permissions/:id",
            Some(body),
            req.reason.as_deref(),
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    const ENDPOINT: &str = "PUT /guilds/:id/members/:id/roles/:id";

    #[test]
    fn test_global_flag_in_body() {
        let body = r#"{"message":"You are being rate limited.","retry_after":1.5,"global":true}"#;
        match classify_response(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), body, ENDPOINT) {
            DiscordError::RateLimited(info) => {
                assert_eq!(info.scope, RateLimitScope::Global);
                assert_eq!(info.retry_after, Some(Duration::from_millis(1500)));
                assert_eq!(info.endpoint, ENDPOINT);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_scope_header_and_retry_after_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-scope", HeaderValue::from_static("shared"));
        headers.insert("retry-after", HeaderValue::from_static("3"));
        headers.insert("x-ratelimit-bucket", HeaderValue::from_static("abcd1234"));

        match classify_response(StatusCode::TOO_MANY_REQUESTS, &headers, "", ENDPOINT) {
            DiscordError::RateLimited(info) => {
                assert_eq!(info.scope, RateLimitScope::Shared);
                assert_eq!(info.retry_after, Some(Duration::from_secs(3)));
                assert_eq!(info.bucket.as_deref(), Some("abcd1234"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_unscoped_429_is_per_route() {
        let body = r#"{"retry_after":0.25,"global":false}"#;
        match classify_response(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), body, ENDPOINT) {
            DiscordError::RateLimited(info) => assert_eq!(info.scope, RateLimitScope::User),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_status_mapping() {
        let headers = HeaderMap::new();
        let body = r#"{"message":"Missing Permissions","code":50013}"#;
        assert!(matches!(
            classify_response(StatusCode::FORBIDDEN, &headers, body, ENDPOINT),
            DiscordError::Forbidden(msg) if msg == "Missing Permissions"
        ));
        assert!(matches!(
            classify_response(StatusCode::NOT_FOUND, &headers, "", ENDPOINT),
            DiscordError::NotFound(_)
        ));
        assert!(matches!(
            classify_response(StatusCode::BAD_GATEWAY, &headers, "", ENDPOINT),
            DiscordError::ServerError { status: 502, .. }
        ));
        assert!(matches!(
            classify_response(StatusCode::BAD_REQUEST, &headers, "{}", ENDPOINT),
            DiscordError::Rejected { status: 400, .. }
        ));
    }

    #[test]
    fn test_huge_retry_after_is_clamped() {
        let body = r#"{"message":"You are being rate limited.","retry_after":1e20,"global":false}"#;
        match classify_response(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), body, ENDPOINT) {
            DiscordError::RateLimited(info) => assert_eq!(info.retry_after, Some(MAX_RETRY_AFTER)),
            other => panic!("unexpected: {other:?}"),
        }

        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("-5"));
        match classify_response(StatusCode::TOO_MANY_REQUESTS, &headers, "", ENDPOINT) {
            DiscordError::RateLimited(info) => assert_eq!(info.retry_after, None),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_created_id_from_success_body() {
        let endpoint = "POST /guilds/:id/roles";
        assert_eq!(
            HttpDiscordClient::created_id(Some(r#"{"id":"200000000000000001","name":"mods"}"#.into()), endpoint),
            Some("200000000000000001".to_string())
        );
        // applied, but nothing usable came back: no id, and no error to retry on
        assert_eq!(HttpDiscordClient::created_id(Some("<html>oops".into()), endpoint), None);
        assert_eq!(HttpDiscordClient::created_id(None, endpoint), None);
    }
}
