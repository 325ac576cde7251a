//! Mutation handlers: payload in, normalized outcome out.
//!
//! Handlers only talk to the injected client. Queueing, token acquisition and
//! idempotency belong to the worker.

use std::sync::Arc;
use std::time::Duration;

use crate::discord::{DiscordClient, DiscordError, RateLimitInfo};
use crate::payload::{
    AssignRole, CreateChannel, CreateRole, DeleteChannel, DeleteRole, JobPayload, RemoveRole,
    UpdatePermissions,
};

/// Label used for `synthesis_jobs_failed_total{reason}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    RateLimited,
    Forbidden,
    NotFound,
    Rejected,
    Network,
    ServerError,
    TokenTimeout,
    StoreUnavailable,
    Interrupted,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::RateLimited => "rate_limited",
            FailureReason::Forbidden => "forbidden",
            FailureReason::NotFound => "not_found",
            FailureReason::Rejected => "rejected",
            FailureReason::Network => "network",
            FailureReason::ServerError => "server_error",
            FailureReason::TokenTimeout => "token_timeout",
            FailureReason::StoreUnavailable => "store_unavailable",
            FailureReason::Interrupted => "interrupted",
        }
    }
}

/// What a successful handler applied. Creating mutations report the new id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppliedEffect {
    pub effect_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandlerError {
    pub reason: FailureReason,
    pub retryable: bool,
    pub retry_after: Option<Duration>,
    pub rate_limit: Option<RateLimitInfo>,
    pub message: String,
}

impl HandlerError {
    pub fn transient(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            retryable: true,
            retry_after: None,
            rate_limit: None,
            message: message.into(),
        }
    }

    pub fn terminal(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            retryable: false,
            retry_after: None,
            rate_limit: None,
            message: message.into(),
        }
    }

    /// `reason: message` as stored on the job record.
    pub fn describe(&self) -> String {
        format!("{}: {}", self.reason.as_str(), self.message)
    }
}

impl From<DiscordError> for HandlerError {
    fn from(err: DiscordError) -> Self {
        let message = err.to_string();
        match err {
            DiscordError::RateLimited(info) => Self {
                reason: FailureReason::RateLimited,
                retryable: true,
                retry_after: info.retry_after,
                rate_limit: Some(info),
                message,
            },
            DiscordError::Forbidden(_) => Self::terminal(FailureReason::Forbidden, message),
            DiscordError::NotFound(_) => Self::terminal(FailureReason::NotFound, message),
            DiscordError::Rejected { .. } => Self::terminal(FailureReason::Rejected, message),
            DiscordError::TransientNetwork(_) => Self::transient(FailureReason::Network, message),
            DiscordError::ServerError { .. } => Self::transient(FailureReason::ServerError, message),
        }
    }
}

pub type HandlerOutcome = Result<AppliedEffect, HandlerError>;

pub async fn create_role(client: &dyn DiscordClient, payload: &CreateRole) -> HandlerOutcome {
    let role_id = client.create_role(payload).await?;
    Ok(AppliedEffect { effect_id: role_id })
}

pub async fn delete_role(client: &dyn DiscordClient, payload: &DeleteRole) -> HandlerOutcome {
    client.delete_role(payload).await?;
    Ok(AppliedEffect {
        effect_id: Some(payload.role_id.clone()),
    })
}

pub async fn assign_role(client: &dyn DiscordClient, payload: &AssignRole) -> HandlerOutcome {
    client.assign_role(payload).await?;
    Ok(AppliedEffect::default())
}

pub async fn remove_role(client: &dyn DiscordClient, payload: &RemoveRole) -> HandlerOutcome {
    client.remove_role(payload).await?;
    Ok(AppliedEffect::default())
}

pub async fn create_channel(client: &dyn DiscordClient, payload: &CreateChannel) -> HandlerOutcome {
    let channel_id = client.create_channel(payload).await?;
    Ok(AppliedEffect { effect_id: channel_id })
}

pub async fn delete_channel(client: &dyn DiscordClient, payload: &DeleteChannel) -> HandlerOutcome {
    client.delete_channel(payload).await?;
    Ok(AppliedEffect {
        effect_id: Some(payload.channel_id.clone()),
    })
}

pub async fn update_permissions(
    client: &dyn DiscordClient,
    payload: &UpdatePermissions,
) -> HandlerOutcome {
    client.update_permissions(payload).await?;
    Ok(AppliedEffect::default())
}

/// Dispatches a payload to its handler.
#[derive(Clone)]
pub struct MutationHandlers {
    client: Arc<dyn DiscordClient>,
}

impl MutationHandlers {
    pub fn new(client: Arc<dyn DiscordClient>) -> Self {
        Self { client }
    }

    pub async fn execute(&self, payload: &JobPayload) -> HandlerOutcome {
        let client = self.client.as_ref();
        match payload {
            JobPayload::CreateRole(p) => create_role(client, p).await,
            JobPayload::DeleteRole(p) => delete_role(client, p).await,
            JobPayload::AssignRole(p) => assign_role(client, p).await,
            JobPayload::RemoveRole(p) => remove_role(client, p).await,
            JobPayload::CreateChannel(p) => create_channel(client, p).await,
            JobPayload::DeleteChannel(p) => delete_channel(client, p).await,
            JobPayload::UpdatePermissions(p) => update_permissions(client, p).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discord::RateLimitScope;

    #[test]
    fn test_rate_limit_is_retryable_with_hint() {
        let err: HandlerError = DiscordError::RateLimited(RateLimitInfo {
            endpoint: "POST /guilds/:id/roles".into(),
            scope: RateLimitScope::Global,
            retry_after: Some(Duration::from_secs(2)),
            bucket: None,
        })
        .into();

        assert!(err.retryable);
        assert_eq!(err.reason, FailureReason::RateLimited);
        assert_eq!(err.retry_after, Some(Duration::from_secs(2)));
        assert!(err.rate_limit.unwrap().scope.is_global());
    }

    #[test]
    fn test_permission_and_missing_resources_are_terminal() {
        let forbidden: HandlerError = DiscordError::Forbidden("Missing Access".into()).into();
        let missing: HandlerError = DiscordError::NotFound("Unknown Role".into()).into();
        let rejected: HandlerError = DiscordError::Rejected {
            status: 400,
            message: "Invalid Form Body".into(),
        }
        .into();

        assert!(!forbidden.retryable);
        assert!(!missing.retryable);
        assert!(!rejected.retryable);
        assert_eq!(missing.reason.as_str(), "not_found");
    }

    #[test]
    fn test_network_and_server_errors_are_retryable() {
        let network: HandlerError = DiscordError::TransientNetwork("reset".into()).into();
        let server: HandlerError = DiscordError::ServerError {
            status: 503,
            message: "unavailable".into(),
        }
        .into();

        assert!(network.retryable && network.retry_after.is_none());
        assert!(server.retryable);
        assert_eq!(server.describe(), "server_error: Server error (503): unavailable");
    }

    /// Applies everything but never returns a readable created id.
    struct LostBodies;

    #[async_trait::async_trait]
    impl DiscordClient for LostBodies {
        async fn create_role(&self, _: &CreateRole) -> Result<Option<String>, DiscordError> {
            Ok(None)
        }
        async fn delete_role(&self, _: &DeleteRole) -> Result<(), DiscordError> {
            Ok(())
        }
        async fn assign_role(&self, _: &AssignRole) -> Result<(), DiscordError> {
            Ok(())
        }
        async fn remove_role(&self, _: &RemoveRole) -> Result<(), DiscordError> {
            Ok(())
        }
        async fn create_channel(&self, _: &CreateChannel) -> Result<Option<String>, DiscordError> {
            Ok(None)
        }
        async fn delete_channel(&self, _: &DeleteChannel) -> Result<(), DiscordError> {
            Ok(())
        }
        async fn update_permissions(&self, _: &UpdatePermissions) -> Result<(), DiscordError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_create_without_readable_id_is_still_applied() {
        let handlers = MutationHandlers::new(Arc::new(LostBodies));
        let payload = JobPayload::CreateRole(CreateRole {
            guild_id: "100000000000000001".into(),
            name: "moderators".into(),
            permissions: None,
            color: None,
            hoist: false,
            mentionable: false,
            reason: None,
        });

        let effect = handlers.execute(&payload).await.unwrap();
        assert_eq!(effect, AppliedEffect::default());
    }
}
