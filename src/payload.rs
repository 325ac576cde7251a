//! Typed payload contracts for the seven mutation job types.
//!
//! Payloads are validated synchronously at enqueue time: a missing required
//! field, an unknown field, or a malformed snowflake rejects the job with
//! `InvalidPayload` before anything is persisted.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{Result, SynthesisError};
use crate::job::JobType;
use crate::validation::{validate_bitfield, validate_snowflake, RequestValidator};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CreateRole {
    #[validate(custom(function = "validate_snowflake"))]
    pub guild_id: String,
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[validate(custom(function = "validate_bitfield"))]
    #[serde(default)]
    pub permissions: Option<String>,
    #[validate(range(max = 16777215))]
    #[serde(default)]
    pub color: Option<u32>,
    #[serde(default)]
    pub hoist: bool,
    #[serde(default)]
    pub mentionable: bool,
    #[validate(length(max = 512))]
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct DeleteRole {
    #[validate(custom(function = "validate_snowflake"))]
    pub guild_id: String,
    #[validate(custom(function = "validate_snowflake"))]
    pub role_id: String,
    #[validate(length(max = 512))]
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AssignRole {
    #[validate(custom(function = "validate_snowflake"))]
    pub guild_id: String,
    #[validate(custom(function = "validate_snowflake"))]
    pub user_id: String,
    #[validate(custom(function = "validate_snowflake"))]
    pub role_id: String,
    #[validate(length(max = 512))]
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RemoveRole {
    #[validate(custom(function = "validate_snowflake"))]
    pub guild_id: String,
    #[validate(custom(function = "validate_snowflake"))]
    pub user_id: String,
    #[validate(custom(function = "validate_snowflake"))]
    pub role_id: String,
    #[validate(length(max = 512))]
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Text,
    Voice,
    Category,
    Announcement,
    Stage,
    Forum,
}

impl ChannelKind {
    /// Numeric channel type on the wire.
    pub fn code(&self) -> u8 {
        match self {
            ChannelKind::Text => 0,
            ChannelKind::Voice => 2,
            ChannelKind::Category => 4,
            ChannelKind::Announcement => 5,
            ChannelKind::Stage => 13,
            ChannelKind::Forum => 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CreateChannel {
    #[validate(custom(function = "validate_snowflake"))]
    pub guild_id: String,
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    pub kind: ChannelKind,
    #[validate(custom(function = "validate_snowflake"))]
    #[serde(default)]
    pub parent_id: Option<String>,
    #[validate(length(max = 1024))]
    #[serde(default)]
    pub topic: Option<String>,
    #[validate(length(max = 512))]
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct DeleteChannel {
    #[validate(custom(function = "validate_snowflake"))]
    pub guild_id: String,
    #[validate(custom(function = "validate_snowflake"))]
    pub channel_id: String,
    #[validate(length(max = 512))]
    #[serde(default)]
    pub reason: Option<String>,
}

/// Whether a permission overwrite targets a role or a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwriteTarget {
    Role,
    Member,
}

impl OverwriteTarget {
    pub fn code(&self) -> u8 {
        match self {
            OverwriteTarget::Role => 0,
            OverwriteTarget::Member => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct UpdatePermissions {
    #[validate(custom(function = "validate_snowflake"))]
    pub guild_id: String,
    #[validate(custom(function = "validate_snowflake"))]
    pub channel_id: String,
    #[validate(custom(function = "validate_snowflake"))]
    pub target_id: String,
    pub target: OverwriteTarget,
    #[validate(custom(function = "validate_bitfield"))]
    pub allow: String,
    #[validate(custom(function = "validate_bitfield"))]
    pub deny: String,
    #[validate(length(max = 512))]
    #[serde(default)]
    pub reason: Option<String>,
}

/// A payload tagged with its job type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum JobPayload {
    CreateRole(CreateRole),
    DeleteRole(DeleteRole),
    AssignRole(AssignRole),
    RemoveRole(RemoveRole),
    CreateChannel(CreateChannel),
    DeleteChannel(DeleteChannel),
    UpdatePermissions(UpdatePermissions),
}

fn decode<T: serde::de::DeserializeOwned>(job_type: JobType, raw: serde_json::Value) -> Result<T> {
    serde_json::from_value(raw)
        .map_err(|e| SynthesisError::InvalidPayload(format!("{}: {}", job_type, e)))
}

impl JobPayload {
    /// Decodes and validates an untyped payload for `job_type`.
    pub fn parse(job_type: JobType, raw: serde_json::Value) -> Result<Self> {
        let payload = match job_type {
            JobType::CreateRole => JobPayload::CreateRole(decode(job_type, raw)?),
            JobType::DeleteRole => JobPayload::DeleteRole(decode(job_type, raw)?),
            JobType::AssignRole => JobPayload::AssignRole(decode(job_type, raw)?),
            JobType::RemoveRole => JobPayload::RemoveRole(decode(job_type, raw)?),
            JobType::CreateChannel => JobPayload::CreateChannel(decode(job_type, raw)?),
            JobType::DeleteChannel => JobPayload::DeleteChannel(decode(job_type, raw)?),
            JobType::UpdatePermissions => JobPayload::UpdatePermissions(decode(job_type, raw)?),
        };
        payload.validate()?;
        Ok(payload)
    }

    pub fn validate(&self) -> Result<()> {
        let outcome = match self {
            JobPayload::CreateRole(p) => p.validate(),
            JobPayload::DeleteRole(p) => p.validate(),
            JobPayload::AssignRole(p) => p.validate(),
            JobPayload::RemoveRole(p) => p.validate(),
            JobPayload::CreateChannel(p) => p.validate(),
            JobPayload::DeleteChannel(p) => p.validate(),
            JobPayload::UpdatePermissions(p) => p.validate(),
        };
        outcome.map_err(|errors| {
            SynthesisError::InvalidPayload(format!(
                "{}: {}",
                self.job_type(),
                RequestValidator::describe(&errors)
            ))
        })
    }

    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::CreateRole(_) => JobType::CreateRole,
            JobPayload::DeleteRole(_) => JobType::DeleteRole,
            JobPayload::AssignRole(_) => JobType::AssignRole,
            JobPayload::RemoveRole(_) => JobType::RemoveRole,
            JobPayload::CreateChannel(_) => JobType::CreateChannel,
            JobPayload::DeleteChannel(_) => JobType::DeleteChannel,
            JobPayload::UpdatePermissions(_) => JobType::UpdatePermissions,
        }
    }

    pub fn guild_id(&self) -> &str {
        match self {
            JobPayload::CreateRole(p) => &p.guild_id,
            JobPayload::DeleteRole(p) => &p.guild_id,
            JobPayload::AssignRole(p) => &p.guild_id,
            JobPayload::RemoveRole(p) => &p.guild_id,
            JobPayload::CreateChannel(p) => &p.guild_id,
            JobPayload::DeleteChannel(p) => &p.guild_id,
            JobPayload::UpdatePermissions(p) => &p.guild_id,
        }
    }

    /// Key identifying the logical operation when the caller supplies none.
    pub fn derive_idempotency_key(&self) -> String {
        match self {
            JobPayload::CreateRole(p) => format!("create_role:{}:{}", p.guild_id, p.name),
            JobPayload::DeleteRole(p) => format!("delete_role:{}:{}", p.guild_id, p.role_id),
            JobPayload::AssignRole(p) => {
                format!("assign_role:{}:{}:{}", p.guild_id, p.user_id, p.role_id)
            }
            JobPayload::RemoveRole(p) => {
                format!("remove_role:{}:{}:{}", p.guild_id, p.user_id, p.role_id)
            }
            JobPayload::CreateChannel(p) => format!(
                "create_channel:{}:{}:{}",
                p.guild_id,
                p.parent_id.as_deref().unwrap_or("-"),
                p.name
            ),
            JobPayload::DeleteChannel(p) => {
                format!("delete_channel:{}:{}", p.guild_id, p.channel_id)
            }
            JobPayload::UpdatePermissions(p) => format!(
                "update_permissions:{}:{}:{}:{}",
                p.channel_id, p.target_id, p.allow, p.deny
            ),
        }
    }
}
