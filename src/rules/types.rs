//! Forwarding rule records

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{validate_host, validate_port, ForwardError};

/// Current rules document version
pub const RULES_VERSION: u32 = 1;

/// Timestamps are persisted with millisecond precision
fn now_ms() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// A user-declared local forward, persisted across restarts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingRule {
    pub id: String,
    /// Display label, not required to be unique
    pub name: String,
    pub local_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub enabled: bool,
    /// Saved connection this rule belongs to
    #[serde(
        rename = "connectConfigId",
        alias = "ownerSessionId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub owner_session_id: Option<String>,
    #[serde(rename = "createTime", with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "modifyTime", with = "chrono::serde::ts_milliseconds")]
    pub modified_at: DateTime<Utc>,
}

impl ForwardingRule {
    /// New enabled rule with a fresh id
    pub fn new(
        name: impl Into<String>,
        local_port: u16,
        target_host: impl Into<String>,
        target_port: u16,
    ) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            local_port,
            target_host: target_host.into(),
            target_port,
            enabled: true,
            owner_session_id: None,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn with_owner(mut self, owner_session_id: impl Into<String>) -> Self {
        self.owner_session_id = Some(owner_session_id.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ForwardError> {
        validate_port("localPort", self.local_port)?;
        validate_host("targetHost", &self.target_host)?;
        validate_port("targetPort", self.target_port)
    }

    /// Bump the modification time, never before creation
    pub(crate) fn touch(&mut self) {
        self.modified_at = now_ms().max(self.created_at);
    }

    pub fn description(&self) -> String {
        format!(
            "localhost:{} → {}:{}",
            self.local_port, self.target_host, self.target_port
        )
    }
}

/// On-disk rules document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDocument {
    pub version: u32,
    #[serde(default)]
    pub rules: Vec<ForwardingRule>,
}

impl Default for RuleDocument {
    fn default() -> Self {
        Self {
            version: RULES_VERSION,
            rules: Vec::new(),
        }
    }
}
