use std::{fmt, str::FromStr};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Status condition in the shape shared by Kubernetes resources.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: ConditionStatus,

    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub message: String,

    /// RFC 3339 timestamp of the last `status` change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConditionType {
    ApiToken,
    PaasToken,
    DataIngestToken,
}

impl ConditionType {
    pub const TOKENS: [Self; 3] = [Self::ApiToken, Self::PaasToken, Self::DataIngestToken];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ApiToken => "APIToken",
            Self::PaasToken => "PaaSToken",
            Self::DataIngestToken => "DataIngestToken",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Reasons attached to the token conditions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TokenReason {
    Ready,
    SecretNotFound,
    Missing,
    Unauthorized,
    ScopeMissing,
    Error,
}

impl TokenReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "TokenReady",
            Self::SecretNotFound => "TokenSecretNotFound",
            Self::Missing => "TokenMissing",
            Self::Unauthorized => "TokenUnauthorized",
            Self::ScopeMissing => "TokenScopeMissing",
            Self::Error => "TokenError",
        }
    }

    /// Reasons only the tenant API client can establish. A reconcile that
    /// merely sees the token in the secret must not overwrite them.
    #[must_use]
    pub const fn is_verified_by_tenant(self) -> bool {
        matches!(self, Self::Unauthorized | Self::ScopeMissing)
    }
}

impl fmt::Display for TokenReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for TokenReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TokenReady" => Ok(Self::Ready),
            "TokenSecretNotFound" => Ok(Self::SecretNotFound),
            "TokenMissing" => Ok(Self::Missing),
            "TokenUnauthorized" => Ok(Self::Unauthorized),
            "TokenScopeMissing" => Ok(Self::ScopeMissing),
            "TokenError" => Ok(Self::Error),
            _ => Err(format!("unknown token reason {s}")),
        }
    }
}

impl Condition {
    #[must_use]
    pub fn token(
        type_: ConditionType,
        status: ConditionStatus,
        reason: TokenReason,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.as_str().to_string(),
            status,
            reason: reason.as_str().to_string(),
            message: message.into(),
            last_transition_time: None,
            observed_generation: None,
        }
    }

    #[must_use]
    pub fn token_reason(&self) -> Option<TokenReason> { self.reason.parse().ok() }
}

/// Inserts or replaces the condition of the same type.
///
/// `lastTransitionTime` is carried over unless `status` changed. Returns
/// whether the list was modified.
pub fn upsert_condition(
    conditions: &mut Vec<Condition>,
    mut condition: Condition,
    now: &str,
) -> bool {
    match conditions.iter_mut().find(|existing| existing.type_ == condition.type_) {
        Some(existing) => {
            condition.last_transition_time = if existing.status == condition.status {
                existing.last_transition_time.clone().or_else(|| Some(now.to_string()))
            } else {
                Some(now.to_string())
            };
            if *existing == condition {
                return false;
            }
            *existing = condition;
            true
        }
        None => {
            condition.last_transition_time = Some(now.to_string());
            conditions.push(condition);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_reason_round_trip() {
        for reason in [
            TokenReason::Ready,
            TokenReason::SecretNotFound,
            TokenReason::Missing,
            TokenReason::Unauthorized,
            TokenReason::ScopeMissing,
            TokenReason::Error,
        ] {
            assert_eq!(reason.as_str().parse::<TokenReason>(), Ok(reason));
        }
        assert!("Bogus".parse::<TokenReason>().is_err());
    }

    #[test]
    fn test_upsert_condition_keeps_transition_time() {
        let mut conditions = Vec::new();
        let ready = Condition::token(
            ConditionType::ApiToken,
            ConditionStatus::True,
            TokenReason::Ready,
            "ready",
        );
        assert!(upsert_condition(&mut conditions, ready.clone(), "2024-01-01T00:00:00Z"));
        assert!(!upsert_condition(&mut conditions, ready, "2024-01-02T00:00:00Z"));
        assert_eq!(conditions[0].last_transition_time.as_deref(), Some("2024-01-01T00:00:00Z"));

        let missing = Condition::token(
            ConditionType::ApiToken,
            ConditionStatus::False,
            TokenReason::Missing,
            "missing",
        );
        assert!(upsert_condition(&mut conditions, missing, "2024-01-03T00:00:00Z"));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].reason, "TokenMissing");
        assert_eq!(conditions[0].last_transition_time.as_deref(), Some("2024-01-03T00:00:00Z"));
    }

    #[test]
    fn test_serialize_condition_shape() {
        let condition = Condition::token(
            ConditionType::PaasToken,
            ConditionStatus::False,
            TokenReason::SecretNotFound,
            "secret dk1 not found",
        );
        let value = serde_json::to_value(condition).unwrap();
        assert_eq!(value["type"], "PaaSToken");
        assert_eq!(value["status"], "False");
        assert_eq!(value["reason"], "TokenSecretNotFound");
    }
}
