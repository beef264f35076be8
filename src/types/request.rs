//! Generation requests and their one-way status transitions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AccountId, RequestId};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Only `Pending` may move, and only to a terminal state.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(self, Self::Pending) && next.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied generation parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub model: String,
    pub style: String,
    pub color: String,
    pub size: String,
    pub prompt: String,
}

impl GenerationParams {
    pub fn new(
        model: impl Into<String>,
        style: impl Into<String>,
        color: impl Into<String>,
        size: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            style: style.into(),
            color: color.into(),
            size: size.into(),
            prompt: prompt.into(),
        }
    }

    /// First blank required field, in declaration order.
    pub fn first_missing(&self) -> Option<&'static str> {
        [
            ("model", &self.model),
            ("style", &self.style),
            ("color", &self.color),
            ("size", &self.size),
            ("prompt", &self.prompt),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub id: RequestId,
    pub account_id: AccountId,
    pub model: String,
    pub style: String,
    pub color: String,
    pub size: String,
    pub prompt: String,
    pub status: RequestStatus,
    pub cost: u64,
    pub result_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl GenerationRequest {
    pub fn pending(
        account_id: AccountId,
        params: GenerationParams,
        cost: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RequestId::new(),
            account_id,
            model: params.model,
            style: params.style,
            color: params.color,
            size: params.size,
            prompt: params.prompt,
            status: RequestStatus::Pending,
            cost,
            result_ref: None,
            created_at,
            resolved_at: None,
        }
    }

    pub fn completed(&self, result_ref: Option<String>, at: DateTime<Utc>) -> Self {
        Self {
            status: RequestStatus::Completed,
            result_ref,
            resolved_at: Some(at),
            ..self.clone()
        }
    }

    pub fn failed(&self, at: DateTime<Utc>) -> Self {
        Self {
            status: RequestStatus::Failed,
            resolved_at: Some(at),
            ..self.clone()
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.status == RequestStatus::Pending && now - self.created_at > max_age
    }
}

/// Result reported for a pending request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome {
    Success { result_ref: Option<String> },
    Failure { reason: String },
}

impl Outcome {
    pub fn success(result_ref: impl Into<String>) -> Self {
        Self::Success {
            result_ref: Some(result_ref.into()),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}
