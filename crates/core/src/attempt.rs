//! One execution of a job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::id::JobId;
use crate::job::ErrorCode;

/// Execution record, keyed by `(job_id, attempt)`.
///
/// Opened when the job enters `running` and finalized exactly once; never
/// mutated after `finished_at` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttempt {
    pub job_id: JobId,
    pub attempt: i32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// `None` while the attempt is still open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub tokens: i64,
    pub cost_usd: f64,
    pub provider_meta: JsonValue,
}

impl JobAttempt {
    pub fn open(job_id: JobId, attempt: i32, started_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            attempt,
            started_at,
            finished_at: None,
            success: None,
            error_code: None,
            error_message: None,
            tokens: 0,
            cost_usd: 0.0,
            provider_meta: JsonValue::Object(Default::default()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.finished_at.is_none()
    }

    /// Record a successful completion. No-op on an already finalized attempt.
    pub fn succeed(&mut self, usage: &Usage, now: DateTime<Utc>) {
        if !self.is_open() {
            return;
        }
        self.finished_at = Some(now);
        self.success = Some(true);
        self.error_code = None;
        self.error_message = None;
        self.tokens = usage.tokens;
        self.cost_usd = usage.cost_usd;
        self.provider_meta = usage.provider_meta.clone();
    }

    /// Record a failed completion. No-op on an already finalized attempt.
    pub fn fail(&mut self, code: ErrorCode, message: &str, now: DateTime<Utc>) {
        if !self.is_open() {
            return;
        }
        self.finished_at = Some(now);
        self.success = Some(false);
        self.error_code = Some(code);
        self.error_message = Some(message.to_string());
    }
}

/// What a provider reports for a successful execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub tokens: i64,
    pub cost_usd: f64,
    pub provider_meta: JsonValue,
}

impl Default for Usage {
    fn default() -> Self {
        Self {
            tokens: 0,
            cost_usd: 0.0,
            provider_meta: JsonValue::Object(Default::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn finalized_attempts_are_not_rewritten() {
        let now = Utc::now();
        let mut attempt = JobAttempt::open(JobId::new(), 1, now);

        attempt.fail(ErrorCode::ProviderTimeout, "too slow", now);
        attempt.succeed(
            &Usage {
                tokens: 10,
                cost_usd: 0.1,
                provider_meta: json!({}),
            },
            now,
        );

        assert_eq!(attempt.success, Some(false));
        assert_eq!(attempt.error_code, Some(ErrorCode::ProviderTimeout));
        assert_eq!(attempt.tokens, 0);
    }
}
