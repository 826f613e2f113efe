use crate::constants::*;
use crate::dispatch::DispatchPlan;
use crate::types::{ChatError, FailureNotice, ObservedError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_MS)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay_ms: u64) -> Self {
        Self {
            max_retries,
            delay: Duration::from_millis(delay_ms),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Runs `operation` until it succeeds, fails with a non-transient error, or
    /// `max_retries` retries are spent. Cancellation interrupts both the attempt
    /// and the wait between attempts.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ChatError::Cancelled.into()),
                result = operation() => result,
            };

            match result {
                Ok(val) => return Ok(val),
                Err(e) if attempts < self.max_attempts() && Self::is_retryable(&e) => {
                    tracing::warn!(
                        "Request failed (attempt {}/{}): {}. Retrying in {:?}...",
                        attempts,
                        self.max_attempts(),
                        e,
                        self.delay
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ChatError::Cancelled.into()),
                        _ = tokio::time::sleep(self.delay) => {}
                    }
                }
                Err(e) => {
                    if attempts > 1 {
                        tracing::error!("Request failed after {} attempts: {}", attempts, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    pub fn is_retryable(err: &ObservedError) -> bool {
        match &err.inner {
            ChatError::Network(_) => true,
            ChatError::Http { status, .. } => RETRYABLE_STATUS_CODES.contains(status),
            _ => false,
        }
    }
}

/// Fixed message and severity for the status codes the UI knows about.
pub fn notice_for_status(status: u16) -> Option<FailureNotice> {
    match status {
        404 => Some(FailureNotice::error(MODEL_NOT_FOUND_MESSAGE)),
        429 => Some(FailureNotice::warning(RATE_LIMITED_MESSAGE)),
        402 => Some(FailureNotice::warning(PLAN_LIMIT_MESSAGE).with_upgrade_prompt()),
        413 => Some(FailureNotice::error(PAYLOAD_TOO_LARGE_MESSAGE)),
        _ => None,
    }
}

/// Mapped notice, else the body's JSON `message`, else the generic string.
pub fn notice_from_body(status: u16, body: &[u8]) -> FailureNotice {
    if let Some(notice) = notice_for_status(status) {
        return notice;
    }
    let message = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .and_then(|m| m.as_str())
                .map(|m| m.to_string())
        })
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| GENERIC_FAILURE_MESSAGE.to_string());
    FailureNotice::error(message)
}

pub async fn error_from_response(response: reqwest::Response) -> ChatError {
    let status = response.status().as_u16();
    let body = match response.bytes().await {
        Ok(b) => b,
        Err(e) => {
            tracing::debug!("Could not read error body for status {}: {}", status, e);
            bytes::Bytes::new()
        }
    };
    ChatError::Http {
        status,
        notice: notice_from_body(status, &body),
    }
}

/// Issues the planned request with retry. Returns the response once headers
/// arrive with a 2xx status; the body is left for the stream consumer.
pub async fn fetch_chat_response(
    client: &reqwest::Client,
    plan: &DispatchPlan,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<reqwest::Response> {
    policy
        .execute_with_retry(cancel, move || async move {
            tracing::info!(
                "[⚙️  -> ☁️ ] POST {} ({:?})",
                plan.endpoint,
                plan.strategy
            );
            let response = client.post(&plan.endpoint).json(&plan.body).send().await?;
            if response.status().is_success() {
                Ok(response)
            } else {
                let err = error_from_response(response).await;
                tracing::warn!("[☁️  -> ⚙️ ] {}", err);
                Err(err.into())
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_policy_success() {
        let policy = RetryPolicy::new(3, 1);
        let attempts = AtomicU32::new(0);

        let result: Result<i32> = policy
            .execute_with_retry(&CancellationToken::new(), || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Ok(42) }
            })
            .await;

        assert_eq!(result.ok(), Some(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_policy_eventual_success() {
        let policy = RetryPolicy::new(3, 1);
        let attempts = AtomicU32::new(0);

        let result: Result<i32> = policy
            .execute_with_retry(&CancellationToken::new(), || {
                let a = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if a < 3 {
                        Err(ChatError::Http {
                            status: 504,
                            notice: FailureNotice::error("timeout"),
                        }
                        .into())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.ok(), Some(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_policy_stops_at_bound() {
        let policy = RetryPolicy::new(2, 1);
        let attempts = AtomicU32::new(0);

        let result: Result<()> = policy
            .execute_with_retry(&CancellationToken::new(), || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ChatError::Http {
                        status: 504,
                        notice: FailureNotice::error("timeout"),
                    }
                    .into())
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_mapped_errors_are_not_retried() {
        let policy = RetryPolicy::new(3, 1);
        let attempts = AtomicU32::new(0);

        let result: Result<()> = policy
            .execute_with_retry(&CancellationToken::new(), || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ChatError::Http {
                        status: 429,
                        notice: notice_from_body(429, b""),
                    }
                    .into())
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let policy = RetryPolicy::new(3, 60_000);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let result: Result<()> = policy
            .execute_with_retry(&cancel, || {
                trigger.cancel();
                async {
                    Err(ChatError::Http {
                        status: 504,
                        notice: FailureNotice::error("timeout"),
                    }
                    .into())
                }
            })
            .await;

        match result {
            Err(e) => assert!(matches!(e.inner, ChatError::Cancelled)),
            Ok(_) => panic!("Expected cancellation"),
        }
    }

    #[test]
    fn test_status_mapping() {
        let not_found = notice_from_body(404, b"");
        assert_eq!(not_found.severity, Severity::Error);
        assert_eq!(not_found.message, MODEL_NOT_FOUND_MESSAGE);

        let rate = notice_from_body(429, b"{\"message\":\"ignored\"}");
        assert_eq!(rate.severity, Severity::Warning);
        assert_eq!(rate.message, RATE_LIMITED_MESSAGE);

        let plan = notice_from_body(402, b"");
        assert!(plan.upgrade_prompt);
        assert_eq!(plan.message, PLAN_LIMIT_MESSAGE);

        let large = notice_from_body(413, b"");
        assert_eq!(large.message, PAYLOAD_TOO_LARGE_MESSAGE);
    }

    #[test]
    fn test_unmapped_status_uses_body_message() {
        let notice = notice_from_body(500, b"{\"message\":\"Provider key missing\"}");
        assert_eq!(notice.message, "Provider key missing");
        assert_eq!(notice.severity, Severity::Error);

        let fallback = notice_from_body(500, b"<html>oops</html>");
        assert_eq!(fallback.message, GENERIC_FAILURE_MESSAGE);
    }
}
