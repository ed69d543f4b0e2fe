//! Shared outbound HTTP plumbing for the notification fan-out.
//!
//! Both Telegram and webhook deliveries are best-effort, at-most-once:
//! bounded retry with exponential backoff on transient failures, no
//! persistent outbox. Missed pushes can be rebuilt from the message
//! store via the reapply operation.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const MAX_ATTEMPTS: u32 = 5;
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// How one HTTP response steers the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Success,
    /// 429 or 5xx: back off and try again.
    Retry,
    /// Any other 4xx: retrying cannot help.
    Terminal,
}

pub fn classify_status(status: u16) -> Disposition {
    match status {
        200..=299 => Disposition::Success,
        429 => Disposition::Retry,
        500..=599 => Disposition::Retry,
        _ => Disposition::Terminal,
    }
}

/// Delay before the given 1-based attempt: 1 s, 2 s, 4 s, 8 s, ...
pub fn backoff_delay(attempt: u32) -> Duration {
    INITIAL_BACKOFF * 2u32.saturating_pow(attempt.saturating_sub(1))
}

/// POST a JSON payload with the shared retry policy. Returns Ok on the
/// first 2xx; transport errors count as retryable attempts. Only the
/// final outcome is reported.
pub async fn post_json_with_retry(
    client: &reqwest::Client,
    url: &str,
    payload: &Value,
    context: &str,
) -> Result<()> {
    let mut last_error = String::new();

    for attempt in 1..=MAX_ATTEMPTS {
        if attempt > 1 {
            tokio::time::sleep(backoff_delay(attempt - 1)).await;
        }

        let response = client
            .post(url)
            .timeout(ATTEMPT_TIMEOUT)
            .json(payload)
            .send()
            .await;

        match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                match classify_status(status) {
                    Disposition::Success => {
                        debug!(context = %context, attempt, "Delivery succeeded");
                        return Ok(());
                    }
                    Disposition::Terminal => {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(Error::Invalid(format!(
                            "{} rejected with status {}: {}",
                            context,
                            status,
                            crate::services::helpers::truncate_chars(&body, 200)
                        )));
                    }
                    Disposition::Retry => {
                        last_error = format!("status {}", status);
                        warn!(context = %context, attempt, status, "Delivery attempt failed");
                    }
                }
            }
            Err(e) => {
                last_error = e.to_string();
                warn!(context = %context, attempt, error = %e, "Delivery attempt failed");
            }
        }
    }

    Err(Error::Transient(format!(
        "{} failed after {} attempts: {}",
        context, MAX_ATTEMPTS, last_error
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(200), Disposition::Success);
        assert_eq!(classify_status(204), Disposition::Success);
        assert_eq!(classify_status(429), Disposition::Retry);
        assert_eq!(classify_status(500), Disposition::Retry);
        assert_eq!(classify_status(503), Disposition::Retry);
        assert_eq!(classify_status(400), Disposition::Terminal);
        assert_eq!(classify_status(404), Disposition::Terminal);
        assert_eq!(classify_status(401), Disposition::Terminal);
    }

    #[test]
    fn backoff_schedule_doubles_from_one_second() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
    }
}
