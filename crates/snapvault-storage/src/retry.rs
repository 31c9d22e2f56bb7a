use std::time::Duration;

use serde::{Deserialize, Serialize};

use snapvault_types::error::SnapError;

/// Retry settings for remote calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay_ms: default_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Whether an HTTP error is transient and worth retrying.
pub fn is_retryable_http(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Transport(_) => true,
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
    }
}

/// Whether an I/O error is transient and worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}

/// Map an HTTP failure into the error taxonomy.
///
/// 404 is handled by callers (it is `Ok(None)` at the store boundary, never
/// an error), so it never reaches this function.
pub fn classify_http(op_name: &str, err: ureq::Error) -> SnapError {
    match &err {
        ureq::Error::Status(401 | 403, _) => SnapError::AuthDenied(format!("{op_name}: {err}")),
        ureq::Error::Status(412, _) => SnapError::PreconditionFailed(op_name.to_string()),
        _ if is_retryable_http(&err) => SnapError::Transient(format!("{op_name}: {err}")),
        _ => SnapError::Fatal(format!("{op_name}: {err}")),
    }
}

/// Retry a closure on transient `ureq::Error`s with exponential backoff
/// plus jitter.
///
/// 412 is excluded from in-backend retries: blindly replaying a
/// compare-and-swap write cannot succeed, the caller must re-read first.
#[allow(clippy::result_large_err)]
pub fn retry_http<T>(
    policy: &RetryPolicy,
    op_name: &str,
    f: impl Fn() -> std::result::Result<T, ureq::Error>,
) -> std::result::Result<T, ureq::Error> {
    let mut delay_ms = policy.delay_ms;
    let mut last_err = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let jitter = rand::random::<u64>() % delay_ms.max(1);
            std::thread::sleep(Duration::from_millis(delay_ms + jitter));
            delay_ms = (delay_ms * 2).min(policy.max_delay_ms);
        }
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if is_retryable_http(&e) && attempt < policy.max_retries => {
                tracing::warn!(
                    "{op_name}: transient error (attempt {}/{}), retrying: {e}",
                    attempt + 1,
                    policy.max_retries,
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap())
}

/// Retry a closure whose failures are already classified into the error
/// taxonomy. Used for operations that read response bodies, where a
/// transient failure can surface either as an HTTP error or as an I/O
/// error mid-read.
///
/// Same backoff loop as [`retry_http`]; only `SnapError::is_transient()`
/// failures are replayed, and `PreconditionFailed` is excluded for the
/// same CAS reason.
pub fn retry_transient<T>(
    policy: &RetryPolicy,
    op_name: &str,
    f: impl Fn() -> std::result::Result<T, SnapError>,
) -> std::result::Result<T, SnapError> {
    let mut delay_ms = policy.delay_ms;
    let mut last_err = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let jitter = rand::random::<u64>() % delay_ms.max(1);
            std::thread::sleep(Duration::from_millis(delay_ms + jitter));
            delay_ms = (delay_ms * 2).min(policy.max_delay_ms);
        }
        match f() {
            Ok(val) => return Ok(val),
            Err(e)
                if matches!(e, SnapError::Transient(_)) && attempt < policy.max_retries =>
            {
                tracing::warn!(
                    "{op_name}: transient error (attempt {}/{}), retrying: {e}",
                    attempt + 1,
                    policy.max_retries,
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap())
}
