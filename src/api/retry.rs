//! Remote Call Retry Wrapper
//!
//! Every signed remote operation goes through [`call_with_retry`]: sign,
//! execute, advance the secret key, and on a timeout or token error negotiate
//! a new token and try again, up to the connection's retry budget.

use std::fs::File;
use std::future::Future;
use std::io::{Seek, SeekFrom};

use tracing::{debug, error, warn};

use super::connection::SignedRequest;
use super::errors::{ApiError, RetryClass};

/// The connection-side contract the retry wrapper relies on
pub trait TokenSession {
    /// Attempts per logical operation
    fn max_retries(&self) -> u32;

    /// Held across one attempt (sign, execute, secret update) and across refresh
    fn call_lock(&self) -> &tokio::sync::Mutex<()>;

    fn create_signed_request(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<SignedRequest, ApiError>;

    /// Advance the rotating secret; called after every executed attempt
    fn update_secret_key(&self);

    /// Negotiate a new session token
    fn refresh_token(&self) -> impl Future<Output = Result<(), ApiError>>;
}

/// Per-operation retry bookkeeping
#[derive(Debug)]
struct RetryContext {
    remaining: u32,
    attempts: u32,
    last_class: Option<RetryClass>,
}

impl RetryContext {
    fn new(max_retries: u32) -> Self {
        Self {
            remaining: max_retries.max(1),
            attempts: 0,
            last_class: None,
        }
    }

    fn begin_attempt(&mut self) {
        self.remaining -= 1;
        self.attempts += 1;
    }
}

/// Execute a signed remote call with token refresh and bounded retries
///
/// # Arguments
/// * `session` - Connection providing signing and token refresh
/// * `endpoint` - API endpoint path, e.g. `file/get_info.php`
/// * `query` - Query parameters (unencoded)
/// * `execute` - Sends a signed request and decodes the response
///
/// # Returns
/// The decoded result, or the last error once the budget is spent
pub async fn call_with_retry<S, T, F, Fut>(
    session: &S,
    endpoint: &str,
    query: &[(&str, &str)],
    mut execute: F,
) -> Result<T, ApiError>
where
    S: TokenSession,
    F: FnMut(SignedRequest) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut ctx = RetryContext::new(session.max_retries());

    loop {
        let _guard = session.call_lock().lock().await;
        ctx.begin_attempt();

        let request = session.create_signed_request(endpoint, query)?;
        let result = execute(request).await;

        // The server advances its secret on every call it sees, so we must too
        session.update_secret_key();

        let err = match result {
            Ok(value) => {
                if ctx.attempts > 1 {
                    debug!(
                        endpoint = endpoint,
                        attempts = ctx.attempts,
                        last_class = ?ctx.last_class,
                        "Remote call succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        let class = err.retry_class();
        if class == RetryClass::OtherFailure {
            return Err(err);
        }
        ctx.last_class = Some(class);

        // After a timeout we cannot know whether the server accepted the call,
        // so signatures may be out of sync: get a new token either way.
        warn!(
            endpoint = endpoint,
            attempt = ctx.attempts,
            class = ?class,
            error = %err,
            "Remote call failed, negotiating a new token"
        );
        if let Err(refresh_err) = session.refresh_token().await {
            error!(endpoint = endpoint, error = %refresh_err, "Failed to get a new token");
            return Err(ApiError::TokenRefresh(Box::new(refresh_err)));
        }

        if ctx.remaining == 0 {
            warn!(
                endpoint = endpoint,
                attempts = ctx.attempts,
                "Retry budget exhausted"
            );
            return Err(err);
        }
    }
}

/// Run a content transfer into `dest` with at most `max_attempts` tries
///
/// `dest` is emptied before every attempt and handed to `transfer` as a
/// cloned descriptor. Timeouts and network failures are retried; any other
/// error, including local IO, is returned at once.
///
/// # Returns
/// Bytes written by the successful attempt
pub async fn retry_transfer<F, Fut>(
    what: &str,
    max_attempts: u32,
    dest: &mut File,
    mut transfer: F,
) -> Result<u64, ApiError>
where
    F: FnMut(File) -> Fut,
    Fut: Future<Output = Result<u64, ApiError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        dest.set_len(0)?;
        dest.seek(SeekFrom::Start(0))?;
        let sink = dest.try_clone()?;

        match transfer(sink).await {
            Ok(written) => return Ok(written),
            Err(err @ (ApiError::Timeout | ApiError::Network(_))) if attempt < max_attempts => {
                warn!(
                    what = what,
                    attempt = attempt,
                    error = %err,
                    "Transfer failed, starting over"
                );
            }
            Err(err) => return Err(err),
        }
    }
}
