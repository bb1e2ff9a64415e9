use std::future::Future;
use std::sync::{Arc, OnceLock};

use courier_domain::ChatPort;
use courier_error::RelayError;
use regex::Regex;
use tracing::{debug, info};

use crate::backoff::RetryPolicy;

/// Chat delivery with dry-run short-circuit and bounded cubic back-off.
/// Each call either succeeds or fails after the retry ceiling.
pub struct DeliveryClient {
    chat: Arc<dyn ChatPort>,
    retry: RetryPolicy,
    dry_run: bool,
}

impl DeliveryClient {
    pub fn new(chat: Arc<dyn ChatPort>, retry: RetryPolicy, dry_run: bool) -> Self {
        Self {
            chat,
            retry,
            dry_run,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub async fn post_text(&self, subject: &str, body: &str) -> Result<(), RelayError> {
        let text = normalize_text(body);
        debug!(subject, "delivery: post text");
        debug!("\n---message---\n{text}\n-------------");

        if self.dry_run {
            info!(subject, "delivery: dry-run, text not sent");
            return Ok(());
        }

        self.with_retry("text", || self.chat.post_message(subject, &text))
            .await
            .map_err(|last| {
                RelayError::delivery(format!(
                    "max retry reached posting text {subject} / {text}: {last}"
                ))
            })
    }

    pub async fn post_file(&self, filename: &str, content: &[u8]) -> Result<(), RelayError> {
        debug!(filename, bytes = content.len(), "delivery: post file");

        if self.dry_run {
            info!(filename, "delivery: dry-run, file not sent");
            return Ok(());
        }

        self.with_retry("file", || self.chat.upload_file(filename, content))
            .await
            .map_err(|last| {
                RelayError::delivery(format!("max retry reached posting file {filename}: {last}"))
            })
    }

    /// Returns the last attempt's error once the ceiling is hit.
    async fn with_retry<F, Fut>(&self, kind: &str, mut send: F) -> Result<(), RelayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), RelayError>>,
    {
        let mut attempt = 1;
        loop {
            info!(kind, attempt, "delivery: sending");
            let err = match send().await {
                Ok(()) => {
                    info!(kind, attempt, "delivery: done");
                    return Ok(());
                }
                Err(e) => e,
            };
            debug!(kind, attempt, error = %err, "delivery: attempt failed");

            if attempt >= self.retry.max_attempts {
                return Err(err);
            }
            tokio::time::sleep(self.retry.delay_after(attempt)).await;
            attempt += 1;
        }
    }
}

#[allow(clippy::expect_used)]
fn newline_run_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"\s*\n").expect("valid newline run regex"))
}

#[allow(clippy::expect_used)]
fn trailing_newlines_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"\n+$").expect("valid trailing newline regex"))
}

/// Collapses any whitespace run that ends in a newline to a single `\n`
/// and drops trailing newlines.
pub fn normalize_text(body: &str) -> String {
    let collapsed = newline_run_regex().replace_all(body, "\n");
    trailing_newlines_regex()
        .replace_all(&collapsed, "")
        .into_owned()
}
