use std::path::Path;
use std::time::Duration;

use courier_error::RelayError;
use courier_imap::ImapConfig;
use courier_relay::{PipelineOptions, RetryPolicy, RuleSet, RuleSpec, SessionOptions};
use courier_slack::SlackConfig;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "/config/config.json";
pub const CONFIG_ENV: &str = "COURIER_CONFIG";

const SECRET_ENV_PREFIX: &str = "env:";

#[derive(Debug, Deserialize)]
pub struct Config {
    pub mail: MailSection,
    pub slack: SlackSection,
    #[serde(default)]
    pub filter: Vec<RuleSpec>,
    #[serde(default = "default_true")]
    pub mark_denied_seen: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub dryrun: bool,
}

#[derive(Debug, Deserialize)]
pub struct MailSection {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    pub auth: MailAuth,
}

#[derive(Debug, Deserialize)]
pub struct MailAuth {
    pub user: String,
    pub pass: String,
}

#[derive(Debug, Deserialize)]
pub struct SlackSection {
    pub channel_id: String,
    pub token: String,
    #[serde(default)]
    pub webhook: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    993
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

fn default_poll_interval() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    5
}

/// Picks the configuration file: explicit flag, then `COURIER_CONFIG`, then
/// the container default.
pub fn resolve_path(flag: Option<&str>) -> String {
    flag.map(str::to_string)
        .or_else(|| std::env::var(CONFIG_ENV).ok().filter(|p| !p.is_empty()))
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RelayError::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, RelayError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| RelayError::config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), RelayError> {
        if self.mail.host.trim().is_empty() {
            return Err(RelayError::config("mail.host must not be empty"));
        }
        if self.mail.auth.user.trim().is_empty() {
            return Err(RelayError::config("mail.auth.user must not be empty"));
        }
        if self.slack.channel_id.trim().is_empty() {
            return Err(RelayError::config("slack.channel_id must not be empty"));
        }
        if self.slack.max_retries == 0 {
            return Err(RelayError::config("slack.max_retries must be at least 1"));
        }
        if self.mail.poll_interval_secs == 0 {
            return Err(RelayError::config("mail.poll_interval_secs must be at least 1"));
        }
        Ok(())
    }

    pub fn rules(&self) -> Result<RuleSet, RelayError> {
        RuleSet::compile(&self.filter)
    }

    pub fn imap_config(&self) -> Result<ImapConfig, RelayError> {
        Ok(ImapConfig {
            host: self.mail.host.clone(),
            port: self.mail.port,
            user: self.mail.auth.user.clone(),
            password: resolve_secret(&self.mail.auth.pass, "mail.auth.pass")?,
            poll_interval: Duration::from_secs(self.mail.poll_interval_secs),
        })
    }

    pub fn slack_config(&self) -> Result<SlackConfig, RelayError> {
        Ok(SlackConfig {
            token: resolve_secret(&self.slack.token, "slack.token")?,
            channel_id: self.slack.channel_id.clone(),
            webhook: self.slack.webhook.clone().filter(|w| !w.is_empty()),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_attempts(self.slack.max_retries)
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            dry_run: self.dryrun,
            mark_denied_seen: self.mark_denied_seen,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            mailbox: self.mail.mailbox.clone(),
            ..SessionOptions::default()
        }
    }
}

/// `"env:NAME"` reads the value from the environment; anything else is taken
/// literally.
fn resolve_secret(value: &str, field: &str) -> Result<String, RelayError> {
    match value.strip_prefix(SECRET_ENV_PREFIX) {
        Some(var) => std::env::var(var)
            .map_err(|_| RelayError::config(format!("{field}: environment variable {var} not set"))),
        None => Ok(value.to_string()),
    }
}
