use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use courier_domain::{MailConnection, MailParser, MessageId, SEEN_FLAG};
use courier_error::RelayError;
use tracing::{debug, info};

use crate::delivery::DeliveryClient;
use crate::filter::RuleSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub dry_run: bool,
    /// Flag denied mail as seen so it is not picked up again on reconnect.
    pub mark_denied_seen: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            mark_denied_seen: true,
        }
    }
}

/// fetch -> parse -> filter -> deliver -> flag seen, for one message.
pub struct Pipeline {
    parser: Arc<dyn MailParser>,
    rules: RuleSet,
    delivery: DeliveryClient,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        parser: Arc<dyn MailParser>,
        rules: RuleSet,
        delivery: DeliveryClient,
        options: PipelineOptions,
    ) -> Self {
        Self {
            parser,
            rules,
            delivery,
            options,
        }
    }

    pub async fn process(
        &self,
        conn: &dyn MailConnection,
        uid: MessageId,
    ) -> Result<Outcome, RelayError> {
        info!(uid, "pipeline: fetching");
        let raw = conn.fetch_message(uid).await?;
        let parsed = self.parser.parse(&raw)?;

        if let Some(from) = parsed.from.first() {
            info!(uid, from = %from, "pipeline: from");
        }
        info!(uid, subject = %parsed.subject, "pipeline: subject");

        let mail = parsed.into_record();
        let outcome = match self.rules.evaluate(&mail) {
            Some(out) => {
                self.delivery.post_text(&out.subject, &out.body).await?;
                if let Some(attachment) = &mail.attachment {
                    let filename = stamped_filename(&attachment.filename);
                    self.delivery
                        .post_file(&filename, &attachment.content)
                        .await?;
                }
                Outcome::Delivered
            }
            None => {
                info!(uid, "pipeline: ignored by filter");
                Outcome::Denied
            }
        };

        if self.options.dry_run {
            debug!(uid, "pipeline: dry-run, not flagging seen");
            return Ok(outcome);
        }
        if outcome == Outcome::Denied && !self.options.mark_denied_seen {
            return Ok(outcome);
        }

        conn.add_flags(uid, &[SEEN_FLAG]).await?;
        debug!(uid, "pipeline: flagged seen");
        Ok(outcome)
    }
}

fn stamped_filename(original: &str) -> String {
    let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    format!("{stamp}-{original}")
}
