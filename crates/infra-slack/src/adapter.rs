use std::time::Duration;

use async_trait::async_trait;
use courier_domain::ChatPort;
use courier_error::RelayError;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

const BASE_URL: &str = "https://slack.com/api";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SlackConfig {
    pub token: String,
    pub channel_id: String,
    /// Incoming webhook; when set, text posts go there instead of the Web API.
    pub webhook: Option<String>,
}

pub struct SlackAdapter {
    config: SlackConfig,
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize, PartialEq)]
struct MessageAttachment<'a> {
    title: &'a str,
    text: &'a str,
}

#[derive(Debug, Serialize, PartialEq)]
struct PostMessage<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<&'a str>,
    attachments: [MessageAttachment<'a>; 1],
}

fn message_payload<'a>(channel: Option<&'a str>, title: &'a str, text: &'a str) -> PostMessage<'a> {
    PostMessage {
        channel,
        attachments: [MessageAttachment { title, text }],
    }
}

impl SlackAdapter {
    pub fn new(config: SlackConfig) -> Result<Self, RelayError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RelayError::config(format!("slack http client: {e}")))?;
        Ok(Self {
            config,
            client,
            base_url: BASE_URL.to_string(),
        })
    }

    /// Points Web API calls somewhere other than slack.com.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn api_post(&self, method: &str, body: &impl Serialize) -> Result<Value, RelayError> {
        let url = format!("{}/{method}", self.base_url);
        debug!(url, "slack POST");
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.config.token)
            .json(body)
            .send()
            .await
            .map_err(|e| RelayError::transport(format!("slack request failed: {e}")))?;
        parse_slack_response(resp).await
    }

    async fn webhook_post(&self, url: &str, body: &impl Serialize) -> Result<(), RelayError> {
        debug!("slack webhook POST");
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| RelayError::transport(format!("slack webhook failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(http_error(status.as_u16(), &body));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatPort for SlackAdapter {
    async fn post_message(&self, title: &str, text: &str) -> Result<(), RelayError> {
        match self.config.webhook.as_deref() {
            Some(url) => {
                self.webhook_post(url, &message_payload(None, title, text))
                    .await
            }
            None => {
                let payload = message_payload(Some(&self.config.channel_id), title, text);
                self.api_post("chat.postMessage", &payload).await.map(|_| ())
            }
        }
    }

    async fn upload_file(&self, filename: &str, content: &[u8]) -> Result<(), RelayError> {
        let file_part =
            reqwest::multipart::Part::bytes(content.to_vec()).file_name(filename.to_string());

        let form = reqwest::multipart::Form::new()
            .text("channels", self.config.channel_id.clone())
            .text("title", filename.to_string())
            .part("file", file_part);

        let url = format!("{}/files.upload", self.base_url);
        debug!(url, filename, bytes = content.len(), "slack upload file");
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.config.token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| RelayError::transport(format!("slack upload failed: {e}")))?;
        parse_slack_response(resp).await.map(|_| ())
    }
}

async fn parse_slack_response(resp: reqwest::Response) -> Result<Value, RelayError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(http_error(status.as_u16(), &body));
    }
    let body: Value = resp
        .json()
        .await
        .map_err(|e| RelayError::delivery(format!("slack response parse failed: {e}")))?;
    check_slack_ok(&body)?;
    Ok(body)
}

fn http_error(status: u16, body: &str) -> RelayError {
    if status == 401 || status == 403 {
        return RelayError::delivery(format!("slack auth failed ({status}): {body}"));
    }
    RelayError::transport(format!("slack http error ({status}): {body}"))
}

fn check_slack_ok(resp: &Value) -> Result<(), RelayError> {
    if resp["ok"].as_bool() != Some(true) {
        let error = resp["error"].as_str().unwrap_or("unknown_error");
        if error == "invalid_auth" || error == "not_authed" || error == "token_revoked" {
            return Err(RelayError::delivery(format!("slack auth error: {error}")));
        }
        return Err(RelayError::delivery(format!("slack api error: {error}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(webhook: Option<&str>) -> SlackConfig {
        SlackConfig {
            token: "xoxb-test".into(),
            channel_id: "C0123".into(),
            webhook: webhook.map(str::to_string),
        }
    }

    #[test]
    fn web_api_payload_carries_channel_and_attachment() {
        let payload = serde_json::to_value(message_payload(Some("C0123"), "Subject", "Body")).unwrap();
        assert_eq!(
            payload,
            json!({
                "channel": "C0123",
                "attachments": [{ "title": "Subject", "text": "Body" }]
            })
        );
    }

    #[test]
    fn webhook_payload_omits_channel() {
        let payload = serde_json::to_value(message_payload(None, "t", "x")).unwrap();
        assert!(payload.get("channel").is_none());
        assert_eq!(payload["attachments"][0]["title"], "t");
    }

    #[test]
    fn ok_response_passes() {
        assert!(check_slack_ok(&json!({ "ok": true, "ts": "1.2" })).is_ok());
    }

    #[test]
    fn api_errors_are_reported() {
        let err = check_slack_ok(&json!({ "ok": false, "error": "channel_not_found" })).unwrap_err();
        assert_eq!(err.to_string(), "delivery error: slack api error: channel_not_found");

        let err = check_slack_ok(&json!({ "ok": false, "error": "invalid_auth" })).unwrap_err();
        assert!(err.to_string().contains("auth"));

        let err = check_slack_ok(&json!({})).unwrap_err();
        assert!(err.to_string().contains("unknown_error"));
    }

    #[test]
    fn http_status_maps_to_error_kind() {
        assert!(matches!(http_error(403, "nope"), RelayError::Delivery(_)));
        assert!(matches!(http_error(503, "busy"), RelayError::Transport(_)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_error() {
        let adapter = SlackAdapter::new(config(None))
            .unwrap()
            .with_base_url("http://127.0.0.1:9");
        let err = adapter.post_message("s", "b").await.unwrap_err();
        assert!(matches!(err, RelayError::Transport(_)), "{err}");

        let err = adapter.upload_file("a.txt", b"abc").await.unwrap_err();
        assert!(matches!(err, RelayError::Transport(_)), "{err}");
    }

    #[tokio::test]
    async fn webhook_failures_are_transport_errors() {
        let adapter = SlackAdapter::new(config(Some("http://127.0.0.1:9/hook"))).unwrap();
        let err = adapter.post_message("s", "b").await.unwrap_err();
        assert!(err.to_string().contains("webhook"), "{err}");
    }
}
