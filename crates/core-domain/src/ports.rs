use std::sync::Arc;

use async_trait::async_trait;
use courier_error::RelayError;
use tokio::sync::mpsc;

use crate::entities::{MessageId, ParsedMail, TransportEvent};

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Opens mailbox connections. Every call is an independent attempt with its
/// own event stream.
pub trait MailTransport: Send + Sync {
    /// Starts connecting and returns at once. The attempt reports
    /// `Connected` on success; a failed or lost connection always ends with
    /// exactly one `Closed` (or the sender being dropped).
    fn connect(&self, events: EventSender) -> Arc<dyn MailConnection>;
}

#[async_trait]
pub trait MailConnection: Send + Sync {
    async fn open_mailbox(&self, name: &str, read_only: bool) -> Result<(), RelayError>;

    /// UIDs of unseen messages in the open mailbox, in server order.
    async fn search_unseen(&self) -> Result<Vec<MessageId>, RelayError>;

    /// Raw RFC 5322 bytes of the message.
    async fn fetch_message(&self, id: MessageId) -> Result<Vec<u8>, RelayError>;

    async fn add_flags(&self, id: MessageId, flags: &[&str]) -> Result<(), RelayError>;

    /// Ends the session; the connection reports `Closed` afterwards.
    async fn close(&self);
}

pub trait MailParser: Send + Sync {
    fn parse(&self, raw: &[u8]) -> Result<ParsedMail, RelayError>;
}

/// Single-attempt chat delivery. Retries are the caller's business.
#[async_trait]
pub trait ChatPort: Send + Sync {
    async fn post_message(&self, title: &str, text: &str) -> Result<(), RelayError>;

    async fn upload_file(&self, filename: &str, content: &[u8]) -> Result<(), RelayError>;
}
