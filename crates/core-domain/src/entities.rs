use serde::Serialize;
use std::fmt;

/// IMAP UID of a message in the watched mailbox.
pub type MessageId = u32;

pub const SEEN_FLAG: &str = "\\Seen";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub filename: String,
    #[serde(skip)]
    pub content: Vec<u8>,
}

/// One message under evaluation, built fresh for every fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailRecord {
    pub sender: String,
    pub subject: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

impl MailRecord {
    pub fn new(
        sender: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            subject: subject.into(),
            body: body.into(),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, filename: impl Into<String>, content: Vec<u8>) -> Self {
        self.attachment = Some(Attachment {
            filename: filename.into(),
            content,
        });
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Address {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => write!(f, "\"{name}\" <{}>", self.address),
            None => write!(f, "<{}>", self.address),
        }
    }
}

/// Structured form of a raw RFC 5322 message, as produced by a [`crate::MailParser`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMail {
    pub from: Vec<Address>,
    pub subject: String,
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl ParsedMail {
    /// Normalizes to the record the filter works on: first sender address,
    /// subject, plain-text body and only the first attachment.
    pub fn into_record(self) -> MailRecord {
        let sender = self
            .from
            .into_iter()
            .next()
            .map(|a| a.address)
            .unwrap_or_default();
        MailRecord {
            sender,
            subject: self.subject,
            body: self.text,
            attachment: self.attachments.into_iter().next(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    NewMessage(MessageId),
    Error(String),
    Closed,
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connect"),
            Self::NewMessage(id) => write!(f, "new uid:{id}"),
            Self::Error(msg) => write!(f, "error: {msg}"),
            Self::Closed => write!(f, "close"),
        }
    }
}
