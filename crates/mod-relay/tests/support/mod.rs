#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use courier_domain::*;
use courier_error::RelayError;
use courier_relay::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connect {
    Succeed,
    Refuse,
}

#[derive(Default)]
pub struct Mailbox {
    pub messages: HashMap<MessageId, Vec<u8>>,
    pub unseen: Vec<MessageId>,
    pub flagged: Vec<(MessageId, String)>,
    pub fetched: Vec<MessageId>,
    pub fail_open: u32,
    pub fail_search: u32,
    pub connects: u32,
    pub closes: u32,
}

/// In-memory transport. Raw messages are `from|subject|body[|attachment]`.
#[derive(Default)]
pub struct FakeTransport {
    pub mailbox: Arc<Mutex<Mailbox>>,
    script: Mutex<VecDeque<Connect>>,
    latest: Mutex<Option<EventSender>>,
}

impl FakeTransport {
    pub fn with_messages(messages: &[(MessageId, &str)]) -> Arc<Self> {
        let transport = Self::default();
        {
            let mut mb = transport.mailbox.lock().unwrap();
            for (uid, raw) in messages {
                mb.messages.insert(*uid, raw.as_bytes().to_vec());
                mb.unseen.push(*uid);
            }
        }
        Arc::new(transport)
    }

    pub fn script(&self, steps: &[Connect]) {
        self.script.lock().unwrap().extend(steps.iter().copied());
    }

    pub fn add_message(&self, uid: MessageId, raw: &str) {
        self.mailbox
            .lock()
            .unwrap()
            .messages
            .insert(uid, raw.as_bytes().to_vec());
    }

    /// Pushes an event onto the most recent connection's stream.
    pub fn emit(&self, event: TransportEvent) {
        if let Some(tx) = self.latest.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Remote side hangs up.
    pub fn drop_connection(&self) {
        if let Some(tx) = self.latest.lock().unwrap().take() {
            let _ = tx.send(TransportEvent::Closed);
        }
    }

    pub fn flagged(&self) -> Vec<MessageId> {
        self.mailbox
            .lock()
            .unwrap()
            .flagged
            .iter()
            .map(|(uid, _)| *uid)
            .collect()
    }

    pub fn connects(&self) -> u32 {
        self.mailbox.lock().unwrap().connects
    }

    pub fn closes(&self) -> u32 {
        self.mailbox.lock().unwrap().closes
    }
}

impl MailTransport for FakeTransport {
    fn connect(&self, events: EventSender) -> Arc<dyn MailConnection> {
        self.mailbox.lock().unwrap().connects += 1;
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Connect::Succeed);

        let sender = match step {
            Connect::Succeed => {
                let _ = events.send(TransportEvent::Connected);
                *self.latest.lock().unwrap() = Some(events.clone());
                Some(events)
            }
            Connect::Refuse => {
                let _ = events.send(TransportEvent::Error("connection refused".into()));
                let _ = events.send(TransportEvent::Closed);
                None
            }
        };

        Arc::new(FakeConnection {
            mailbox: self.mailbox.clone(),
            events: Mutex::new(sender),
        })
    }
}

pub struct FakeConnection {
    mailbox: Arc<Mutex<Mailbox>>,
    events: Mutex<Option<EventSender>>,
}

#[async_trait]
impl MailConnection for FakeConnection {
    async fn open_mailbox(&self, _name: &str, read_only: bool) -> Result<(), RelayError> {
        assert!(!read_only, "mailbox must be opened read-write");
        let mut mb = self.mailbox.lock().unwrap();
        if mb.fail_open > 0 {
            mb.fail_open -= 1;
            return Err(RelayError::transport("SELECT failed"));
        }
        Ok(())
    }

    async fn search_unseen(&self) -> Result<Vec<MessageId>, RelayError> {
        let mut mb = self.mailbox.lock().unwrap();
        if mb.fail_search > 0 {
            mb.fail_search -= 1;
            return Err(RelayError::transport("SEARCH failed"));
        }
        Ok(mb.unseen.clone())
    }

    async fn fetch_message(&self, id: MessageId) -> Result<Vec<u8>, RelayError> {
        let mut mb = self.mailbox.lock().unwrap();
        mb.fetched.push(id);
        mb.messages
            .get(&id)
            .cloned()
            .ok_or_else(|| RelayError::transport(format!("no such uid {id}")))
    }

    async fn add_flags(&self, id: MessageId, flags: &[&str]) -> Result<(), RelayError> {
        let mut mb = self.mailbox.lock().unwrap();
        for flag in flags {
            mb.flagged.push((id, flag.to_string()));
        }
        mb.unseen.retain(|u| *u != id);
        Ok(())
    }

    async fn close(&self) {
        let mut mb = self.mailbox.lock().unwrap();
        mb.closes += 1;
        if let Some(tx) = self.events.lock().unwrap().take() {
            let _ = tx.send(TransportEvent::Closed);
        }
    }
}

pub struct FakeParser;

impl MailParser for FakeParser {
    fn parse(&self, raw: &[u8]) -> Result<ParsedMail, RelayError> {
        let text = String::from_utf8_lossy(raw);
        let fields: Vec<&str> = text.split('|').collect();
        if fields.len() < 3 {
            return Err(RelayError::parse("malformed fake message"));
        }
        let attachments = fields
            .get(3)
            .map(|name| {
                vec![Attachment {
                    filename: name.to_string(),
                    content: name.as_bytes().to_vec(),
                }]
            })
            .unwrap_or_default();
        Ok(ParsedMail {
            from: vec![Address {
                address: fields[0].to_string(),
                name: None,
            }],
            subject: fields[1].to_string(),
            text: fields[2].to_string(),
            attachments,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCall {
    Text { title: String, text: String },
    File { filename: String, bytes: usize },
}

#[derive(Default)]
pub struct FakeChat {
    pub calls: Mutex<Vec<ChatCall>>,
    failures_left: Mutex<u32>,
}

impl FakeChat {
    pub fn failing(times: u32) -> Arc<Self> {
        let chat = Self::default();
        *chat.failures_left.lock().unwrap() = times;
        Arc::new(chat)
    }

    pub fn calls(&self) -> Vec<ChatCall> {
        self.calls.lock().unwrap().clone()
    }

    fn attempt(&self, call: ChatCall) -> Result<(), RelayError> {
        self.calls.lock().unwrap().push(call);
        let mut left = self.failures_left.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            return Err(RelayError::transport("slack http error (503)"));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatPort for FakeChat {
    async fn post_message(&self, title: &str, text: &str) -> Result<(), RelayError> {
        self.attempt(ChatCall::Text {
            title: title.to_string(),
            text: text.to_string(),
        })
    }

    async fn upload_file(&self, filename: &str, content: &[u8]) -> Result<(), RelayError> {
        self.attempt(ChatCall::File {
            filename: filename.to_string(),
            bytes: content.len(),
        })
    }
}

pub fn rules(json: &str) -> RuleSet {
    let specs: Vec<RuleSpec> = serde_json::from_str(json).unwrap();
    RuleSet::compile(&specs).unwrap()
}

pub fn pipeline(chat: Arc<FakeChat>, rules: RuleSet, retry: RetryPolicy, options: PipelineOptions) -> Pipeline {
    let delivery = DeliveryClient::new(chat, retry, options.dry_run);
    Pipeline::new(Arc::new(FakeParser), rules, delivery, options)
}

pub fn controller(transport: Arc<FakeTransport>, pipeline: Pipeline) -> SessionController {
    SessionController::new(transport, pipeline, SessionOptions::default())
}
