use std::net::TcpStream;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use courier_domain::{EventSender, MailConnection, MailTransport, MessageId, TransportEvent};
use courier_error::RelayError;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type ImapSession = imap::Session<native_tls::TlsStream<TcpStream>>;
type Reply<T> = oneshot::Sender<Result<T, RelayError>>;

#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// How often the open mailbox is searched for new unseen mail.
    pub poll_interval: Duration,
}

/// Mail transport over IMAPS. Each connection runs its blocking session on a
/// dedicated thread and talks to it through a command channel.
pub struct ImapTransport {
    config: ImapConfig,
}

impl ImapTransport {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }
}

impl MailTransport for ImapTransport {
    fn connect(&self, events: EventSender) -> Arc<dyn MailConnection> {
        let (tx, rx) = mpsc::channel();
        let config = self.config.clone();

        let spawned = std::thread::Builder::new()
            .name("imap-session".into())
            .spawn({
                let events = events.clone();
                move || session_loop(config, rx, events)
            });

        if let Err(e) = spawned {
            let _ = events.send(TransportEvent::Error(format!("spawn imap thread: {e}")));
            let _ = events.send(TransportEvent::Closed);
        }

        Arc::new(ImapConnection {
            commands: Mutex::new(Some(tx)),
        })
    }
}

enum Command {
    Open {
        name: String,
        read_only: bool,
        reply: Reply<()>,
    },
    SearchUnseen {
        reply: Reply<Vec<MessageId>>,
    },
    Fetch {
        uid: MessageId,
        reply: Reply<Vec<u8>>,
    },
    AddFlags {
        uid: MessageId,
        flags: String,
        reply: Reply<()>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

pub struct ImapConnection {
    commands: Mutex<Option<mpsc::Sender<Command>>>,
}

impl ImapConnection {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        rx.await
            .map_err(|_| RelayError::transport("imap session ended"))?
    }

    fn send(&self, command: Command) -> Result<(), RelayError> {
        let guard = self
            .commands
            .lock()
            .map_err(|_| RelayError::internal("imap command lock poisoned"))?;
        let tx = guard
            .as_ref()
            .ok_or_else(|| RelayError::transport("connection closed"))?;
        tx.send(command)
            .map_err(|_| RelayError::transport("imap session ended"))
    }
}

#[async_trait]
impl MailConnection for ImapConnection {
    async fn open_mailbox(&self, name: &str, read_only: bool) -> Result<(), RelayError> {
        let name = name.to_string();
        self.request(|reply| Command::Open {
            name,
            read_only,
            reply,
        })
        .await
    }

    async fn search_unseen(&self) -> Result<Vec<MessageId>, RelayError> {
        self.request(|reply| Command::SearchUnseen { reply }).await
    }

    async fn fetch_message(&self, id: MessageId) -> Result<Vec<u8>, RelayError> {
        self.request(|reply| Command::Fetch { uid: id, reply }).await
    }

    async fn add_flags(&self, id: MessageId, flags: &[&str]) -> Result<(), RelayError> {
        let flags = flags.join(" ");
        self.request(|reply| Command::AddFlags {
            uid: id,
            flags,
            reply,
        })
        .await
    }

    async fn close(&self) {
        let tx = match self.commands.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(tx) = tx else { return };
        let (reply, rx) = oneshot::channel();
        if tx.send(Command::Close { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

fn imap_connect(config: &ImapConfig) -> Result<ImapSession, RelayError> {
    let tls = native_tls::TlsConnector::builder()
        .build()
        .map_err(|e| RelayError::transport(format!("TLS init: {e}")))?;

    let client = imap::connect(
        (config.host.as_str(), config.port),
        config.host.as_str(),
        &tls,
    )
    .map_err(|e| RelayError::transport(format!("IMAP connect: {e}")))?;

    client
        .login(&config.user, &config.password)
        .map_err(|(e, _)| RelayError::transport(format!("IMAP login: {e}")))
}

/// Errors after which the session cannot be used any more.
fn is_connection_lost(err: &imap::Error) -> bool {
    matches!(err, imap::Error::Io(_) | imap::Error::ConnectionLost)
}

struct Worker {
    session: ImapSession,
    events: EventSender,
    /// Highest UID already reported (or present when the mailbox was opened).
    watermark: MessageId,
    polling: bool,
}

/// Outcome of one unit of work on the session.
enum Step {
    Continue,
    Lost(String),
    Stop,
}

fn session_loop(config: ImapConfig, commands: mpsc::Receiver<Command>, events: EventSender) {
    let session = match imap_connect(&config) {
        Ok(session) => session,
        Err(e) => {
            warn!(host = %config.host, error = %e, "imap connection failed");
            let _ = events.send(TransportEvent::Error(e.to_string()));
            let _ = events.send(TransportEvent::Closed);
            return;
        }
    };

    info!(host = %config.host, user = %config.user, "imap connected");
    let _ = events.send(TransportEvent::Connected);

    let mut worker = Worker {
        session,
        events,
        watermark: 0,
        polling: false,
    };
    let mut last_poll = Instant::now();

    loop {
        let wait = config.poll_interval.saturating_sub(last_poll.elapsed());
        let step = match commands.recv_timeout(wait) {
            Ok(command) => worker.handle(command),
            Err(RecvTimeoutError::Timeout) => {
                last_poll = Instant::now();
                worker.poll()
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!("imap connection handle dropped");
                let _ = worker.session.logout();
                Step::Stop
            }
        };

        match step {
            Step::Continue => {}
            Step::Lost(reason) => {
                warn!(reason = %reason, "imap connection lost");
                let _ = worker.events.send(TransportEvent::Error(reason));
                let _ = worker.events.send(TransportEvent::Closed);
                return;
            }
            Step::Stop => {
                let _ = worker.events.send(TransportEvent::Closed);
                return;
            }
        }
    }
}

impl Worker {
    fn handle(&mut self, command: Command) -> Step {
        match command {
            Command::Open {
                name,
                read_only,
                reply,
            } => {
                let result = if read_only {
                    self.session.examine(&name)
                } else {
                    self.session.select(&name)
                };
                let result = result.map(|mailbox| {
                    self.watermark = mailbox.uid_next.map_or(0, |next| next.saturating_sub(1));
                    self.polling = false;
                    debug!(mailbox = %name, exists = mailbox.exists, watermark = self.watermark, "mailbox opened");
                });
                self.finish(result, reply, |e| format!("IMAP SELECT '{name}': {e}"))
            }
            Command::SearchUnseen { reply } => {
                let result = self.session.uid_search("UNSEEN").map(|found| {
                    let mut uids: Vec<MessageId> = found.into_iter().collect();
                    uids.sort_unstable();
                    if let Some(max) = uids.last() {
                        self.watermark = self.watermark.max(*max);
                    }
                    self.polling = true;
                    uids
                });
                self.finish(result, reply, |e| format!("IMAP SEARCH: {e}"))
            }
            Command::Fetch { uid, reply } => {
                let result = self
                    .session
                    .uid_fetch(uid.to_string(), "BODY.PEEK[]")
                    .map(|fetched| {
                        fetched
                            .iter()
                            .find(|f| f.uid == Some(uid))
                            .or_else(|| fetched.iter().next())
                            .and_then(|f| f.body())
                            .map(<[u8]>::to_vec)
                    });
                match result {
                    Ok(Some(body)) => {
                        let _ = reply.send(Ok(body));
                        Step::Continue
                    }
                    Ok(None) => {
                        let _ = reply.send(Err(RelayError::transport(format!(
                            "IMAP FETCH: no body for uid {uid}"
                        ))));
                        Step::Continue
                    }
                    Err(e) => self.finish(Err(e), reply, |e| format!("IMAP FETCH {uid}: {e}")),
                }
            }
            Command::AddFlags { uid, flags, reply } => {
                let result = self
                    .session
                    .uid_store(uid.to_string(), format!("+FLAGS ({flags})"))
                    .map(|_| ());
                self.finish(result, reply, |e| format!("IMAP STORE {uid}: {e}"))
            }
            Command::Close { reply } => {
                if let Err(e) = self.session.logout() {
                    debug!(error = %e, "imap logout failed");
                }
                info!("imap session closed");
                let _ = reply.send(());
                Step::Stop
            }
        }
    }

    /// Reports unseen messages that arrived since the last report.
    fn poll(&mut self) -> Step {
        if !self.polling {
            return match self.session.noop() {
                Ok(()) => Step::Continue,
                Err(e) if is_connection_lost(&e) => Step::Lost(format!("IMAP NOOP: {e}")),
                Err(_) => Step::Continue,
            };
        }

        let query = format!("UID {}:* UNSEEN", self.watermark.saturating_add(1));
        match self.session.uid_search(query) {
            Ok(found) => {
                let mut fresh: Vec<MessageId> =
                    found.into_iter().filter(|uid| *uid > self.watermark).collect();
                fresh.sort_unstable();
                for uid in fresh {
                    debug!(uid, "new message");
                    self.watermark = uid;
                    let _ = self.events.send(TransportEvent::NewMessage(uid));
                }
                Step::Continue
            }
            Err(e) if is_connection_lost(&e) => Step::Lost(format!("IMAP SEARCH: {e}")),
            Err(e) => {
                warn!(error = %e, "imap poll failed");
                let _ = self.events.send(TransportEvent::Error(format!("IMAP SEARCH: {e}")));
                Step::Continue
            }
        }
    }

    fn finish<T>(
        &self,
        result: imap::error::Result<T>,
        reply: Reply<T>,
        describe: impl FnOnce(&imap::Error) -> String,
    ) -> Step {
        match result {
            Ok(value) => {
                let _ = reply.send(Ok(value));
                Step::Continue
            }
            Err(e) => {
                let msg = describe(&e);
                let _ = reply.send(Err(RelayError::transport(msg.clone())));
                if is_connection_lost(&e) {
                    Step::Lost(msg)
                } else {
                    Step::Continue
                }
            }
        }
    }
}
