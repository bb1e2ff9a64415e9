use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use courier_domain::{EventReceiver, MailConnection, MailTransport, MessageId, TransportEvent};
use courier_error::RelayError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backoff::{ConnectionState, ReconnectPolicy};
use crate::pipeline::Pipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Draining,
    Idle,
    Closing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Draining => write!(f, "draining"),
            Self::Idle => write!(f, "idle"),
            Self::Closing => write!(f, "closing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Transport(TransportEvent),
    HourlyReset { generation: u64 },
    ReconnectDue,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub mailbox: String,
    pub backlog_delay: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            mailbox: "INBOX".to_string(),
            backlog_delay: Duration::from_secs(1),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Owns the mailbox connection lifecycle. All transitions happen on the
/// task that drives [`SessionController::run`], so live messages are
/// processed one at a time in arrival order.
pub struct SessionController {
    transport: Arc<dyn MailTransport>,
    pipeline: Pipeline,
    options: SessionOptions,
    state: SessionState,
    counters: ConnectionState,
    connection: Option<Arc<dyn MailConnection>>,
    events: Option<EventReceiver>,
    timers_tx: mpsc::UnboundedSender<SessionEvent>,
    timers_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionController {
    pub fn new(
        transport: Arc<dyn MailTransport>,
        pipeline: Pipeline,
        options: SessionOptions,
    ) -> Self {
        let (timers_tx, timers_rx) = mpsc::unbounded_channel();
        let mut controller = Self {
            transport,
            pipeline,
            options,
            state: SessionState::Disconnected,
            counters: ConnectionState::default(),
            connection: None,
            events: None,
            timers_tx,
            timers_rx,
        };
        controller.connect();
        controller
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn counters(&self) -> &ConnectionState {
        &self.counters
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub async fn run(mut self) -> Result<(), RelayError> {
        loop {
            let event = self.next_event().await;
            self.handle(event).await?;
        }
    }

    pub async fn next_event(&mut self) -> SessionEvent {
        tokio::select! {
            event = recv_transport(&mut self.events) => {
                SessionEvent::Transport(event.unwrap_or(TransportEvent::Closed))
            }
            Some(event) = self.timers_rx.recv() => event,
        }
    }

    pub async fn handle(&mut self, event: SessionEvent) -> Result<(), RelayError> {
        debug!(state = %self.state, ?event, "session: event");
        match event {
            SessionEvent::Transport(TransportEvent::Connected) => self.on_connect().await,
            SessionEvent::Transport(TransportEvent::NewMessage(uid)) => self.on_new(uid).await,
            SessionEvent::Transport(TransportEvent::Error(message)) => {
                warn!(%message, "session: transport error");
                Ok(())
            }
            SessionEvent::Transport(TransportEvent::Closed) => {
                self.on_close();
                Ok(())
            }
            SessionEvent::HourlyReset { generation } => {
                if self.counters.hourly_reset(generation) {
                    info!(generation, "session: hourly failure counter reset");
                } else {
                    debug!(
                        generation,
                        current = self.counters.generation(),
                        "session: stale hourly reset ignored"
                    );
                }
                Ok(())
            }
            SessionEvent::ReconnectDue => {
                info!("session: trying to re-connect");
                self.counters.record_reconnect();
                self.connect();
                Ok(())
            }
        }
    }

    fn connect(&mut self) {
        info!(
            consecutive = self.counters.consecutive_failures(),
            within_hour = self.counters.failures_within_hour(),
            "session: connecting"
        );
        let (tx, rx) = mpsc::unbounded_channel();
        self.connection = Some(self.transport.connect(tx));
        self.events = Some(rx);
        self.state = SessionState::Connecting;
    }

    async fn on_connect(&mut self) -> Result<(), RelayError> {
        let generation = self.counters.on_connected();
        info!(generation, "session: connected");
        self.schedule(
            SessionEvent::HourlyReset { generation },
            self.options.reconnect.window,
        );

        let Some(conn) = self.connection.clone() else {
            warn!("session: connect event without a connection");
            return Ok(());
        };
        self.state = SessionState::Draining;

        if let Err(e) = conn.open_mailbox(&self.options.mailbox, false).await {
            warn!(mailbox = %self.options.mailbox, error = %e, "session: open mailbox failed");
            self.abort().await;
            return Ok(());
        }

        let unseen = match conn.search_unseen().await {
            Ok(unseen) => unseen,
            Err(e) => {
                warn!(error = %e, "session: unseen search failed");
                self.abort().await;
                return Ok(());
            }
        };
        info!(?unseen, "session: unseen");

        for (i, uid) in unseen.iter().copied().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.options.backlog_delay).await;
            }
            if let Err(e) = self.pipeline.process(conn.as_ref(), uid).await {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(uid, error = %e, "session: backlog aborted");
                self.abort().await;
                return Ok(());
            }
        }

        self.state = SessionState::Idle;
        Ok(())
    }

    async fn on_new(&mut self, uid: MessageId) -> Result<(), RelayError> {
        info!(uid, "session: new message");
        let Some(conn) = self.connection.clone() else {
            warn!(uid, state = %self.state, "session: no connection, new message skipped");
            return Ok(());
        };
        match self.pipeline.process(conn.as_ref(), uid).await {
            Ok(outcome) => {
                debug!(uid, ?outcome, "session: new message processed");
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(uid, error = %e, "session: new message failed");
                Ok(())
            }
        }
    }

    fn on_close(&mut self) {
        self.state = SessionState::Closing;
        let wait = self.counters.reconnect_wait(&self.options.reconnect);
        info!(
            wait_secs = wait.as_secs(),
            consecutive = self.counters.consecutive_failures(),
            within_hour = self.counters.failures_within_hour(),
            "session: disconnected"
        );
        self.connection = None;
        self.events = None;
        self.state = SessionState::Disconnected;
        self.schedule(SessionEvent::ReconnectDue, wait);
    }

    /// Closes the live connection; its `Closed` event drives the reconnect.
    async fn abort(&mut self) {
        self.state = SessionState::Closing;
        if let Some(conn) = self.connection.take() {
            conn.close().await;
        }
    }

    fn schedule(&self, event: SessionEvent, after: Duration) {
        let tx = self.timers_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(event);
        });
    }
}

async fn recv_transport(events: &mut Option<EventReceiver>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
