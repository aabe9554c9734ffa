//! Resilient device channel: one logical connection to the backend with
//! keep-alive, exponential-backoff reconnect and named-event fan-out.
//!
//! [`Channel`] is a cheap cloneable handle; every clone drives the same
//! session. State transitions are `disconnected -> connecting -> open` and
//! back. Every connection attempt carries an epoch so that tasks belonging
//! to a superseded attempt never touch the current session.

mod connector;
mod registry;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, info, trace, warn};

pub use connector::{Connection, Connector, Frame, WsConnector};
pub use registry::{Handler, Registry, Subscription};

use crate::client::error::ChannelError;
use crate::config::ChannelConfig;
use crate::models::envelope::{classify_text, events, Envelope, IgnoredFrame, Inbound};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
}

/// Delay before reconnect attempt `attempt` (0-based).
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(cap)
}

struct Session {
    state: ChannelState,
    attempts: u32,
    auto_reconnect: bool,
    epoch: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    reader: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: ChannelState::Disconnected,
            attempts: 0,
            auto_reconnect: false,
            epoch: 0,
            outbound: None,
            reader: None,
            keepalive: None,
            reconnect: None,
        }
    }
}

struct Inner {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    credential: Mutex<Option<String>>,
    session: Mutex<Session>,
    registry: Arc<Registry>,
}

#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    pub fn new(config: ChannelConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                credential: Mutex::new(None),
                session: Mutex::new(Session::new()),
                registry: Arc::new(Registry::default()),
            }),
        }
    }

    /// WebSocket channel to `config.url`.
    pub fn websocket(config: ChannelConfig) -> Self {
        Self::new(config, Arc::new(WsConnector))
    }

    /// Bearer credential sent with every subsequent connection attempt.
    pub fn set_credential(&self, token: impl Into<String>) {
        *self
            .inner
            .credential
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    pub fn state(&self) -> ChannelState {
        self.inner.session().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.session().attempts
    }

    /// Opens the channel and enables automatic reconnection.
    ///
    /// Resolves once the connection is open. Fails with
    /// [`ChannelError::ConnectInProgress`] while another attempt is in
    /// flight; a failed attempt schedules a reconnect before returning.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        Inner::connect(Arc::clone(&self.inner)).await
    }

    /// Closes the channel and cancels keep-alive and pending reconnects.
    /// Safe to call any number of times.
    pub fn disconnect(&self) {
        let was_connected = {
            let mut session = self.inner.session();
            session.auto_reconnect = false;
            session.epoch += 1;
            for handle in [
                session.reader.take(),
                session.keepalive.take(),
                session.reconnect.take(),
            ]
            .into_iter()
            .flatten()
            {
                handle.abort();
            }
            session.outbound = None;
            std::mem::replace(&mut session.state, ChannelState::Disconnected)
                != ChannelState::Disconnected
        };

        if was_connected {
            info!("channel disconnected");
            self.inner.registry.emit(events::DISCONNECTED, &Value::Null);
        }
    }

    /// Sends `envelope` if the channel is open. Messages are never queued:
    /// when closed this logs a warning and returns false.
    pub fn send(&self, envelope: &Envelope) -> bool {
        let outbound = {
            let session = self.inner.session();
            match session.state {
                ChannelState::Open => session.outbound.clone(),
                _ => None,
            }
        };

        let Some(outbound) = outbound else {
            warn!(event = %envelope.kind, "channel not open; message dropped");
            return false;
        };

        match serde_json::to_string(envelope) {
            Ok(text) => outbound.send(text).is_ok(),
            Err(err) => {
                warn!(event = %envelope.kind, error = %err, "failed to encode envelope");
                false
            }
        }
    }

    /// Registers `handler` for `event`. Remote events receive the envelope's
    /// `data` (or `null`); `message` receives every whole envelope.
    pub fn on<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.inner.registry.add(event, Arc::new(handler));
        Subscription::new(&self.inner.registry, event, id)
    }

    /// Like [`Channel::on`], decoding the payload first. Payloads of the
    /// wrong shape are logged and skipped.
    pub fn on_typed<T, F>(&self, event: &str, handler: F) -> Subscription
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        let name = event.to_string();
        self.on(event, move |payload| {
            match serde_json::from_value::<T>(payload.clone()) {
                Ok(value) => handler(value),
                Err(err) => warn!(event = %name, error = %err, "unexpected event payload"),
            }
        })
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.inner.registry.handler_count(event)
    }
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn url(&self) -> String {
        let credential = self
            .credential
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match credential {
            Some(token) => {
                let separator = if self.config.url.contains('?') { '&' } else { '?' };
                format!("{}{separator}token={token}", self.config.url)
            }
            None => self.config.url.clone(),
        }
    }

    // Boxed: connect -> schedule_reconnect -> connect recurses.
    fn connect(inner: Arc<Inner>) -> BoxFuture<'static, Result<(), ChannelError>> {
        async move {
            let epoch = {
                let mut session = inner.session();
                match session.state {
                    ChannelState::Open => return Ok(()),
                    ChannelState::Connecting => return Err(ChannelError::ConnectInProgress),
                    ChannelState::Disconnected => {}
                }
                session.state = ChannelState::Connecting;
                session.auto_reconnect = true;
                session.epoch += 1;
                session.epoch
            };

            debug!(url = %inner.config.url, epoch, "opening channel");

            match inner.connector.open(&inner.url()).await {
                Ok(connection) => Inner::opened(&inner, epoch, connection),
                Err(err) => {
                    {
                        let mut session = inner.session();
                        if session.epoch != epoch {
                            return Err(ChannelError::Aborted);
                        }
                        session.state = ChannelState::Disconnected;
                    }

                    warn!(error = %err, "channel connection failed");
                    inner
                        .registry
                        .emit(events::ERROR, &json!({ "message": err.to_string() }));
                    Inner::schedule_reconnect(&inner);
                    Err(err)
                }
            }
        }
        .boxed()
    }

    fn opened(inner: &Arc<Inner>, epoch: u64, connection: Connection) -> Result<(), ChannelError> {
        let Connection { outbound, inbound } = connection;

        {
            let mut session = inner.session();
            if session.epoch != epoch {
                return Err(ChannelError::Aborted);
            }
            session.state = ChannelState::Open;
            session.attempts = 0;
            session.keepalive = Some(spawn_keepalive(outbound.clone(), inner.config.ping_interval));
            session.outbound = Some(outbound);
            // May be the task running this very call; detach instead of abort.
            session.reconnect = None;
        }

        info!("channel open");
        inner.registry.emit(events::CONNECTED, &Value::Null);

        let reader = tokio::spawn(Inner::read_loop(Arc::clone(inner), epoch, inbound));
        let mut session = inner.session();
        if session.epoch == epoch {
            session.reader = Some(reader);
        } else {
            reader.abort();
        }
        Ok(())
    }

    async fn read_loop(inner: Arc<Inner>, epoch: u64, mut inbound: mpsc::UnboundedReceiver<Frame>) {
        while let Some(frame) = inbound.recv().await {
            let text = match frame {
                Frame::Text(text) => text,
                Frame::Binary(_) => {
                    debug!(reason = ?IgnoredFrame::Binary, "inbound frame ignored");
                    continue;
                }
            };

            match classify_text(&text) {
                Inbound::Envelope(envelope) => inner.dispatch(&envelope),
                Inbound::Ignored(reason) => debug!(?reason, "inbound frame ignored"),
            }
        }

        Inner::closed(&inner, epoch);
    }

    fn dispatch(&self, envelope: &Envelope) {
        let payload = envelope.data.clone().unwrap_or(Value::Null);
        self.registry.emit(&envelope.kind, &payload);

        match serde_json::to_value(envelope) {
            Ok(whole) => self.registry.emit(events::MESSAGE, &whole),
            Err(err) => warn!(event = %envelope.kind, error = %err, "failed to re-encode envelope"),
        }
    }

    fn closed(inner: &Arc<Inner>, epoch: u64) {
        {
            let mut session = inner.session();
            if session.epoch != epoch {
                return;
            }
            session.state = ChannelState::Disconnected;
            session.outbound = None;
            session.reader = None;
            if let Some(keepalive) = session.keepalive.take() {
                keepalive.abort();
            }
        }

        warn!("channel closed unexpectedly");
        inner.registry.emit(events::DISCONNECTED, &Value::Null);
        Inner::schedule_reconnect(inner);
    }

    fn schedule_reconnect(inner: &Arc<Inner>) {
        let mut session = inner.session();
        if !session.auto_reconnect {
            return;
        }

        let max = inner.config.max_reconnect_attempts;
        if session.attempts >= max {
            drop(session);
            warn!(attempts = max, "giving up on reconnecting");
            inner.registry.emit(
                events::MAX_RECONNECTS_REACHED,
                &json!({ "attempts": max }),
            );
            return;
        }

        let attempt = session.attempts;
        let epoch = session.epoch;
        let delay = backoff_delay(inner.config.reconnect_base, inner.config.reconnect_max, attempt);
        let task_inner = Arc::clone(inner);

        session.reconnect = Some(tokio::spawn(async move {
            sleep(delay).await;
            {
                let mut session = task_inner.session();
                if session.epoch != epoch || !session.auto_reconnect {
                    return;
                }
                session.attempts += 1;
            }

            if let Err(err) = Inner::connect(task_inner).await {
                debug!(error = %err, "reconnect attempt failed");
            }
        }));

        info!(
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
    }
}

fn spawn_keepalive(outbound: mpsc::UnboundedSender<String>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;

            let text = match serde_json::to_string(&Envelope::ping()) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "failed to encode keep-alive");
                    continue;
                }
            };

            if outbound.send(text).is_err() {
                break;
            }
            trace!("keep-alive sent");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_the_cap() {
        let base = Duration::from_millis(3000);
        let cap = Duration::from_millis(30_000);

        let delays: Vec<u128> = (0..6)
            .map(|attempt| backoff_delay(base, cap, attempt).as_millis())
            .collect();

        assert_eq!(delays, vec![3000, 6000, 12_000, 24_000, 30_000, 30_000]);
        assert_eq!(backoff_delay(base, cap, 40), cap);
    }
}
