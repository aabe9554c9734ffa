#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use order_sync::client::channel::{Channel, Connection, Connector, Frame};
use order_sync::client::error::ChannelError;
use order_sync::models::envelope::Envelope;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Server side of one fake connection.
pub struct RemoteEnd {
    pub url: String,
    pub from_device: mpsc::UnboundedReceiver<String>,
    pub to_device: mpsc::UnboundedSender<Frame>,
}

impl RemoteEnd {
    pub fn push(&self, envelope: &Envelope) {
        self.push_text(&serde_json::to_string(envelope).unwrap());
    }

    pub fn push_text(&self, text: &str) {
        self.to_device.send(Frame::Text(text.to_string())).unwrap();
    }

    pub fn push_binary(&self, bytes: &[u8]) {
        self.to_device.send(Frame::Binary(bytes.to_vec())).unwrap();
    }

    pub async fn next_envelope(&mut self) -> Envelope {
        let text = tokio::time::timeout(Duration::from_secs(2), self.from_device.recv())
            .await
            .expect("device sent nothing")
            .expect("device closed the connection");
        serde_json::from_str(&text).unwrap()
    }
}

/// Scriptable connector: each open consumes one scripted outcome, falling
/// back to `default_ok` when the script is empty.
pub struct FakeConnector {
    script: Mutex<VecDeque<bool>>,
    default_ok: bool,
    open_delay: Duration,
    pub opens: AtomicUsize,
    opened_at: Mutex<Vec<Instant>>,
    remotes: mpsc::UnboundedSender<RemoteEnd>,
}

impl FakeConnector {
    pub fn new(default_ok: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        Self::with_delay(default_ok, Duration::ZERO)
    }

    pub fn with_delay(
        default_ok: bool,
        open_delay: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (remotes, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                default_ok,
                open_delay,
                opens: AtomicUsize::new(0),
                opened_at: Mutex::new(Vec::new()),
                remotes,
            }),
            rx,
        )
    }

    pub fn script(&self, outcomes: &[bool]) {
        self.script.lock().unwrap().extend(outcomes.iter().copied());
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Time between consecutive open attempts.
    pub fn gaps(&self) -> Vec<Duration> {
        self.opened_at
            .lock()
            .unwrap()
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, url: &str) -> Result<Connection, ChannelError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.opened_at.lock().unwrap().push(Instant::now());
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }

        let ok = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_ok);
        if !ok {
            return Err(ChannelError::Connect("connection refused".to_string()));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let _ = self.remotes.send(RemoteEnd {
            url: url.to_string(),
            from_device: outbound_rx,
            to_device: inbound_tx,
        });

        Ok(Connection::new(outbound_tx, inbound_rx))
    }
}

/// Collects every payload delivered for `event`.
pub fn record(channel: &Channel, event: &str) -> Arc<Mutex<Vec<Value>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _subscription = channel.on(event, move |payload| {
        sink.lock().unwrap().push(payload.clone());
    });
    seen
}

pub fn count(seen: &Arc<Mutex<Vec<Value>>>) -> usize {
    seen.lock().unwrap().len()
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
