use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::client::error::ChannelError;

/// A frame as delivered by the transport, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// One open transport connection. Dropping `outbound` closes it; `inbound`
/// ends when the peer goes away.
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

impl Connection {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<Frame>,
    ) -> Self {
        Self { outbound, inbound }
    }
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<Connection, ChannelError>;
}

/// WebSocket transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<Connection, ChannelError> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|err| ChannelError::Connect(err.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Frame>();

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = sink.send(Message::Text(text)).await {
                    debug!(error = %err, "websocket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let frame = match message {
                    Ok(Message::Text(text)) => Frame::Text(text),
                    Ok(Message::Binary(bytes)) => Frame::Binary(bytes),
                    Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                    Ok(Message::Close(_)) => break,
                    Err(err) => {
                        debug!(error = %err, "websocket read failed");
                        break;
                    }
                };

                if inbound_tx.send(frame).is_err() {
                    break;
                }
            }
        });

        Ok(Connection::new(outbound_tx, inbound_rx))
    }
}
