//! WebSocket transport for the bridge: text frames carry the configuration, binary frames carry
//! IP packets in both directions.

use std::sync::Arc;

use anyhow::Context as _;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use wst_net_bridge::{BridgeError, ChannelMessage, NetContext, SmolFactory};

pub struct Session {
    ctx: Arc<NetContext>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Session {
    /// Open the WebSocket and start pumping messages.
    pub async fn connect(remote: &str) -> anyhow::Result<Self> {
        let (ws, _response) = tokio_tungstenite::connect_async(remote)
            .await
            .with_context(|| format!("connect to {remote}"))?;
        tracing::info!(%remote, "websocket opened");
        Ok(Self::start(ws))
    }

    /// Drive a bridge over an already-established message stream.
    pub fn start<S>(ws: S) -> Self
    where
        S: Stream<Item = Result<Message, tungstenite::Error>>
            + Sink<Message, Error = tungstenite::Error>
            + Send
            + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut outbound) = mpsc::unbounded_channel::<Vec<u8>>();
        let ctx = NetContext::new(Arc::new(tx), SmolFactory);

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                if let Err(err) = sink.send(Message::Binary(frame.into())).await {
                    tracing::warn!(%err, "websocket send failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_ctx = ctx.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(err) => {
                        tracing::error!(%err, "websocket error");
                        break;
                    }
                };
                let inbound = match message {
                    Message::Text(text) => ChannelMessage::Control(text.as_str().to_string()),
                    Message::Binary(data) => ChannelMessage::Data(data.to_vec()),
                    Message::Close(frame) => {
                        tracing::info!(?frame, "websocket closed");
                        break;
                    }
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                };
                match reader_ctx.handle_message(inbound) {
                    Ok(_) => {}
                    Err(err @ BridgeError::ProtocolViolation(_)) => {
                        tracing::error!(%err, "closing tunnel");
                        break;
                    }
                    Err(err) => tracing::warn!(%err, "dropping channel message"),
                }
            }
            tracing::info!("websocket reader finished");
        });

        Self {
            ctx,
            reader,
            writer,
        }
    }

    pub fn context(&self) -> &Arc<NetContext> {
        &self.ctx
    }

    /// Whether the inbound half has stopped (peer closed, error or protocol violation).
    pub fn is_finished(&self) -> bool {
        self.reader.is_finished()
    }

    pub fn shutdown(self) {
        self.reader.abort();
        self.writer.abort();
    }
}
