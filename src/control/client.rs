use super::proto::{node_message, ConfigUpdate, ConnectRequest, HeartbeatRequest, NodeMessage};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use prost::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{info, warn};

/// Delay between reconnect attempts after a lost stream.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Data-plane side of the config sync protocol.
///
/// Maintains one stream to the control plane: ConnectRequest handshake,
/// periodic heartbeats carrying the config version this node runs, and
/// inbound `ConfigUpdate`s forwarded to the consumer channel. The stream
/// reconnects with backoff until `shutdown` fires.
pub struct ControlPlaneClient {
    addr: String,
    node_id: String,
    version: String,
    heartbeat_interval: Duration,
}

impl ControlPlaneClient {
    pub fn new(
        addr: impl Into<String>,
        node_id: impl Into<String>,
        version: impl Into<String>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            addr: addr.into(),
            node_id: node_id.into(),
            version: version.into(),
            heartbeat_interval,
        }
    }

    /// Run until shutdown, sending received envelopes to `updates`.
    pub async fn run(
        &self,
        updates: mpsc::Sender<ConfigUpdate>,
        shutdown: Arc<Notify>,
    ) -> Result<()> {
        let mut applied_version = 0u64;
        let mut applied_hash = 0u64;

        loop {
            match self
                .run_stream(&updates, &shutdown, &mut applied_version, &mut applied_hash)
                .await
            {
                Ok(StreamExit::Shutdown) => return Ok(()),
                Ok(StreamExit::Disconnected) => {
                    warn!("control client: stream ended, reconnecting");
                }
                Err(e) => {
                    warn!("control client: stream failed: {}, reconnecting", e);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                _ = shutdown.notified() => return Ok(()),
            }
        }
    }

    async fn run_stream(
        &self,
        updates: &mpsc::Sender<ConfigUpdate>,
        shutdown: &Notify,
        applied_version: &mut u64,
        applied_hash: &mut u64,
    ) -> Result<StreamExit> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("connecting to control plane at {}", self.addr))?;
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();

        let connect = NodeMessage {
            kind: Some(node_message::Kind::Connect(ConnectRequest {
                node_id: self.node_id.clone(),
                hostname,
                version: self.version.clone(),
                config_hash: *applied_hash,
            })),
        };
        framed
            .send(connect.encode_to_vec().into())
            .await
            .context("sending connect request")?;
        info!("control client: connected to {}", self.addr);

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let message = NodeMessage {
                        kind: Some(node_message::Kind::Heartbeat(HeartbeatRequest {
                            node_id: self.node_id.clone(),
                            config_version: *applied_version,
                            config_hash: *applied_hash,
                            node_status: "ok".into(),
                        })),
                    };
                    framed
                        .send(message.encode_to_vec().into())
                        .await
                        .context("sending heartbeat")?;
                }
                frame = framed.next() => {
                    let Some(frame) = frame else {
                        return Ok(StreamExit::Disconnected);
                    };
                    let frame = frame.context("reading config stream")?;
                    let update = ConfigUpdate::decode(&frame[..])
                        .context("decoding config update")?;
                    info!(
                        "control client: config update, version={}, source={}",
                        update.version, update.source
                    );
                    *applied_version = update.version;
                    *applied_hash = update.hash;
                    if updates.send(update).await.is_err() {
                        // Consumer gone; nothing left to sync for.
                        return Ok(StreamExit::Shutdown);
                    }
                }
                _ = shutdown.notified() => return Ok(StreamExit::Shutdown),
            }
        }
    }
}

enum StreamExit {
    Shutdown,
    Disconnected,
}
