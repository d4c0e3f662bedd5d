use super::proto::{node_message, ConfigUpdate, NodeMessage};
use super::version::compatible_version;
use super::{ConfigEnvelope, ControlPlane};
use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use prost::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

/// Version advertised by this control plane for the major.minor gate.
pub const CONTROL_PLANE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A node must send its ConnectRequest within this window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type NodeFrames = Framed<TcpStream, LengthDelimitedCodec>;

/// Accept config-sync streams until shutdown. Each connection runs the
/// handshake → register → serve loop in its own task.
pub async fn run_control_listener(
    listen: &str,
    plane: Arc<ControlPlane>,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("control: listening, addr={}", addr);

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("control: listener shutting down");
                return Ok(());
            }
        };

        let (stream, peer) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("control: accept failed, error={}", e);
                continue;
            }
        };

        let plane = plane.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match handle_stream(stream, plane, shutdown).await {
                Ok(()) => debug!("control: stream closed, peer={}", peer),
                Err(e) => warn!("control: stream rejected, peer={}, reason={}", peer, e),
            }
        });
    }
}

/// One data-plane stream: handshake, version gate, registration, then the
/// heartbeat/update loop. A client disconnect is a normal exit, not an
/// error.
pub(crate) async fn handle_stream(
    stream: TcpStream,
    plane: Arc<ControlPlane>,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    // Handshake: the first frame must be a ConnectRequest.
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
        .await
        .context("handshake timeout")?
        .context("stream closed before handshake")?
        .context("handshake read failed")?;
    let connect = match NodeMessage::decode(&first[..]) {
        Ok(NodeMessage {
            kind: Some(node_message::Kind::Connect(connect)),
        }) => connect,
        Ok(_) => bail!("invalid argument: first message must be ConnectRequest"),
        Err(e) => bail!("invalid argument: undecodable handshake: {}", e),
    };

    if !compatible_version(CONTROL_PLANE_VERSION, &connect.version) {
        metrics::counter!("gateway_control_version_rejected_total").increment(1);
        bail!(
            "version mismatch: control plane {} vs node {}",
            CONTROL_PLANE_VERSION,
            connect.version
        );
    }

    let node_id = connect.node_id.clone();
    info!(
        "control: node connected, node_id={}, hostname={}, version={}",
        node_id, connect.hostname, connect.version
    );
    metrics::gauge!("gateway_control_connected_nodes").increment(1.0);

    // Subscribe to the version watch before snapshotting the envelope: a
    // push landing between the two is then observed as a wake, never lost.
    let mut version_rx = plane.subscribe();
    let current = plane.register_node(
        &node_id,
        &connect.hostname,
        &connect.version,
        connect.config_hash,
    );

    let result = serve_registered(
        &mut framed,
        &plane,
        &node_id,
        connect.config_hash,
        current,
        &mut version_rx,
        &shutdown,
    )
    .await;

    plane.remove_node(&node_id);
    metrics::gauge!("gateway_control_connected_nodes").decrement(1.0);
    result
}

async fn serve_registered(
    framed: &mut NodeFrames,
    plane: &ControlPlane,
    node_id: &str,
    node_config_hash: u64,
    current: std::sync::Arc<ConfigEnvelope>,
    version_rx: &mut tokio::sync::watch::Receiver<u64>,
    shutdown: &Notify,
) -> Result<()> {
    let mut last_sent_version = 0u64;

    // Initial sync if the node's config differs from ours.
    if current.hash != node_config_hash && !current.yaml.is_empty() {
        send_update(framed, &current).await?;
        last_sent_version = current.version;
        plane.record_sent(node_id, last_sent_version);
    }

    serve_loop(framed, plane, node_id, version_rx, &mut last_sent_version, shutdown).await
}

async fn serve_loop(
    framed: &mut NodeFrames,
    plane: &ControlPlane,
    node_id: &str,
    version_rx: &mut tokio::sync::watch::Receiver<u64>,
    last_sent_version: &mut u64,
    shutdown: &Notify,
) -> Result<()> {
    loop {
        tokio::select! {
            changed = version_rx.changed() => {
                if changed.is_err() {
                    // Control plane dropped; close the stream.
                    return Ok(());
                }
                let current = plane.current_config();
                if current.version > *last_sent_version {
                    send_update(framed, &current).await?;
                    *last_sent_version = current.version;
                    plane.record_sent(node_id, *last_sent_version);
                }
            }
            frame = framed.next() => {
                let Some(frame) = frame else {
                    debug!("control: node disconnected, node_id={}", node_id);
                    return Ok(());
                };
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("control: read error, node_id={}, error={}", node_id, e);
                        return Ok(());
                    }
                };
                match NodeMessage::decode(&frame[..]) {
                    Ok(NodeMessage { kind: Some(node_message::Kind::Heartbeat(hb)) }) => {
                        plane.record_heartbeat(
                            &hb.node_id,
                            hb.config_version,
                            hb.config_hash,
                            &hb.node_status,
                        );
                        metrics::counter!("gateway_control_heartbeats_total").increment(1);
                    }
                    Ok(NodeMessage { kind: Some(node_message::Kind::Connect(_)) }) => {
                        debug!("control: duplicate connect ignored, node_id={}", node_id);
                    }
                    Ok(NodeMessage { kind: None }) => {}
                    Err(e) => {
                        debug!("control: undecodable frame, node_id={}, error={}", node_id, e);
                    }
                }
            }
            _ = shutdown.notified() => return Ok(()),
        }
    }
}

async fn send_update(framed: &mut NodeFrames, envelope: &ConfigEnvelope) -> Result<()> {
    let update = ConfigUpdate {
        version: envelope.version,
        yaml: envelope.yaml.to_vec(),
        hash: envelope.hash,
        timestamp: envelope.timestamp.timestamp(),
        source: envelope.source.as_str().to_string(),
    };
    framed
        .send(update.encode_to_vec().into())
        .await
        .context("sending config update")?;
    metrics::counter!("gateway_control_updates_sent_total").increment(1);
    Ok(())
}
