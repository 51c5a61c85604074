//! ---
//! vdev_section: "04-transport"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "MQTT 3.1.1 packet codec and client transport."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use vdev_msg::{DeliveryAck, Transport, TransportError, TransportEvent, TransportEvents};

use crate::packet::{Connect, Packet, PacketError, Publish};

const SUBACK_FAILURE: u8 = 0x80;

impl From<PacketError> for TransportError {
    fn from(err: PacketError) -> Self {
        TransportError::Protocol(err.to_string())
    }
}

/// Broker endpoint and session parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Zero disables keep-alive pings.
    pub keep_alive: Duration,
    /// Budget for TCP connect plus CONNACK, and for each SUBACK.
    pub response_timeout: Duration,
}

impl MqttOptions {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(60),
            response_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}

type PendingSubacks = Arc<Mutex<HashMap<u16, oneshot::Sender<Vec<u8>>>>>;

struct Outgoing {
    packet: Packet,
    done: Option<oneshot::Sender<Result<(), TransportError>>>,
}

struct Session {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    events: mpsc::UnboundedSender<TransportEvent>,
    pending: PendingSubacks,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// MQTT 3.1.1 client over plain TCP, QoS 0 only.
///
/// Publishes are acknowledged once the frame has been flushed to the socket.
pub struct MqttTransport {
    options: MqttOptions,
    session: Mutex<Option<Session>>,
    next_packet_id: AtomicU16,
    next_ack: AtomicU64,
}

impl MqttTransport {
    pub fn new(options: MqttOptions) -> Self {
        Self {
            options,
            session: Mutex::new(None),
            next_packet_id: AtomicU16::new(1),
            next_ack: AtomicU64::new(1),
        }
    }

    pub fn options(&self) -> &MqttOptions {
        &self.options
    }

    fn packet_id(&self) -> u16 {
        loop {
            let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn handles(
        &self,
    ) -> Result<
        (
            mpsc::UnboundedSender<Outgoing>,
            mpsc::UnboundedSender<TransportEvent>,
            PendingSubacks,
        ),
        TransportError,
    > {
        self.session
            .lock()
            .as_ref()
            .map(|session| {
                (
                    session.outgoing.clone(),
                    session.events.clone(),
                    session.pending.clone(),
                )
            })
            .ok_or(TransportError::NotConnected)
    }

    async fn send(
        outgoing: &mpsc::UnboundedSender<Outgoing>,
        packet: Packet,
    ) -> Result<(), TransportError> {
        let (done, flushed) = oneshot::channel();
        outgoing
            .send(Outgoing {
                packet,
                done: Some(done),
            })
            .map_err(|_| TransportError::Closed)?;
        flushed.await.map_err(|_| TransportError::Closed)?
    }

    async fn handshake(&self) -> Result<(TcpStream, BytesMut), TransportError> {
        let address = format!("{}:{}", self.options.host, self.options.port);
        let mut stream = TcpStream::connect(&address).await?;
        stream.set_nodelay(true)?;

        let keep_alive = u16::try_from(self.options.keep_alive.as_secs()).unwrap_or(u16::MAX);
        let connect = Packet::Connect(Connect {
            client_id: self.options.client_id.clone(),
            keep_alive,
            clean_session: true,
            username: self.options.username.clone(),
            password: self.options.password.clone().map(String::into_bytes),
        });
        let mut frame = BytesMut::new();
        connect.encode(&mut frame)?;
        stream.write_all(&frame).await?;
        stream.flush().await?;

        let mut buffer = BytesMut::with_capacity(4096);
        loop {
            if let Some(packet) = Packet::decode(&mut buffer)? {
                return match packet {
                    Packet::ConnAck { code: 0, .. } => Ok((stream, buffer)),
                    Packet::ConnAck { code, .. } => Err(TransportError::Refused(
                        connack_reason(code).to_owned(),
                    )),
                    other => Err(TransportError::Protocol(format!(
                        "expected CONNACK, got {}",
                        other.name()
                    ))),
                };
            }
            if stream.read_buf(&mut buffer).await? == 0 {
                return Err(TransportError::Closed);
            }
        }
    }
}

fn connack_reason(code: u8) -> &'static str {
    match code {
        1 => "unacceptable protocol version",
        2 => "identifier rejected",
        3 => "server unavailable",
        4 => "bad user name or password",
        5 => "not authorized",
        _ => "unknown return code",
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self) -> Result<TransportEvents, TransportError> {
        if self.session.lock().is_some() {
            self.disconnect().await?;
        }
        let (stream, buffer) =
            tokio::time::timeout(self.options.response_timeout, self.handshake())
                .await
                .map_err(|_| TransportError::Timeout("CONNACK"))??;
        info!(
            host = %self.options.host,
            port = self.options.port,
            client_id = %self.options.client_id,
            "mqtt session established"
        );

        let (read_half, write_half) = stream.into_split();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let pending = PendingSubacks::default();

        let _ = events_tx.send(TransportEvent::Connected);
        let writer = tokio::spawn(run_writer(write_half, outgoing_rx, self.options.keep_alive));
        let reader = tokio::spawn(run_reader(
            read_half,
            buffer,
            events_tx.clone(),
            outgoing_tx.clone(),
            pending.clone(),
        ));

        *self.session.lock() = Some(Session {
            outgoing: outgoing_tx,
            events: events_tx,
            pending,
            reader,
            writer,
        });
        Ok(events_rx)
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let (outgoing, _, pending) = self.handles()?;
        let packet_id = self.packet_id();
        let (tx, suback) = oneshot::channel();
        pending.lock().insert(packet_id, tx);

        Self::send(
            &outgoing,
            Packet::Subscribe {
                packet_id,
                filters: vec![(topic.to_owned(), 0)],
            },
        )
        .await?;
        let codes = tokio::time::timeout(self.options.response_timeout, suback)
            .await
            .map_err(|_| {
                pending.lock().remove(&packet_id);
                TransportError::Timeout("SUBACK")
            })?
            .map_err(|_| TransportError::Closed)?;
        if codes.first().map_or(true, |code| *code == SUBACK_FAILURE) {
            return Err(TransportError::Refused(format!(
                "subscription to {topic} rejected"
            )));
        }
        debug!(topic, packet_id, "subscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<DeliveryAck, TransportError> {
        let (outgoing, events, _) = self.handles()?;
        Self::send(
            &outgoing,
            Packet::Publish(Publish::at_most_once(topic, Bytes::from(payload))),
        )
        .await?;
        let ack = DeliveryAck {
            id: self.next_ack.fetch_add(1, Ordering::Relaxed),
        };
        let _ = events.send(TransportEvent::Published(ack));
        Ok(ack)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };
        session.reader.abort();
        if let Err(err) = Self::send(&session.outgoing, Packet::Disconnect).await {
            debug!(error = %err, "DISCONNECT not sent");
        }
        drop(session.outgoing);
        let _ = session.writer.await;
        let _ = session.events.send(TransportEvent::Disconnected { reason: None });
        info!(client_id = %self.options.client_id, "mqtt session closed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}

async fn write_packet(writer: &mut OwnedWriteHalf, packet: &Packet) -> Result<(), TransportError> {
    let mut frame = BytesMut::new();
    packet.encode(&mut frame)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    trace!(packet = packet.name(), bytes = frame.len(), "sent");
    Ok(())
}

async fn run_writer(
    mut writer: OwnedWriteHalf,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    keep_alive: Duration,
) {
    let pinging = !keep_alive.is_zero();
    let period = if pinging { keep_alive } else { Duration::from_secs(3600) };
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            next = outgoing.recv() => {
                let Some(Outgoing { packet, done }) = next else { break };
                let result = write_packet(&mut writer, &packet).await;
                let stop = matches!(packet, Packet::Disconnect) || result.is_err();
                if let Err(err) = &result {
                    warn!(packet = packet.name(), error = %err, "write failed");
                }
                if let Some(done) = done {
                    let _ = done.send(result);
                }
                if stop {
                    break;
                }
            }
            _ = ping.tick(), if pinging => {
                if let Err(err) = write_packet(&mut writer, &Packet::PingReq).await {
                    warn!(error = %err, "keep-alive ping failed");
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn run_reader(
    mut reader: OwnedReadHalf,
    mut buffer: BytesMut,
    events: mpsc::UnboundedSender<TransportEvent>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    pending: PendingSubacks,
) {
    let reason = loop {
        match Packet::decode(&mut buffer) {
            Ok(Some(packet)) => {
                trace!(packet = packet.name(), "received");
                match packet {
                    Packet::Publish(publish) => {
                        if let Some(packet_id) = publish.packet_id.filter(|_| publish.qos == 1) {
                            let _ = outgoing.send(Outgoing {
                                packet: Packet::PubAck { packet_id },
                                done: None,
                            });
                        }
                        let _ = events.send(TransportEvent::Message {
                            topic: publish.topic,
                            payload: publish.payload.to_vec(),
                        });
                    }
                    Packet::SubAck { packet_id, codes } => {
                        if let Some(waiter) = pending.lock().remove(&packet_id) {
                            let _ = waiter.send(codes);
                        }
                    }
                    Packet::PingResp => {}
                    other => debug!(packet = other.name(), "ignoring unexpected packet"),
                }
                continue;
            }
            Ok(None) => {}
            Err(err) => break err.to_string(),
        }
        match reader.read_buf(&mut buffer).await {
            Ok(0) => break "connection closed by broker".to_owned(),
            Ok(_) => {}
            Err(err) => break err.to_string(),
        }
    };
    warn!(%reason, "mqtt session lost");
    pending.lock().clear();
    let _ = events.send(TransportEvent::Disconnected {
        reason: Some(reason),
    });
}
