//! In-process device simulator for the integration tests.
//!
//! The simulator listens on an ephemeral loopback port, decodes every frame a
//! client sends and answers through a test-supplied responder. Status pushes
//! and forced disconnects are broadcast to all live connections.

#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tuya_vacuum::protocol::{HEADER_LEN, TuyaMessage, pack_message, parse_header};
use tuya_vacuum::{
    CommandType, DeviceConfig, Packet, PacketCodec, Timing, Version,
};

pub const DEVICE_ID: &str = "bf_test_vacuum_01";
pub const LOCAL_KEY: &str = "0123456789abcdef";
pub const WRONG_KEY: &str = "fedcba9876543210";

/// Frames to send back for one received frame.
pub type Responder = Arc<dyn Fn(&Packet) -> Vec<Packet> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Received {
    /// Zero-based index of the TCP connection the frame arrived on.
    pub connection: usize,
    pub packet: Packet,
}

#[derive(Debug, Clone)]
enum MockEvent {
    Push(Packet),
    Disconnect,
}

pub struct MockDevice {
    pub port: u16,
    received: Arc<Mutex<Vec<Received>>>,
    connections: Arc<AtomicUsize>,
    events: broadcast::Sender<MockEvent>,
    task: JoinHandle<()>,
}

impl MockDevice {
    pub async fn start(version: Version, responder: Responder) -> Self {
        Self::start_with_key(version, LOCAL_KEY, responder).await
    }

    /// Starts a device whose own frames are encrypted with `key`.
    pub async fn start_with_key(version: Version, key: &str, responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let codec = PacketCodec::new(key.as_bytes(), version).unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let (events, _) = broadcast::channel(64);

        let task = {
            let received = received.clone();
            let connections = connections.clone();
            let events = events.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    let index = connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(
                        stream,
                        index,
                        codec.clone(),
                        responder.clone(),
                        received.clone(),
                        events.subscribe(),
                    ));
                }
            })
        };

        Self {
            port,
            received,
            connections,
            events,
            task,
        }
    }

    pub fn device_config(&self, version: Version) -> DeviceConfig {
        DeviceConfig::new("127.0.0.1", DEVICE_ID, LOCAL_KEY, version)
            .unwrap()
            .with_port(self.port)
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().clone()
    }

    pub fn received_cmd(&self, cmd: CommandType) -> Vec<Received> {
        self.received()
            .into_iter()
            .filter(|r| r.packet.cmd == cmd as u32)
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Sends an unsolicited STATUS frame with `dps` to every live connection.
    pub fn push(&self, dps: Value) {
        let packet = Packet {
            seqno: 0,
            cmd: CommandType::Status as u32,
            retcode: Some(0),
            payload: json!({ "devId": DEVICE_ID, "dps": dps, "t": 1700000000 }),
        };
        let _ = self.events.send(MockEvent::Push(packet));
    }

    /// Closes every live connection.
    pub fn disconnect_all(&self) {
        let _ = self.events.send(MockEvent::Disconnect);
    }

    pub async fn wait_for_connections(&self, n: usize) {
        wait_until(Duration::from_secs(5), || self.connection_count() >= n).await;
        // Let the accepted connection subscribe to events.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    pub async fn wait_for_cmd(&self, cmd: CommandType, n: usize) -> Vec<Received> {
        wait_until(Duration::from_secs(5), || self.received_cmd(cmd).len() >= n).await;
        self.received_cmd(cmd)
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.task.abort();
        let _ = self.events.send(MockEvent::Disconnect);
    }
}

async fn serve(
    mut stream: TcpStream,
    connection: usize,
    codec: PacketCodec,
    responder: Responder,
    received: Arc<Mutex<Vec<Received>>>,
    mut events: broadcast::Receiver<MockEvent>,
) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        tokio::select! {
            n = stream.read(&mut chunk) => {
                let n = match n {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                buffer.extend_from_slice(&chunk[..n]);
                while let Some(frame) = take_frame(&mut buffer) {
                    let Ok(packet) = codec.decode(&frame) else {
                        continue;
                    };
                    received.lock().push(Received {
                        connection,
                        packet: packet.clone(),
                    });
                    for out in responder(&packet) {
                        let bytes = encode_device_frame(&codec, &out);
                        if stream.write_all(&bytes).await.is_err() {
                            return;
                        }
                    }
                }
            }
            event = events.recv() => match event {
                Ok(MockEvent::Push(packet)) => {
                    let bytes = codec.encode_packet(&packet).unwrap();
                    if stream.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                Ok(MockEvent::Disconnect) | Err(broadcast::error::RecvError::Closed) => return,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
        }
    }
}

/// Rejections with a text body go out unencrypted, like firmware error replies.
fn encode_device_frame(codec: &PacketCodec, packet: &Packet) -> Vec<u8> {
    match (&packet.payload, packet.retcode) {
        (Value::String(text), Some(code)) if code != 0 => pack_message(&TuyaMessage {
            seqno: packet.seqno,
            cmd: packet.cmd,
            retcode: packet.retcode,
            payload: text.as_bytes().to_vec(),
        })
        .unwrap(),
        _ => codec.encode_packet(packet).unwrap(),
    }
}

fn take_frame(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    if buffer.len() < HEADER_LEN {
        return None;
    }
    let total = parse_header(buffer).ok()?.total_length as usize;
    if buffer.len() < total {
        return None;
    }
    Some(buffer.drain(..total).collect())
}

/// Polls `cond` every 10ms until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + limit;
    while !cond() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Acknowledges `req` with a retcode and optional JSON body.
pub fn reply(req: &Packet, retcode: u32, payload: Value) -> Packet {
    Packet {
        seqno: req.seqno,
        cmd: req.cmd,
        retcode: Some(retcode),
        payload,
    }
}

/// Rejects `req` with a plaintext error body such as `"json obj data unvalid"`.
pub fn reject_with_text(req: &Packet, retcode: u32, text: &str) -> Packet {
    reply(req, retcode, Value::String(text.into()))
}

/// Answers DP_QUERY with `dps`, acknowledges everything else.
pub fn answering(dps: Value) -> Responder {
    Arc::new(move |req: &Packet| {
        if req.cmd == CommandType::DpQuery as u32 {
            vec![reply(
                req,
                0,
                json!({ "devId": DEVICE_ID, "dps": dps.clone() }),
            )]
        } else {
            vec![reply(req, 0, Value::Null)]
        }
    })
}

/// Data points held by [`simulated`] devices.
pub type SharedDps = Arc<Mutex<serde_json::Map<String, Value>>>;

/// Behaves like firmware: CONTROL writes into the data points, DP_QUERY
/// returns them. `online` set to false makes the device stop answering.
pub fn simulated(initial: Value, online: Arc<AtomicBool>) -> (Responder, SharedDps) {
    let dps: SharedDps = Arc::new(Mutex::new(
        initial.as_object().cloned().unwrap_or_default(),
    ));
    let state = dps.clone();
    let responder: Responder = Arc::new(move |req: &Packet| {
        if !online.load(Ordering::SeqCst) {
            return Vec::new();
        }
        let mut dps = state.lock();
        if req.cmd == CommandType::Control as u32 {
            if let Some(written) = req.payload.get("dps").and_then(Value::as_object) {
                dps.extend(written.clone());
            }
            vec![reply(req, 0, Value::Null)]
        } else if req.cmd == CommandType::DpQuery as u32 {
            vec![reply(
                req,
                0,
                json!({ "devId": DEVICE_ID, "dps": Value::Object(dps.clone()) }),
            )]
        } else {
            vec![reply(req, 0, Value::Null)]
        }
    });
    (responder, dps)
}

/// Never answers anything.
pub fn silent() -> Responder {
    Arc::new(|_: &Packet| Vec::new())
}

/// Short timings so failure paths run in milliseconds.
pub fn fast_timing() -> Timing {
    Timing {
        request_timeout: Duration::from_millis(200),
        connect_timeout: Duration::from_millis(500),
        reconnect_min: Duration::from_millis(20),
        reconnect_max: Duration::from_millis(100),
        heartbeat_interval: Duration::from_secs(60),
        status_interval: Duration::from_secs(60),
        max_poll_interval: Duration::from_secs(120),
        remember_fan_speed_delay: Duration::from_millis(100),
        ..Timing::default()
    }
}
