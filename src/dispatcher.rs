//! Command dispatch and the background connection task.
//!
//! All traffic to one device goes through a single task that owns the TCP
//! session. Requests are queued over an mpsc channel and issued one at a time:
//! the next request is only written once the previous one has been answered,
//! has timed out or has been cancelled, so sequence numbers always correlate
//! unambiguously with replies. Frames that match no request (status pushes)
//! only update the state store.

use crate::codec::{Packet, PacketCodec};
use crate::config::{DeviceConfig, Timing};
use crate::error::{Result, TuyaError, get_error_message};
use crate::protocol::CommandType;
use crate::state::{DataPointSet, DeviceStateStore};
use crate::transport::{FrameReader, FrameWriter, TransportSession};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep, sleep_until};
use tokio_util::sync::CancellationToken;

/// First sequence number of every session.
pub const INITIAL_SEQNO: u32 = 1;

const CHAN_MPSC_CAPACITY: usize = 32;
const CHAN_FRAME_CAPACITY: usize = 16;

const KEY_GW_ID: &str = "gwId";
const KEY_DEV_ID: &str = "devId";
const KEY_UID: &str = "uid";
const KEY_T: &str = "t";
const KEY_DPS: &str = "dps";

/// A successful reply to a command.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub seqno: u32,
    pub cmd: u32,
    /// Data points carried by the reply (empty for acknowledgements).
    pub data_points: DataPointSet,
    pub payload: Value,
}

struct QueuedRequest {
    command: CommandType,
    data: Option<Value>,
    resp_tx: oneshot::Sender<Result<Reply>>,
}

impl QueuedRequest {
    fn respond(self, result: Result<Reply>) {
        let _ = self.resp_tx.send(result);
    }
}

/// The request currently on the wire.
struct PendingRequest {
    seqno: u32,
    cmd: u32,
    issued_at: Instant,
    deadline: tokio::time::Instant,
    resp_tx: oneshot::Sender<Result<Reply>>,
}

impl PendingRequest {
    fn resolve(self, result: Result<Reply>) {
        let _ = self.resp_tx.send(result);
    }

    fn matches(&self, packet: &Packet) -> bool {
        self.seqno == packet.seqno && self.cmd == packet.cmd
    }
}

/// Why a session ended.
#[derive(Debug)]
enum SessionEnd {
    /// Shut down by the owner.
    Cancelled,
    /// Socket failure; reconnect with backoff.
    Lost(TuyaError),
    /// Too many consecutive timeouts; reconnect with a fresh session.
    Recycle,
    /// Reconnecting cannot help (wrong local key).
    Fatal(TuyaError),
}

#[derive(Default)]
struct DispatcherState {
    connected: bool,
    stopped: bool,
    /// Consecutive request timeouts, reset by any answered request.
    failure_count: u32,
    /// Consecutive sessions that ended without a single decoded frame.
    reconnect_failures: u32,
    sessions_opened: u64,
    last_error: Option<TuyaError>,
    fatal: Option<TuyaError>,
}

/// Handle to the connection task of one device.
#[derive(Clone)]
pub struct CommandDispatcher {
    device_id: String,
    tx: mpsc::Sender<QueuedRequest>,
    state: Arc<RwLock<DispatcherState>>,
    cancel_token: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl CommandDispatcher {
    /// Starts the connection task. Must be called inside a tokio runtime.
    ///
    /// The task stops when `cancel_token` is cancelled, when [`close`](Self::close)
    /// is called, or when every handle has been dropped.
    pub fn spawn(
        device: DeviceConfig,
        timing: Timing,
        store: Arc<DeviceStateStore>,
        cancel_token: CancellationToken,
    ) -> Result<Self> {
        device.validate()?;
        timing.validate()?;
        let codec = PacketCodec::new(device.local_key_bytes(), device.protocol_version)?;

        let (tx, rx) = mpsc::channel(CHAN_MPSC_CAPACITY);
        let state = Arc::new(RwLock::new(DispatcherState::default()));
        let device_id = device.device_id.clone();

        let task = ConnectionTask {
            device_id: device_id.clone(),
            device,
            timing,
            codec,
            store,
            state: state.clone(),
            cancel_token: cancel_token.clone(),
            rx,
            crypto_failures: 0,
        };
        let handle = tokio::spawn(task.run());

        Ok(Self {
            device_id,
            tx,
            state,
            cancel_token,
            task: Arc::new(Mutex::new(Some(handle))),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Queues a command and waits for its reply.
    ///
    /// `data` becomes the `dps` object of the request. Resolves with the reply,
    /// `Timeout`, `DeviceRejected`, `ConnectionLost`, `Offline` (no session)
    /// or `Cancelled`.
    pub async fn send_command(&self, command: CommandType, data: Option<Value>) -> Result<Reply> {
        if let Some(e) = self.with_state(|s| s.fatal.clone()) {
            return Err(e);
        }

        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(QueuedRequest {
                command,
                data,
                resp_tx,
            })
            .await
            .map_err(|_| TuyaError::Cancelled)?;

        match resp_rx.await {
            Ok(result) => result,
            Err(_) => Err(self
                .with_state(|s| s.fatal.clone())
                .unwrap_or(TuyaError::Cancelled)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.with_state(|s| s.connected)
    }

    /// Consecutive request timeouts since the last answered request.
    pub fn failure_count(&self) -> u32 {
        self.with_state(|s| s.failure_count)
    }

    /// Number of TCP sessions opened so far.
    pub fn sessions_opened(&self) -> u64 {
        self.with_state(|s| s.sessions_opened)
    }

    pub fn last_error(&self) -> Option<TuyaError> {
        self.with_state(|s| s.last_error.clone())
    }

    pub fn is_stopped(&self) -> bool {
        self.with_state(|s| s.stopped)
    }

    /// Stops the connection task, closes the socket and fails every
    /// outstanding request with `Cancelled`.
    pub async fn close(&self) {
        info!("Closing connection to device {}", self.device_id);
        self.cancel_token.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&DispatcherState) -> R) -> R {
        f(&self.state.read())
    }
}

struct ConnectionTask {
    device_id: String,
    device: DeviceConfig,
    timing: Timing,
    codec: PacketCodec,
    store: Arc<DeviceStateStore>,
    state: Arc<RwLock<DispatcherState>>,
    cancel_token: CancellationToken,
    rx: mpsc::Receiver<QueuedRequest>,
    crypto_failures: u32,
}

impl ConnectionTask {
    async fn run(mut self) {
        debug!("Starting connection task for device {}", self.device_id);

        let final_error = loop {
            if self.cancel_token.is_cancelled() {
                break TuyaError::Cancelled;
            }

            let failures = self.with_state(|s| s.reconnect_failures);
            if failures > 0 {
                let backoff = get_backoff_duration(
                    failures - 1,
                    self.timing.reconnect_min,
                    self.timing.reconnect_max,
                );
                warn!(
                    "Waiting {}ms before next connection attempt for {} (fail count: {})",
                    backoff.as_millis(),
                    self.device_id,
                    failures
                );
                if !self.wait_for_backoff(backoff).await {
                    break TuyaError::Cancelled;
                }
            }

            let opened = tokio::select! {
                _ = self.cancel_token.cancelled() => break TuyaError::Cancelled,
                res = TransportSession::open(&self.device, self.timing.connect_timeout) => res,
            };
            let session = match opened {
                Ok(session) => session,
                Err(e) => {
                    warn!("Connection to device {} failed: {}", self.device_id, e);
                    self.record_session_failure(e);
                    self.drain_queue(|| TuyaError::Offline);
                    continue;
                }
            };

            info!("Connected to device {} at {}", self.device_id, session.peer());
            self.with_state_mut(|s| {
                s.connected = true;
                s.sessions_opened += 1;
            });

            let end = self.maintain_connection(session).await;
            self.with_state_mut(|s| s.connected = false);

            match end {
                SessionEnd::Cancelled => break TuyaError::Cancelled,
                SessionEnd::Fatal(e) => {
                    error!(
                        "Giving up on device {}: {} ({})",
                        self.device_id,
                        e,
                        get_error_message(e.code())
                    );
                    self.with_state_mut(|s| s.fatal = Some(e.clone()));
                    break e;
                }
                SessionEnd::Lost(e) => {
                    debug!("Connection lost for device {} due to error: {}", self.device_id, e);
                    self.record_session_failure(e);
                }
                SessionEnd::Recycle => {
                    warn!(
                        "Recycling session for device {} after {} consecutive timeouts",
                        self.device_id, self.timing.max_consecutive_timeouts
                    );
                    self.record_session_failure(TuyaError::Timeout);
                    self.drain_queue(|| TuyaError::Cancelled);
                }
            }
        };

        self.rx.close();
        self.drain_queue(|| final_error.clone());
        self.with_state_mut(|s| {
            s.stopped = true;
            s.connected = false;
        });
        debug!("Connection task for {} exited", self.device_id);
    }

    fn with_state<R>(&self, f: impl FnOnce(&DispatcherState) -> R) -> R {
        f(&self.state.read())
    }

    fn with_state_mut<R>(&self, f: impl FnOnce(&mut DispatcherState) -> R) -> R {
        f(&mut self.state.write())
    }

    fn record_session_failure(&self, e: TuyaError) {
        self.with_state_mut(|s| {
            s.reconnect_failures += 1;
            s.last_error = Some(e);
        });
    }

    fn drain_queue(&mut self, err: impl Fn() -> TuyaError) {
        while let Ok(req) = self.rx.try_recv() {
            req.respond(Err(err()));
        }
    }

    /// Sleeps through a backoff period, rejecting requests that arrive meanwhile.
    /// Returns false when the task should stop.
    async fn wait_for_backoff(&mut self, backoff: Duration) -> bool {
        let sleep_fut = sleep(backoff);
        tokio::pin!(sleep_fut);

        loop {
            tokio::select! {
                _ = &mut sleep_fut => return true,
                _ = self.cancel_token.cancelled() => return false,
                req = self.rx.recv() => match req {
                    Some(req) => {
                        debug!("Rejecting command during backoff for device {}", self.device_id);
                        req.respond(Err(TuyaError::Offline));
                    }
                    None => return false,
                },
            }
        }
    }

    async fn maintain_connection(&mut self, session: TransportSession) -> SessionEnd {
        let (reader, mut writer) = session.into_split();
        let (frame_tx, mut frame_rx) = mpsc::channel::<Result<Vec<u8>>>(CHAN_FRAME_CAPACITY);
        let session_token = CancellationToken::new();
        tokio::spawn(read_loop(
            self.device_id.clone(),
            reader,
            frame_tx,
            session_token.clone(),
        ));

        let mut seqno = INITIAL_SEQNO;
        let mut in_flight: Option<PendingRequest> = None;
        let mut consecutive_timeouts = 0u32;

        let mut end = loop {
            let deadline = in_flight.as_ref().map(|p| p.deadline);

            tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => break SessionEnd::Cancelled,

                req = self.rx.recv(), if in_flight.is_none() => match req {
                    Some(req) => match self.issue(&mut writer, &mut seqno, req).await {
                        Ok(pending) => in_flight = pending,
                        Err(e) => break SessionEnd::Lost(e),
                    },
                    None => {
                        debug!("All handles for device {} dropped, stopping task", self.device_id);
                        break SessionEnd::Cancelled;
                    }
                },

                _ = sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)), if deadline.is_some() => {
                    if let Some(pending) = in_flight.take() {
                        warn!(
                            "Request seqno={} cmd=0x{:02X} to device {} timed out",
                            pending.seqno, pending.cmd, self.device_id
                        );
                        pending.resolve(Err(TuyaError::Timeout));
                    }
                    consecutive_timeouts += 1;
                    self.with_state_mut(|s| s.failure_count += 1);
                    if consecutive_timeouts >= self.timing.max_consecutive_timeouts {
                        break SessionEnd::Recycle;
                    }
                },

                frame = frame_rx.recv() => match frame {
                    Some(Ok(bytes)) => {
                        if let Err(e) = self.on_frame(&bytes, &mut in_flight, &mut consecutive_timeouts) {
                            break SessionEnd::Fatal(e);
                        }
                    }
                    Some(Err(e)) => break SessionEnd::Lost(e),
                    None => break SessionEnd::Lost(TuyaError::ConnectionLost),
                },
            }
        };

        session_token.cancel();
        writer.close().await;

        // A socket torn down during close is a cancellation, not a lost link.
        if self.cancel_token.is_cancelled() && matches!(end, SessionEnd::Lost(_)) {
            end = SessionEnd::Cancelled;
        }

        if let Some(pending) = in_flight.take() {
            let err = match &end {
                SessionEnd::Lost(_) => TuyaError::ConnectionLost,
                SessionEnd::Fatal(e) => e.clone(),
                SessionEnd::Cancelled | SessionEnd::Recycle => TuyaError::Cancelled,
            };
            pending.resolve(Err(err));
        }
        end
    }

    /// Encodes and writes one request. A write failure ends the session.
    async fn issue(
        &self,
        writer: &mut FrameWriter,
        seqno: &mut u32,
        req: QueuedRequest,
    ) -> Result<Option<PendingRequest>> {
        let payload = self.generate_payload(req.command, req.data.clone());
        let cmd = req.command as u32;
        let current_seq = *seqno;

        let frame = match self.codec.encode(current_seq, cmd, &payload) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode {:?} for {}: {}", req.command, self.device_id, e);
                req.respond(Err(e));
                return Ok(None);
            }
        };
        *seqno = seqno.wrapping_add(1);

        debug!(
            "Sending {:?} to device {}: seqno={}, frame_len={}",
            req.command,
            self.device_id,
            current_seq,
            frame.len()
        );
        if let Err(e) = writer.write_frame(&frame).await {
            req.respond(Err(TuyaError::ConnectionLost));
            return Err(e);
        }

        Ok(Some(PendingRequest {
            seqno: current_seq,
            cmd,
            issued_at: Instant::now(),
            deadline: tokio::time::Instant::now() + self.timing.request_timeout,
            resp_tx: req.resp_tx,
        }))
    }

    /// Handles one inbound frame. Returns an error only when the session must
    /// not be retried.
    fn on_frame(
        &mut self,
        bytes: &[u8],
        in_flight: &mut Option<PendingRequest>,
        consecutive_timeouts: &mut u32,
    ) -> Result<()> {
        let packet = match self.codec.decode(bytes) {
            Ok(packet) => {
                self.crypto_failures = 0;
                packet
            }
            Err(e) if e.is_crypto_error() => {
                self.crypto_failures += 1;
                warn!(
                    "Undecryptable frame from device {} ({} in a row): {}",
                    self.device_id, self.crypto_failures, e
                );
                if self.crypto_failures >= self.timing.crypto_failure_limit {
                    return Err(TuyaError::KeyOrVersionError);
                }
                return Ok(());
            }
            Err(e) => {
                warn!("Dropping frame from device {}: {}", self.device_id, e);
                return Ok(());
            }
        };

        self.with_state_mut(|s| s.reconnect_failures = 0);
        debug!(
            "Received message from {}: cmd=0x{:02X}, seqno={}, retcode={:?}",
            self.device_id, packet.cmd, packet.seqno, packet.retcode
        );

        let data_points = match DataPointSet::from_payload(&packet.payload) {
            Ok(dps) => dps.unwrap_or_default(),
            Err(e) => {
                warn!("Ignoring data points from device {}: {}", self.device_id, e);
                DataPointSet::new()
            }
        };
        if !data_points.is_empty() {
            self.store.update(&data_points);
        }

        match in_flight.take_if(|p| p.matches(&packet)) {
            Some(pending) => {
                *consecutive_timeouts = 0;
                self.with_state_mut(|s| s.failure_count = 0);
                debug!(
                    "Request seqno={} answered in {}ms",
                    pending.seqno,
                    pending.issued_at.elapsed().as_millis()
                );
                let result = match packet.retcode {
                    Some(code) if code != 0 => Err(TuyaError::DeviceRejected(code)),
                    _ => Ok(Reply {
                        seqno: packet.seqno,
                        cmd: packet.cmd,
                        data_points,
                        payload: packet.payload,
                    }),
                };
                pending.resolve(result);
            }
            None => {
                debug!(
                    "Unsolicited frame cmd=0x{:02X} seqno={} from device {}",
                    packet.cmd, packet.seqno, self.device_id
                );
            }
        }
        Ok(())
    }

    /// Wraps `data` in the request envelope expected by v3.1/v3.3 firmware.
    fn generate_payload(&self, command: CommandType, data: Option<Value>) -> Value {
        let id = self.device_id.clone();
        let mut payload = serde_json::Map::new();
        payload.insert(KEY_GW_ID.into(), id.clone().into());
        payload.insert(KEY_DEV_ID.into(), id.clone().into());

        if command != CommandType::HeartBeat {
            payload.insert(KEY_UID.into(), id.into());
            payload.insert(KEY_T.into(), get_timestamp().to_string().into());
        }
        if let Some(d) = data {
            payload.insert(KEY_DPS.into(), d);
        }
        Value::Object(payload)
    }
}

/// Reads frames until the session is cancelled or the socket fails.
async fn read_loop(
    device_id: String,
    mut reader: FrameReader,
    frame_tx: mpsc::Sender<Result<Vec<u8>>>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            res = reader.read_frame() => {
                let failed = res.is_err();
                if frame_tx.send(res).await.is_err() || failed {
                    break;
                }
            }
        }
    }
    debug!("Reader task for {} stopped", device_id);
}

fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// `min * 2^failures`, capped at `max`.
pub fn get_backoff_duration(failures: u32, min: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(failures.min(16));
    min.saturating_mul(factor).min(max)
}
