//! Data-point snapshot and the vacuum state derived from it.
//!
//! The store is written only by the connection task. Every update builds a new
//! immutable [`Snapshot`] and swaps it in, so readers never see a half-applied
//! delta and never wait on the writer for longer than a pointer swap.

use crate::error::{Result, TuyaError};
use futures_core::stream::Stream;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

const CHAN_BROADCAST_CAPACITY: usize = 64;

const KEY_DPS: &str = "dps";
const KEY_DATA: &str = "data";

/// A single data-point value as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DpValue {
    Bool(bool),
    Integer(i64),
    Text(String),
}

impl DpValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DpValue::Bool(b) => Some(*b),
            DpValue::Integer(i) => Some(*i != 0),
            DpValue::Text(s) => s.parse().ok(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DpValue::Bool(_) => None,
            DpValue::Integer(i) => Some(*i),
            DpValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            DpValue::Bool(b) => Value::Bool(*b),
            DpValue::Integer(i) => Value::from(*i),
            DpValue::Text(s) => Value::String(s.clone()),
        }
    }
}

/// Renders the value the way mapping tables key it: `true`, `5`, `docked`.
impl fmt::Display for DpValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DpValue::Bool(b) => write!(f, "{}", b),
            DpValue::Integer(i) => write!(f, "{}", i),
            DpValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for DpValue {
    fn from(v: bool) -> Self {
        DpValue::Bool(v)
    }
}

impl From<i64> for DpValue {
    fn from(v: i64) -> Self {
        DpValue::Integer(v)
    }
}

impl From<i32> for DpValue {
    fn from(v: i32) -> Self {
        DpValue::Integer(v as i64)
    }
}

impl From<&str> for DpValue {
    fn from(v: &str) -> Self {
        DpValue::Text(v.to_string())
    }
}

impl From<String> for DpValue {
    fn from(v: String) -> Self {
        DpValue::Text(v)
    }
}

impl TryFrom<&Value> for DpValue {
    type Error = TuyaError;

    fn try_from(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(DpValue::Bool(*b)),
            Value::Number(n) => n.as_i64().map(DpValue::Integer).ok_or_else(|| {
                TuyaError::DecodeError(format!("non-integer data point value {}", n))
            }),
            Value::String(s) => Ok(DpValue::Text(s.clone())),
            other => Err(TuyaError::DecodeError(format!(
                "unsupported data point value {}",
                other
            ))),
        }
    }
}

/// Data-point id → value. Ordered so equal sets serialize identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataPointSet(BTreeMap<String, DpValue>);

impl DataPointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates a JSON object of scalar values.
    ///
    /// `null` entries mean "no value reported" and are skipped; any other
    /// non-scalar value rejects the whole set.
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| TuyaError::DecodeError("data points must be a JSON object".into()))?;

        let mut set = BTreeMap::new();
        for (id, v) in obj {
            if v.is_null() {
                continue;
            }
            let dp = DpValue::try_from(v)
                .map_err(|e| TuyaError::DecodeError(format!("data point {}: {}", id, e)))?;
            set.insert(id.clone(), dp);
        }
        Ok(Self(set))
    }

    /// Extracts the data points of a device payload (`dps` or `data.dps`).
    pub fn from_payload(payload: &Value) -> Result<Option<Self>> {
        let dps = payload
            .get(KEY_DPS)
            .or_else(|| payload.get(KEY_DATA).and_then(|d| d.get(KEY_DPS)));
        match dps {
            Some(v) => Self::from_json(v).map(Some),
            None => Ok(None),
        }
    }

    pub fn get(&self, id: &str) -> Option<&DpValue> {
        self.0.get(id)
    }

    pub fn insert<I: Into<String>, V: Into<DpValue>>(&mut self, id: I, value: V) {
        self.0.insert(id.into(), value.into());
    }

    /// Last-write-wins merge of `delta` into `self`.
    pub fn merge(&mut self, delta: &DataPointSet) {
        for (id, v) in &delta.0 {
            self.0.insert(id.clone(), v.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DpValue)> {
        self.0.iter()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl<I: Into<String>, V: Into<DpValue>> FromIterator<(I, V)> for DataPointSet {
    fn from_iter<T: IntoIterator<Item = (I, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Status names accepted in mapping tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Idle,
    Cleaning,
    Paused,
    Returning,
    Docked,
    Charging,
    Error,
}

/// High-level vacuum status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VacuumStatus {
    Idle,
    Cleaning,
    Paused,
    Returning,
    Docked,
    Charging,
    /// Carries the raw fault code (0 when the status dp itself reports an error).
    Error(u32),
    /// Nothing reported yet, or a status value the mapping does not know.
    Unknown,
}

impl From<StatusKind> for VacuumStatus {
    fn from(kind: StatusKind) -> Self {
        match kind {
            StatusKind::Idle => VacuumStatus::Idle,
            StatusKind::Cleaning => VacuumStatus::Cleaning,
            StatusKind::Paused => VacuumStatus::Paused,
            StatusKind::Returning => VacuumStatus::Returning,
            StatusKind::Docked => VacuumStatus::Docked,
            StatusKind::Charging => VacuumStatus::Charging,
            StatusKind::Error => VacuumStatus::Error(0),
        }
    }
}

/// Which data points carry which part of the vacuum state.
///
/// Ids and value encodings are model/firmware specific and always come from
/// configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMapping {
    #[serde(default)]
    pub status_dp: Option<String>,
    /// Raw status value (rendered as text) → status.
    #[serde(default)]
    pub status_values: BTreeMap<String, StatusKind>,
    #[serde(default)]
    pub fault_dp: Option<String>,
    /// Fault bit value → fault name.
    #[serde(default)]
    pub fault_bits: BTreeMap<u32, String>,
    #[serde(default)]
    pub battery_dp: Option<String>,
    #[serde(default)]
    pub fan_speed_dp: Option<String>,
    #[serde(default)]
    pub cleaning_area_dp: Option<String>,
    #[serde(default)]
    pub cleaning_time_dp: Option<String>,
    #[serde(default)]
    pub mop_equipped_dp: Option<String>,
}

impl StateMapping {
    fn lookup<'a>(&self, dps: &'a DataPointSet, id: &Option<String>) -> Option<&'a DpValue> {
        id.as_deref().and_then(|id| dps.get(id))
    }

    /// Derives the vacuum state from a full snapshot.
    pub fn derive(&self, dps: &DataPointSet) -> VacuumState {
        let fault_code = self
            .lookup(dps, &self.fault_dp)
            .and_then(|v| v.as_i64())
            .map(|c| c.clamp(0, u32::MAX as i64) as u32)
            .unwrap_or(0);

        let status = if fault_code != 0 {
            VacuumStatus::Error(fault_code)
        } else {
            self.lookup(dps, &self.status_dp)
                .and_then(|v| self.status_values.get(&v.to_string()))
                .map(|kind| VacuumStatus::from(*kind))
                .unwrap_or(VacuumStatus::Unknown)
        };

        VacuumState {
            status,
            battery_percent: self
                .lookup(dps, &self.battery_dp)
                .and_then(|v| v.as_i64())
                .map(|b| b.clamp(0, 100) as u8),
            fan_speed: self
                .lookup(dps, &self.fan_speed_dp)
                .map(|v| v.to_string()),
            cleaning_area: self
                .lookup(dps, &self.cleaning_area_dp)
                .and_then(|v| v.as_i64()),
            cleaning_time: self
                .lookup(dps, &self.cleaning_time_dp)
                .and_then(|v| v.as_i64()),
            mop_equipped: self
                .lookup(dps, &self.mop_equipped_dp)
                .and_then(|v| v.as_bool()),
            faults: self.fault_names(fault_code),
        }
    }

    fn fault_names(&self, code: u32) -> Vec<String> {
        let mut names = Vec::new();
        let mut remaining = code;
        for (&bit, name) in &self.fault_bits {
            if bit != 0 && code & bit == bit {
                names.push(name.clone());
                remaining &= !bit;
            }
        }
        if remaining != 0 {
            names.push(format!("unknown_fault_0x{:x}", remaining));
        }
        names
    }
}

/// Vacuum-domain view of the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VacuumState {
    pub status: VacuumStatus,
    pub battery_percent: Option<u8>,
    pub fan_speed: Option<String>,
    pub cleaning_area: Option<i64>,
    /// Minutes spent on the current run.
    pub cleaning_time: Option<i64>,
    pub mop_equipped: Option<bool>,
    /// Names of the active fault bits.
    pub faults: Vec<String>,
}

impl Default for VacuumState {
    fn default() -> Self {
        Self {
            status: VacuumStatus::Unknown,
            battery_percent: None,
            fan_speed: None,
            cleaning_area: None,
            cleaning_time: None,
            mop_equipped: None,
            faults: Vec::new(),
        }
    }
}

/// Immutable published state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub data_points: DataPointSet,
    pub state: VacuumState,
}

/// Receives every published state.
pub trait StateObserver: Send + Sync {
    fn on_state_change(&self, state: &VacuumState);
}

impl<F> StateObserver for F
where
    F: Fn(&VacuumState) + Send + Sync,
{
    fn on_state_change(&self, state: &VacuumState) {
        self(state)
    }
}

/// Handle returned by [`DeviceStateStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct DeviceStateStore {
    mapping: StateMapping,
    current: RwLock<Arc<Snapshot>>,
    write_lock: Mutex<()>,
    observers: RwLock<Vec<(SubscriptionId, Arc<dyn StateObserver>)>>,
    next_id: AtomicU64,
    broadcast_tx: broadcast::Sender<VacuumState>,
}

impl DeviceStateStore {
    pub fn new(mapping: StateMapping) -> Self {
        let (broadcast_tx, _) = broadcast::channel(CHAN_BROADCAST_CAPACITY);
        let initial = Snapshot {
            data_points: DataPointSet::new(),
            state: mapping.derive(&DataPointSet::new()),
        };
        Self {
            mapping,
            current: RwLock::new(Arc::new(initial)),
            write_lock: Mutex::new(()),
            observers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            broadcast_tx,
        }
    }

    pub fn mapping(&self) -> &StateMapping {
        &self.mapping
    }

    /// Merges `delta`, re-derives the state and publishes the new snapshot.
    ///
    /// An empty delta publishes nothing and notifies nobody.
    pub fn update(&self, delta: &DataPointSet) -> Arc<Snapshot> {
        if delta.is_empty() {
            return self.current_snapshot();
        }

        let published = {
            let _writer = self.write_lock.lock();
            let mut data_points = self.current.read().data_points.clone();
            data_points.merge(delta);
            let state = self.mapping.derive(&data_points);
            let snapshot = Arc::new(Snapshot { data_points, state });
            *self.current.write() = snapshot.clone();
            snapshot
        };
        debug!(
            "State updated: {:?} ({} data points)",
            published.state.status,
            published.data_points.len()
        );

        self.notify(&published.state);
        published
    }

    pub fn current_snapshot(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    pub fn current_state(&self) -> VacuumState {
        self.current_snapshot().state.clone()
    }

    pub fn subscribe<O>(&self, observer: O) -> SubscriptionId
    where
        O: StateObserver + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, Arc::new(observer)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(sid, _)| *sid != id);
        observers.len() != before
    }

    /// Returns a Stream of published states.
    pub fn stream(&self) -> impl Stream<Item = VacuumState> + Send + 'static + use<> {
        let mut rx = self.broadcast_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(state) => yield state,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("State stream lagged, {} updates skipped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    fn notify(&self, state: &VacuumState) {
        let observers: Vec<Arc<dyn StateObserver>> = self
            .observers
            .read()
            .iter()
            .map(|(_, o)| o.clone())
            .collect();
        for observer in observers {
            observer.on_state_change(state);
        }
        let _ = self.broadcast_tx.send(state.clone());
    }
}
