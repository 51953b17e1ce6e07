//! High-level vacuum operations on top of the dispatcher, store and scheduler.

use crate::config::{DpCommand, DpMapping, VacuumConfig, commands};
use crate::dispatcher::{CommandDispatcher, Reply};
use crate::error::{Result, TuyaError};
use crate::protocol::CommandType;
use crate::scheduler::PollingScheduler;
use crate::state::{
    DataPointSet, DeviceStateStore, DpValue, StateObserver, SubscriptionId, VacuumState,
    VacuumStatus,
};
use futures_core::Stream;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

/// How a control command affects the remembered mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    /// Selects a cleaning mode (same data point as `start`).
    Mode,
    FanSpeed,
    Other,
    /// Raw data point writes leave the remembered mode and fan speed alone.
    Raw,
}

#[derive(Default)]
struct CommandMemory {
    last_mode: Option<DpCommand>,
    stored_fan_speed: Option<String>,
    fan_restore: Option<CancellationToken>,
}

/// One robot vacuum reachable over the local network.
///
/// Construction spawns the connection and polling tasks, so it must happen
/// inside a tokio runtime. Dropping the controller stops both.
pub struct VacuumController {
    device_id: String,
    mapping: Arc<DpMapping>,
    remember_fan_speed: bool,
    fan_restore_delay: Duration,
    store: Arc<DeviceStateStore>,
    dispatcher: CommandDispatcher,
    scheduler: PollingScheduler,
    memory: Arc<Mutex<CommandMemory>>,
    cancel_token: CancellationToken,
}

impl VacuumController {
    pub fn new(config: VacuumConfig) -> Result<Self> {
        config.validate()?;
        let VacuumConfig {
            device,
            dp_mapping,
            remember_fan_speed,
            timing,
        } = config;

        info!(
            "Initializing vacuum {} at {} (protocol {})",
            device.device_id, device.host, device.protocol_version
        );

        let cancel_token = CancellationToken::new();
        let store = Arc::new(DeviceStateStore::new(dp_mapping.state.clone()));
        let device_id = device.device_id.clone();
        let dispatcher = CommandDispatcher::spawn(
            device,
            timing.clone(),
            store.clone(),
            cancel_token.child_token(),
        )?;
        let scheduler =
            PollingScheduler::spawn(dispatcher.clone(), &timing, cancel_token.child_token());

        Ok(Self {
            device_id,
            mapping: Arc::new(dp_mapping),
            remember_fan_speed,
            fan_restore_delay: timing.remember_fan_speed_delay,
            store,
            dispatcher,
            scheduler,
            memory: Arc::new(Mutex::new(CommandMemory::default())),
            cancel_token,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn mapping(&self) -> &DpMapping {
        &self.mapping
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Starts cleaning, or resumes the interrupted mode when paused.
    ///
    /// Uses `start_mop` instead of `start` when the device reports a mop.
    pub async fn start(&self) -> Result<()> {
        let state = self.store.current_state();
        let last_mode = self.memory.lock().last_mode.clone();

        if state.status == VacuumStatus::Paused
            && let Some(mode) = last_mode
        {
            debug!("Resuming last mode on {}: {:?}", self.device_id, mode);
            return self.send_control(mode, CommandKind::Mode).await;
        }

        let name = if state.mop_equipped == Some(true)
            && self.mapping.command(commands::START_MOP).is_some()
        {
            commands::START_MOP
        } else {
            commands::START
        };
        self.execute(name).await
    }

    /// Pauses cleaning.
    ///
    /// Models without a `pause` command toggle by re-sending the running mode;
    /// on those, pausing with no known mode or while already paused does nothing.
    pub async fn pause(&self) -> Result<()> {
        if self.mapping.command(commands::PAUSE).is_some() {
            return self.execute(commands::PAUSE).await;
        }
        if !self.mapping.pause_resends_mode {
            return Err(TuyaError::UnsupportedCommand(commands::PAUSE.to_string()));
        }

        let last_mode = self.memory.lock().last_mode.clone();
        match last_mode {
            Some(mode) if self.store.current_state().status != VacuumStatus::Paused => {
                self.send_control(mode, CommandKind::Mode).await
            }
            _ => {
                debug!("Nothing to pause on {}", self.device_id);
                Ok(())
            }
        }
    }

    pub async fn stop(&self) -> Result<()> {
        self.execute(commands::STOP).await
    }

    pub async fn return_to_base(&self) -> Result<()> {
        self.execute(commands::RETURN_TO_BASE).await
    }

    pub async fn locate(&self) -> Result<()> {
        self.execute(commands::LOCATE).await
    }

    pub async fn clean_spot(&self) -> Result<()> {
        self.execute(commands::CLEAN_SPOT).await
    }

    /// Moves the robot manually. `direction` is one of [`direction_list`](Self::direction_list),
    /// case-insensitive.
    pub async fn remote_control(&self, direction: &str) -> Result<()> {
        let directions = self
            .mapping
            .directions
            .as_ref()
            .ok_or_else(|| TuyaError::UnsupportedCommand("remote_control".into()))?;
        let cmd = directions
            .command(&direction.to_lowercase())
            .ok_or_else(|| {
                warn!(
                    "Direction not recognized ({}). Valid directions are: {:?}",
                    direction,
                    directions.choices()
                );
                TuyaError::UnsupportedValue(direction.to_string())
            })?;
        self.send_control(cmd, CommandKind::Other).await
    }

    /// Sets the suction level. `level` is one of [`fan_speed_list`](Self::fan_speed_list).
    pub async fn set_fan_speed(&self, level: &str) -> Result<()> {
        let fan_speed = self
            .mapping
            .fan_speed
            .as_ref()
            .ok_or_else(|| TuyaError::UnsupportedCommand("set_fan_speed".into()))?;
        let cmd = fan_speed.command(level).ok_or_else(|| {
            warn!(
                "Fan speed not recognized ({}). Valid speeds are: {:?}",
                level,
                fan_speed.choices()
            );
            TuyaError::UnsupportedValue(level.to_string())
        })?;

        self.send_control(cmd, CommandKind::FanSpeed).await?;
        self.memory.lock().stored_fan_speed = Some(level.to_string());
        Ok(())
    }

    /// Writes one data point as is.
    pub async fn send_raw_data_point<I, V>(&self, id: I, value: V) -> Result<()>
    where
        I: Into<String>,
        V: Into<DpValue>,
    {
        let cmd = DpCommand::new(id, value.into().to_json());
        self.send_control(cmd, CommandKind::Raw).await
    }

    /// Asks the device for all data points right now.
    pub async fn refresh(&self) -> Result<DataPointSet> {
        let reply = self
            .dispatcher
            .send_command(CommandType::DpQuery, None)
            .await?;
        Ok(reply.data_points)
    }

    pub fn fan_speed_list(&self) -> Vec<String> {
        self.mapping
            .fan_speed
            .as_ref()
            .map(|m| m.choices())
            .unwrap_or_default()
    }

    pub fn direction_list(&self) -> Vec<String> {
        self.mapping
            .directions
            .as_ref()
            .map(|m| m.choices())
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // State & lifecycle
    // -------------------------------------------------------------------------

    pub fn current_state(&self) -> VacuumState {
        self.store.current_state()
    }

    pub fn current_data_points(&self) -> DataPointSet {
        self.store.current_snapshot().data_points.clone()
    }

    /// Registers `observer` for every published state.
    pub fn subscribe<O>(&self, observer: O) -> SubscriptionId
    where
        O: StateObserver + 'static,
    {
        self.store.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.store.unsubscribe(id)
    }

    pub fn stream(&self) -> impl Stream<Item = VacuumState> + Send + 'static + use<> {
        self.store.stream()
    }

    /// False until the first successful poll and after repeated poll failures.
    pub fn is_available(&self) -> bool {
        self.scheduler.is_available()
    }

    pub fn is_connected(&self) -> bool {
        self.dispatcher.is_connected()
    }

    pub fn last_error(&self) -> Option<TuyaError> {
        self.dispatcher.last_error()
    }

    /// Stops polling, closes the connection and fails outstanding requests
    /// with `Cancelled`.
    pub async fn close(&self) {
        info!("Closing vacuum {}", self.device_id);
        if let Some(token) = self.memory.lock().fan_restore.take() {
            token.cancel();
        }
        self.scheduler.stop().await;
        self.dispatcher.close().await;
        self.cancel_token.cancel();
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    async fn execute(&self, name: &str) -> Result<()> {
        let cmd = self
            .mapping
            .command(name)
            .cloned()
            .ok_or_else(|| TuyaError::UnsupportedCommand(name.to_string()))?;
        let kind = if self.mapping.is_mode_command(name) {
            CommandKind::Mode
        } else {
            CommandKind::Other
        };
        self.send_control(cmd, kind).await
    }

    async fn send_control(&self, cmd: DpCommand, kind: CommandKind) -> Result<()> {
        debug!(
            "Sending dp {}={} to {} ({:?})",
            cmd.dp, cmd.value, self.device_id, kind
        );
        let result = self.control(&cmd).await;
        // The device state is stale after any control attempt.
        self.scheduler.request_refresh();
        result?;

        match kind {
            CommandKind::Mode => self.memory.lock().last_mode = Some(cmd),
            CommandKind::Other => self.memory.lock().last_mode = None,
            CommandKind::FanSpeed | CommandKind::Raw => {}
        }
        if self.remember_fan_speed && matches!(kind, CommandKind::Mode | CommandKind::Other) {
            self.schedule_fan_restore();
        }
        Ok(())
    }

    async fn control(&self, cmd: &DpCommand) -> Result<Reply> {
        self.dispatcher
            .send_command(CommandType::Control, Some(cmd.to_dps()))
            .await
    }

    /// Re-applies the stored fan speed after the configured delay. A newer
    /// command replaces a pending restore.
    fn schedule_fan_restore(&self) {
        let Some(fan_speed) = self.mapping.fan_speed.as_ref() else {
            return;
        };

        let token = self.cancel_token.child_token();
        let cmd = {
            let mut memory = self.memory.lock();
            let Some(cmd) = memory
                .stored_fan_speed
                .as_deref()
                .and_then(|level| fan_speed.command(level))
            else {
                return;
            };
            if let Some(previous) = memory.fan_restore.replace(token.clone()) {
                previous.cancel();
            }
            cmd
        };

        let dispatcher = self.dispatcher.clone();
        let scheduler = self.scheduler.clone();
        let delay = self.fan_restore_delay;
        debug!(
            "Waiting {}ms before setting the fan speed on {}",
            delay.as_millis(),
            self.device_id
        );
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = sleep(delay) => {}
            }
            match dispatcher
                .send_command(CommandType::Control, Some(cmd.to_dps()))
                .await
            {
                Ok(_) => scheduler.request_refresh(),
                Err(e) => warn!(
                    "Could not restore fan speed on {}: {}",
                    dispatcher.device_id(),
                    e
                ),
            }
        });
    }
}

impl Drop for VacuumController {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
