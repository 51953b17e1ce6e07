//! # tuya-vacuum
//!
//! Asynchronous local-network client for Tuya-based robot vacuums (protocol
//! 3.1 and 3.3), without cloud dependencies.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tuya_vacuum::{DeviceConfig, DpMapping, VacuumConfig, VacuumController};
//!
//! # async fn run() -> tuya_vacuum::Result<()> {
//! let device = DeviceConfig::new("192.168.1.50", "DEVICE_ID", "0123456789abcdef", "3.3")?;
//! let vacuum = VacuumController::new(VacuumConfig::new(device, DpMapping::prosenic()))?;
//! vacuum.subscribe(|state: &tuya_vacuum::VacuumState| println!("{:?}", state.status));
//! vacuum.start().await?;
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
pub mod macros;
pub mod codec;
pub mod config;
pub mod controller;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod scheduler;
pub mod state;
pub mod transport;

pub use codec::{Packet, PacketCodec};
pub use config::{ChoiceMapping, DeviceConfig, DpCommand, DpMapping, Timing, VacuumConfig};
pub use controller::VacuumController;
pub use dispatcher::{CommandDispatcher, Reply};
pub use error::{Result, TuyaError};
pub use protocol::{CommandType, Version};
pub use scheduler::PollingScheduler;
pub use state::{
    DataPointSet, DeviceStateStore, DpValue, StateMapping, StateObserver, StatusKind,
    SubscriptionId, VacuumState, VacuumStatus,
};
pub use transport::TransportSession;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
