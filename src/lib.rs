//! Host-side control API for USB-connected smart servo drivers on a
//! multi-joint legged robot.
//!
//! This crate owns the whole path from USB transfer completion to joint
//! demand: it decodes the wire protocol, tracks per-device control/homed/
//! fault state with an extrapolated position estimate, composes derived
//! "relative" joints on top of one or two devices, and recovers absolute
//! position via a closed-loop homing procedure that drives a joint through
//! its index-sensor transitions.
//!
//! # Layout
//! - [`packet`]: wire frame codec and the closed set of packet/parameter types.
//! - [`callback`]: generic multi-subscriber notifier used throughout.
//! - [`transport`]: the `Transport` capability trait, a `rusb`-backed USB
//!   implementation, and an in-process loopback used by tests.
//! - [`router`]: maps inbound frames to their owning device and steers
//!   outgoing frames to the right transport.
//! - [`device`]: per-device protocol state and the position/velocity/torque
//!   estimator ([`device::ServoEngine`]).
//! - [`joint`]: the [`joint::Joint`] contract plus direct and relative joints.
//! - [`homing`]: the index-sensor homing coordinator.
//! - [`config`]: JSON device/joint configuration persistence.
//! - [`facade`]: [`facade::DogBotApi`], the top-level handle applications use.
//!
//! # Example
//! ```no_run
//! use dogbot_api::config::Config;
//! use dogbot_api::facade::DogBotApi;
//! use dogbot_api::config::ProcessConfig;
//!
//! # fn main() -> dogbot_api::error::Result<()> {
//! let api = DogBotApi::new(ProcessConfig::new());
//! let config = Config::from_json(std::fs::read_to_string("robot.json")?.as_str())?;
//! api.load_config(&config)?;
//! # Ok(())
//! # }
//! ```

pub mod callback;
pub mod config;
pub mod device;
pub mod error;
pub mod facade;
pub mod homing;
pub mod joint;
pub mod packet;
pub mod router;
pub mod transport;

pub use config::{Config, ProcessConfig};
pub use device::ServoEngine;
pub use error::{DogBotError, Result};
pub use facade::{DeviceStatusEvent, DeviceStatusKind, DogBotApi};
pub use joint::{DirectJoint, Joint, RelativeJoint};
pub use packet::Packet;
pub use router::Router;
