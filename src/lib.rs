//! # rustmiio
//!
//! Asynchronous client for the miIO local protocol spoken by Xiaomi and
//! Yeelight smart-home devices over UDP, without cloud dependencies.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rustmiio::{CallOptions, Network};
//! use serde_json::json;
//!
//! # async fn run() -> rustmiio::Result<()> {
//! let network = Network::new(None)?;
//! let token = "00112233445566778899aabbccddeeff".parse()?;
//! let lamp = network.connect("192.168.1.20", Some(token)).await?;
//! let state = lamp
//!     .call("get_prop", json!(["power", "bright"]), CallOptions::default())
//!     .await?;
//! println!("{}", state);
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
pub mod macros;
pub mod capability;
pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod network;
pub mod protocol;
pub mod tokens;

pub use config::{Config, DeviceKind};
pub use device::{CallOptions, Device, DeviceBuilder, HandshakeState, Params};
pub use error::{MiioError, Result};
pub use network::{Network, Transport};
pub use protocol::Token;
pub use tokens::TokenStore;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
