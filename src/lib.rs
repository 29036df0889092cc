//! Insidious bridge library
//!
//! This library provides the front-end side of the Insidious control plane:
//!
//! - `ipc` - Bridge client for communication with the worker process
//! - `models` - Wire message types shared with the worker
//! - `config` - Connection settings and environment overrides
//!
//! # IPC Module
//!
//! ```ignore
//! use insidious_bridge::{BridgeClient, BridgeConfig};
//!
//! let client = BridgeClient::new(BridgeConfig::from_env());
//! client.connect().await?;
//! client.send("dns", "spoof_all", serde_json::json!({"target_ip": "10.0.0.5"})).await?;
//! ```

pub mod config;
pub mod ipc;
pub mod models;

pub use config::BridgeConfig;
pub use ipc::{BridgeClient, BridgeService, IpcError, Topic};
pub use models::{CorrelationId, Message, MessageKind, PayloadError};
