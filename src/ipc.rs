//! Message bridge between the front end and the Insidious worker.
//!
//! The worker listens on a TCP socket (loopback by default). This module
//! connects to it and multiplexes three kinds of traffic over the one stream:
//! fire-and-forget commands, request/response pairs, and unsolicited events.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐          TCP socket          ┌─────────────────────┐
//! │   Front end     │  ◄──────────────────────────►│   Insidious worker  │
//! │ (BridgeClient)  │    newline-delimited JSON    │      (Python)       │
//! └─────────────────┘                              └─────────────────────┘
//! ```
//!
//! - **framing**: encode/decode newline-delimited JSON frames
//! - **receiver**: background task reading and routing inbound frames
//! - **pending**: correlation table pairing commands with replies
//! - **router**: dispatch to waiters or per-kind subscribers
//! - **client**: connection lifecycle and command sending
//!
//! # Protocol
//!
//! ```text
//! {"type":"CMD","module":"mitm","action":"get_status","data":null,"msg_id":"a1b2c3d4"}\n
//! {"type":"RESP","module":"mitm","action":"get_status","data":{"is_poisoning":true},"msg_id":"a1b2c3d4"}\n
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use insidious_bridge::ipc::{BridgeClient, Topic};
//! use serde_json::json;
//!
//! let client = BridgeClient::new(BridgeConfig::default());
//! client.connect().await?;
//! let mut events = client.subscribe_channel(Topic::Event);
//! let status = client.request("mitm", "get_status", json!(null)).await?;
//! ```

mod client;
pub mod framing;
mod pending;
mod receiver;
mod router;

pub use client::{BridgeClient, BridgeService, ConnectionState, IpcError, ReplyMode};
pub use framing::FrameError;
pub use pending::{Completion, PendingRequests, Waiter};
pub use receiver::LoopExit;
pub use router::{Handler, Router, Topic};
