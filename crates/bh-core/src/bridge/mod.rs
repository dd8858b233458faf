//! Cross-process status/callback bridge.
//!
//! Lets a front-end process observe and drive the lifecycle controller
//! living in the engine-host process, with no shared memory: a JSON-lines
//! protocol over loopback TCP. Requests carry a numeric id and get exactly
//! one reply; status, alert and log events are pushed unsolicited to every
//! registered listener.

pub mod client;
pub mod proto;
pub mod server;

pub use client::{BridgeClient, BridgeError, ServiceCallback};
pub use server::BridgeServer;
