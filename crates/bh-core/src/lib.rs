//! bh-core: the supervisory layer around an embedded packet-routing engine.
//!
//! The engine itself (config compilation, tunneling, traffic handling) is an
//! external library behind the `bh-engine` traits. This crate supervises it:
//!
//! - [`lifecycle`] — the `Stopped → Starting → Started → Stopping` state
//!   machine owning the single engine handle and the optional command
//!   endpoint, plus the supervisor event loop that serializes operations.
//! - [`bridge`] — the cross-process status/callback bridge between the
//!   engine-host process and front-end processes (loopback JSON-lines IPC).
//! - [`command`] — the bounded-retry streaming command channel client.
//! - [`shim`] — the degraded-mode HTTP control surface.
//! - [`bootstrap`], [`settings`], [`logbuf`] — working directories, the
//!   shared settings cell and the bounded service log.

pub mod bootstrap;
pub mod bridge;
pub mod command;
pub mod lifecycle;
pub mod logbuf;
pub mod settings;
pub mod shim;
