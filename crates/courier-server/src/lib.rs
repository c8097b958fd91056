//! # courier-server
//!
//! Axum HTTP + `WebSocket` front end for courier connection types.
//!
//! - `WebSocket` gateway at `/ws` and `/ws/{user_id}` with heartbeat
//! - Connection coordinator: admission, session cache, group membership,
//!   inbound validation and per-delivery routing passes
//! - In-memory channel layer, session cache and user directory
//! - Layered JSON settings with `COURIER_*` env overrides
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod health;
pub mod memory;
pub mod server;
pub mod settings;
pub mod shutdown;

pub use connection::{admit, Admission, Connection, Services};
pub use consumer::{Consumer, ConsumerBuilder, Lifecycle, LifecycleContext};
pub use server::{CourierServer, ServerError};
