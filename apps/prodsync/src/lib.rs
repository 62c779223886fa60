//! Client core for live production forms: session handling, REST transport,
//! the STOMP push channel, canonical snapshot sync and per-field saving.

pub mod auth;
pub mod config;
pub mod context;
pub mod field;
pub mod push;
pub mod sync;
pub mod telemetry;
pub mod transport;
pub mod view;

pub use config::{ClientConfig, ReconnectPolicy};
pub use context::{ClientContext, ContextError};
