//! HTTP side of the client: error taxonomy, the refreshing JSON transport and
//! typed production endpoints.

pub mod client;
pub mod error;
pub mod production;

pub use client::ApiClient;
pub use error::{ApiError, HttpErrorKind};
pub use production::ProductionApi;
