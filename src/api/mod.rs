//! Remote storage API client

pub mod client;
pub mod connection;
pub mod errors;
pub mod retry;
pub mod types;

pub use client::{ApiClient, BlockingRemote};
pub use connection::{Connection, ConnectionFlags, Credentials};
pub use errors::ApiError;
pub use types::*;
