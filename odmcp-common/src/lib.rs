//! odmcp Common Types
//!
//! Request/response types and HTTP error rendering shared by the gateway
//! server and its integration tests.

pub mod error;
pub mod types;

pub use error::{GatewayError, Result};
