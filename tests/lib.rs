//! Cross-crate integration tests for the odmcp gateway

pub mod common;
