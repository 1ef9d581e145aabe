//! # tidecall-common
//!
//! Shared configuration, error handling, IDs, and outbound events used across
//! all Tidecall crates. This is the foundation layer: no business logic, just
//! primitives and contracts.

pub mod call_event;
pub mod config;
pub mod error;
pub mod snowflake;
