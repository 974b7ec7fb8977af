//! kvnode Core Types
//!
//! This crate provides the fundamental types shared by every kvnode crate:
//! - Binary request/response protocol types and the frame codec
//! - Mutation events fanned out to bucket subscribers
//! - View query parameters and row collation
//! - Core error types

pub mod error;
pub mod events;
pub mod protocol;
pub mod views;

pub use error::{Error, Result};
