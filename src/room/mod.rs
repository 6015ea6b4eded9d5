//! Room membership module
//!
//! Tracks which connections are in which room.

mod registry;

pub use registry::*;
