//! CLI command implementations.

pub mod demo;
pub mod fxdump;
pub mod globset;
