//! API Module
//!
//! REST access to scan results and the on-demand scan trigger.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
