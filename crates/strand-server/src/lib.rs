//! Strand server: bootstraps the transport and dispatch stack from
//! configuration.

pub mod demo;
pub mod error;
pub mod stack;

pub use demo::{demo_components, demo_registry};
pub use error::StartupError;
pub use stack::Stack;
