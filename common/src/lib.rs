//! Common code shared between `sign_server` and `camera`.
pub mod detection;
pub mod letters;
pub mod protocol;

/// Error type.
pub type Error = Box<dyn std::error::Error>;
