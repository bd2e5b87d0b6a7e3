//! Error types for the DNS server.
//!
//! This module defines the error types used throughout the server, the
//! constant database and the zone-data compiler.

use thiserror::Error;

/// Represents errors that can occur in the DNS server.
#[derive(Error, Debug)]
pub enum DnsError {
    /// I/O errors from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed packets, out-of-bounds fields and corrupt database reads.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Size limits and arithmetic overflow while building a database or a message.
    #[error("Out of resources: {0}")]
    Resource(String),

    /// Configuration errors, including rejected zone-data lines.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DnsError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        DnsError::Protocol(msg.into())
    }

    pub(crate) fn resource(msg: impl Into<String>) -> Self {
        DnsError::Resource(msg.into())
    }
}
