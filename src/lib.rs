//! cdbdns
//!
//! An authoritative DNS server that answers from a constant database
//! compiled from plain-text zone data. It handles queries over UDP and TCP,
//! supports split-horizon answers by client location, and picks up new
//! database generations without a restart.

pub mod cdb;
pub mod codec;
pub mod config;
pub mod db;
pub mod dns;
pub mod errors;
pub mod handlers;
pub mod lookup;
pub mod record;
pub mod response;
pub mod zonefile;

// Re-export commonly used items
pub use cdb::{Cdb, CdbBuilder, CdbFile};
pub use config::ServerConfig;
pub use db::Database;
pub use errors::DnsError;
pub use lookup::{lookup, lookup_at};
pub use zonefile::ZoneCompiler;
