//! Skiff library
//!
//! Named-sharing file server and client: framed TCP session protocol,
//! path-confined remote filesystem commands, checked transfers and
//! one-way sync, plus UDP server discovery.

pub mod channel;
pub mod client;
pub mod confine;
pub mod discovery;
pub mod get;
pub mod logger;
pub mod proto;
pub mod put;
pub mod server;
pub mod session;
pub mod sharing;
pub mod url;
