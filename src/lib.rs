//! splitvpn - A split-tunnel UDP VPN client.
//!
//! Traffic is relayed through an encrypted UDP tunnel, except for
//! destinations whose DNS names match the configured filter, which are
//! re-resolved directly and routed around the tunnel (or, in whitelist mode,
//! the only destinations routed through it).

pub mod checksum;
pub mod config;
pub mod crypto;
pub mod device;
pub mod dns;
pub mod filter;
pub mod orchestrator;
pub mod protocol;
pub mod resolver;
pub mod rewriter;
pub mod stats;
pub mod transport;
