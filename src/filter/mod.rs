//! Split-routing filter.
//!
//! Decides per domain and per resolved address whether traffic leaves
//! through the tunnel or goes direct, and drives the system routing table
//! to match.

mod engine;
mod route;
mod rules;
mod service;

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use engine::FilterEngine;
pub use route::{RouteControl, RouteError, RouteLog, RouteOp};
pub use rules::DomainRules;
pub use service::{FilterHandle, FilterService};

/// Catch-all route sent through the tunnel in blacklist mode.
pub fn route_all() -> Ipv4Network {
    // A zero prefix is always valid.
    Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0)
        .unwrap_or_else(|_| Ipv4Network::from(Ipv4Addr::UNSPECIFIED))
}

pub const DEFAULT_DIRECT_DNS_SERVER: Ipv4Addr = Ipv4Addr::new(114, 114, 114, 114);

/// Routing policy.
///
/// In blacklist mode everything is tunneled except matched domains and
/// static CIDRs, which go direct. Whitelist mode is the inverse: only
/// matched domains and static CIDRs use the tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    #[default]
    Blacklist,
    Whitelist,
}

impl FilterMode {
    fn add_op(self, cidr: Ipv4Network) -> RouteOp {
        match self {
            FilterMode::Blacklist => RouteOp::AddDirect(cidr),
            FilterMode::Whitelist => RouteOp::AddTunneled(cidr),
        }
    }

    fn remove_op(self, cidr: Ipv4Network) -> RouteOp {
        match self {
            FilterMode::Blacklist => RouteOp::RemoveDirect(cidr),
            FilterMode::Whitelist => RouteOp::RemoveTunneled(cidr),
        }
    }
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid domain pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: Box<fancy_regex::Error>,
    },

    #[error("filter service is gone")]
    Closed,
}
