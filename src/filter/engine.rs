//! Split-routing policy state.
//!
//! The engine owns the active route set. Every CIDR in it received exactly
//! one add side effect and receives exactly one remove when the policy is
//! torn down.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use super::route::{RouteControl, RouteOp};
use super::rules::DomainRules;
use super::{FilterError, FilterMode, route_all};

struct ActivePolicy {
    mode: FilterMode,
    rules: DomainRules,
    routes: FxHashSet<Ipv4Network>,
}

/// Decides tunnel or direct routing for domains and addresses.
pub struct FilterEngine {
    route_control: Box<dyn RouteControl>,
    direct_dns_server: Ipv4Addr,
    policy: Option<ActivePolicy>,
}

impl FilterEngine {
    /// Create an uninitialized engine.
    ///
    /// `direct_dns_server` is routed around the tunnel in blacklist mode so
    /// that direct resolution never depends on the tunnel.
    pub fn new(route_control: Box<dyn RouteControl>, direct_dns_server: Ipv4Addr) -> Self {
        Self {
            route_control,
            direct_dns_server,
            policy: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.policy.is_some()
    }

    pub fn mode(&self) -> Option<FilterMode> {
        self.policy.as_ref().map(|p| p.mode)
    }

    /// Activate a policy and issue its initial routes. No-op if already active.
    pub fn init<S: AsRef<str>>(
        &mut self,
        mode: FilterMode,
        domain_patterns: &[S],
        static_cidrs: &[Ipv4Network],
    ) -> Result<(), FilterError> {
        if self.policy.is_some() {
            return Ok(());
        }

        let rules = DomainRules::compile(domain_patterns)?;
        let mut routes = FxHashSet::default();

        if mode == FilterMode::Blacklist {
            self.issue(RouteOp::AddTunneled(route_all()));
            self.issue(RouteOp::AddDirect(host_route(self.direct_dns_server)));
        }
        for &cidr in static_cidrs {
            if routes.insert(cidr) {
                self.issue(mode.add_op(cidr));
            }
        }

        info!(
            ?mode,
            patterns = rules.len(),
            cidrs = routes.len(),
            "filter initialized"
        );
        self.policy = Some(ActivePolicy {
            mode,
            rules,
            routes,
        });
        Ok(())
    }

    /// Reverse every route this policy issued and clear all state.
    pub fn uninit(&mut self) {
        let Some(policy) = self.policy.take() else {
            return;
        };

        if policy.mode == FilterMode::Blacklist {
            self.issue(RouteOp::RemoveDirect(host_route(self.direct_dns_server)));
            self.issue(RouteOp::RemoveTunneled(route_all()));
        }
        for &cidr in &policy.routes {
            self.issue(policy.mode.remove_op(cidr));
        }

        info!(routes = policy.routes.len(), "filter uninitialized");
    }

    /// Check if `name` matches a configured pattern. False while inactive.
    pub fn match_domain(&mut self, name: &str) -> bool {
        match &mut self.policy {
            Some(policy) => policy.rules.matches(name),
            None => false,
        }
    }

    /// Add `ip/32` to the active route set, issuing its route once.
    ///
    /// Returns true if the address was new.
    pub fn note_resolved_ip(&mut self, ip: Ipv4Addr) -> bool {
        let Some(policy) = &mut self.policy else {
            return false;
        };

        let cidr = host_route(ip);
        if !policy.routes.insert(cidr) {
            return false;
        }
        let op = policy.mode.add_op(cidr);
        debug!(%ip, "new resolved address");
        self.issue(op);
        true
    }

    /// The active route set, sorted.
    pub fn active_routes(&self) -> Vec<Ipv4Network> {
        let mut routes: Vec<_> = self
            .policy
            .iter()
            .flat_map(|p| p.routes.iter().copied())
            .collect();
        routes.sort_by_key(|n| (n.ip(), n.prefix()));
        routes
    }

    fn issue(&self, op: RouteOp) {
        if let Err(e) = self.route_control.apply(op) {
            warn!(error = %e, "route change failed");
        }
    }
}

fn host_route(ip: Ipv4Addr) -> Ipv4Network {
    Ipv4Network::from(ip)
}
