pub mod rip;

use crate::network::ip::Ipv4Cidr;
use crate::network::nic::NetworkInterface;
use crate::routing::rip::{RIP_INFINITY, RipEntry};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RouteSource {
    Manual,
    Auto,
    Rip,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub target: Ipv4Cidr,
    /// Next hop, or `None` for directly connected networks
    pub gateway: Option<Ipv4Addr>,
    /// IP address of the output interface
    pub interface: Ipv4Addr,
    pub metric: u32,
    pub source: RouteSource,
}

impl Route {
    pub fn manual(
        target: Ipv4Cidr,
        gateway: Option<Ipv4Addr>,
        interface: Ipv4Addr,
        metric: u32,
    ) -> Self {
        Self {
            target: target.network_cidr(),
            gateway,
            interface,
            metric,
            source: RouteSource::Manual,
        }
    }
}

impl Display for Route {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let gateway = match self.gateway {
            Some(gateway) => gateway.to_string(),
            None => "direct".to_string(),
        };
        write!(
            f,
            "{} via {gateway} dev {} metric {} ({:?})",
            self.target, self.interface, self.metric, self.source
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no route to {0}")]
pub struct RouteNotFound(pub Ipv4Addr);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoutingTableChange {
    Added(Route),
    Removed(Route),
}

struct RipRoute {
    route: Route,
    refreshed: Instant,
}

#[derive(Default)]
struct Tables {
    manual: Vec<Route>,
    auto: Vec<Route>,
    rip: Vec<RipRoute>,
}

impl Tables {
    fn all(&self) -> impl Iterator<Item = &Route> {
        self.manual
            .iter()
            .chain(self.auto.iter())
            .chain(self.rip.iter().map(|r| &r.route))
    }

    fn has_static_route_for(&self, target: Ipv4Cidr) -> bool {
        self.manual
            .iter()
            .chain(self.auto.iter())
            .any(|r| r.target == target)
    }
}

/// Manual, automatic (connected) and RIP-learned routes of a node
pub struct RoutingTable {
    tables: RwLock<Tables>,
    changes: broadcast::Sender<RoutingTableChange>,
}

impl RoutingTable {
    pub(crate) fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            tables: RwLock::default(),
            changes,
        }
    }

    fn notify(&self, change: RoutingTableChange) {
        // Nobody listening is fine
        self.changes.send(change).ok();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoutingTableChange> {
        self.changes.subscribe()
    }

    /// Longest-prefix match; ties are broken by source (manual, then auto, then RIP) and then by
    /// the lower metric
    pub fn best_route(&self, destination: Ipv4Addr) -> Result<Route, RouteNotFound> {
        self.tables
            .read()
            .all()
            .filter(|r| r.target.contains(destination))
            .max_by_key(|r| (r.target.prefix_len(), Reverse(r.source), Reverse(r.metric)))
            .cloned()
            .ok_or(RouteNotFound(destination))
    }

    /// Every route, manual ones first
    pub fn snapshot(&self) -> Vec<Route> {
        self.tables.read().all().cloned().collect()
    }

    pub fn manual_routes(&self) -> Vec<Route> {
        self.tables.read().manual.clone()
    }

    pub fn add_manual(&self, route: Route) {
        let route = Route {
            source: RouteSource::Manual,
            ..route
        };
        self.tables.write().manual.push(route.clone());
        self.notify(RoutingTableChange::Added(route));
    }

    pub fn remove_manual(&self, route: &Route) -> bool {
        let removed = {
            let mut tables = self.tables.write();
            let index = tables.manual.iter().position(|r| r == route);
            index.map(|i| tables.manual.remove(i))
        };

        match removed {
            Some(route) => {
                self.notify(RoutingTableChange::Removed(route));
                true
            }
            None => false,
        }
    }

    /// Replaces the automatic routes, notifying only the actual differences
    pub(crate) fn set_auto_routes(&self, routes: Vec<Route>) {
        let old = std::mem::replace(&mut self.tables.write().auto, routes.clone());
        for route in old.iter().filter(|r| !routes.contains(r)) {
            self.notify(RoutingTableChange::Removed(route.clone()));
        }
        for route in routes.iter().filter(|r| !old.contains(r)) {
            self.notify(RoutingTableChange::Added(route.clone()));
        }
    }

    pub fn rip_routes(&self) -> Vec<Route> {
        self.tables
            .read()
            .rip
            .iter()
            .map(|r| r.route.clone())
            .collect()
    }

    /// Merges a RIP advertisement received from `neighbor` on the interface with address
    /// `interface`
    pub(crate) fn merge_rip(&self, entries: &[RipEntry], neighbor: Ipv4Addr, interface: Ipv4Addr) {
        let now = Instant::now();
        let mut changes = Vec::new();
        {
            let mut tables = self.tables.write();
            for entry in entries {
                let target = entry.target.network_cidr();
                if tables.has_static_route_for(target) {
                    continue;
                }

                let metric = entry.metric.saturating_add(1).min(RIP_INFINITY);
                let existing = tables.rip.iter().position(|r| r.route.target == target);
                let new_route = RipRoute {
                    route: Route {
                        target,
                        gateway: Some(neighbor),
                        interface,
                        metric,
                        source: RouteSource::Rip,
                    },
                    refreshed: now,
                };

                match existing {
                    None if metric < RIP_INFINITY => {
                        changes.push(RoutingTableChange::Added(new_route.route.clone()));
                        tables.rip.push(new_route);
                    }
                    None => {}
                    Some(i) if tables.rip[i].route.gateway == Some(neighbor) => {
                        if metric >= RIP_INFINITY {
                            let removed = tables.rip.remove(i);
                            changes.push(RoutingTableChange::Removed(removed.route));
                        } else if tables.rip[i].route != new_route.route {
                            let old = std::mem::replace(&mut tables.rip[i], new_route);
                            changes.push(RoutingTableChange::Removed(old.route));
                            changes.push(RoutingTableChange::Added(tables.rip[i].route.clone()));
                        } else {
                            tables.rip[i].refreshed = now;
                        }
                    }
                    Some(i) if metric < tables.rip[i].route.metric => {
                        let old = std::mem::replace(&mut tables.rip[i], new_route);
                        changes.push(RoutingTableChange::Removed(old.route));
                        changes.push(RoutingTableChange::Added(tables.rip[i].route.clone()));
                    }
                    Some(_) => {}
                }
            }
        }

        for change in changes {
            self.notify(change);
        }
    }

    /// Drops the RIP routes that were not refreshed within `timeout`
    pub(crate) fn expire_rip(&self, timeout: Duration) {
        let now = Instant::now();
        let expired: Vec<_> = {
            let mut tables = self.tables.write();
            let (expired, alive) = std::mem::take(&mut tables.rip)
                .into_iter()
                .partition(|r| now.saturating_duration_since(r.refreshed) >= timeout);
            tables.rip = alive;
            expired
        };

        for r in expired {
            self.notify(RoutingTableChange::Removed(r.route));
        }
    }

    pub(crate) fn clear_rip(&self) {
        let cleared = std::mem::take(&mut self.tables.write().rip);
        for r in cleared {
            self.notify(RoutingTableChange::Removed(r.route));
        }
    }
}

/// Connected-network routes for every addressed interface, plus a default route per gateway
pub(crate) fn auto_routes(nics: &[Arc<NetworkInterface>]) -> Vec<Route> {
    let mut routes = Vec::new();
    for nic in nics {
        let addressing = nic.addressing();
        let Some(cidr) = addressing.ip else {
            continue;
        };

        routes.push(Route {
            target: cidr.network_cidr(),
            gateway: None,
            interface: cidr.address(),
            metric: 0,
            source: RouteSource::Auto,
        });

        if let Some(gateway) = addressing.gateway {
            routes.push(Route {
                target: Ipv4Cidr::DEFAULT_ROUTE,
                gateway: Some(gateway),
                interface: cidr.address(),
                metric: 1,
                source: RouteSource::Auto,
            });
        }
    }

    routes
}

#[cfg(test)]
mod test {
    use super::*;

    fn cidr(s: &str) -> Ipv4Cidr {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn auto(target: &str, interface: &str) -> Route {
        Route {
            target: cidr(target),
            gateway: None,
            interface: ip(interface),
            metric: 0,
            source: RouteSource::Auto,
        }
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = RoutingTable::new();
        table.add_manual(Route::manual(cidr("10.0.0.0/8"), Some(ip("192.168.0.1")), ip("192.168.0.2"), 1));
        table.add_manual(Route::manual(cidr("10.1.0.0/16"), Some(ip("192.168.0.3")), ip("192.168.0.2"), 5));

        let route = table.best_route(ip("10.1.2.3")).unwrap();
        assert_eq!(route.gateway, Some(ip("192.168.0.3")));

        let route = table.best_route(ip("10.2.0.1")).unwrap();
        assert_eq!(route.gateway, Some(ip("192.168.0.1")));

        assert_eq!(
            table.best_route(ip("11.0.0.1")),
            Err(RouteNotFound(ip("11.0.0.1")))
        );
    }

    #[test]
    fn test_ties_prefer_manual_then_lower_metric() {
        let table = RoutingTable::new();
        table.set_auto_routes(vec![auto("10.0.0.0/24", "10.0.0.1")]);
        table.merge_rip(
            &[RipEntry {
                target: cidr("10.0.1.0/24"),
                metric: 1,
            }],
            ip("10.0.0.2"),
            ip("10.0.0.1"),
        );
        assert_eq!(
            table.best_route(ip("10.0.1.9")).unwrap().source,
            RouteSource::Rip
        );

        table.add_manual(Route::manual(cidr("10.0.1.0/24"), Some(ip("10.0.0.3")), ip("10.0.0.1"), 10));
        assert_eq!(
            table.best_route(ip("10.0.1.9")).unwrap().source,
            RouteSource::Manual
        );

        table.add_manual(Route::manual(cidr("10.0.1.0/24"), Some(ip("10.0.0.4")), ip("10.0.0.1"), 2));
        assert_eq!(
            table.best_route(ip("10.0.1.9")).unwrap().gateway,
            Some(ip("10.0.0.4"))
        );
    }

    #[test]
    fn test_manual_routes_can_be_removed() {
        let table = RoutingTable::new();
        let mut changes = table.subscribe();
        let route = Route::manual(cidr("10.1.0.0/16"), Some(ip("10.0.0.2")), ip("10.0.0.1"), 1);
        table.add_manual(route.clone());
        assert!(table.best_route(ip("10.1.0.1")).is_ok());

        assert!(table.remove_manual(&route));
        assert!(!table.remove_manual(&route));
        assert!(table.manual_routes().is_empty());
        assert!(table.best_route(ip("10.1.0.1")).is_err());

        assert_eq!(changes.try_recv(), Ok(RoutingTableChange::Added(route.clone())));
        assert_eq!(changes.try_recv(), Ok(RoutingTableChange::Removed(route)));
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rip_merge_rules() {
        let table = RoutingTable::new();
        table.set_auto_routes(vec![auto("10.0.0.0/24", "10.0.0.1")]);
        let neighbor_a = ip("10.0.0.2");
        let neighbor_b = ip("10.0.0.3");
        let entry = |target: &str, metric| RipEntry {
            target: cidr(target),
            metric,
        };

        // Unknown prefixes are accepted, connected ones ignored, unreachable ones skipped
        table.merge_rip(
            &[
                entry("10.1.0.0/16", 1),
                entry("10.0.0.0/24", 0),
                entry("10.2.0.0/16", 15),
            ],
            neighbor_a,
            ip("10.0.0.1"),
        );
        let routes = table.rip_routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].target, cidr("10.1.0.0/16"));
        assert_eq!(routes[0].metric, 2);

        // A different neighbor only replaces the route when strictly better
        table.merge_rip(&[entry("10.1.0.0/16", 1)], neighbor_b, ip("10.0.0.1"));
        assert_eq!(table.rip_routes()[0].gateway, Some(neighbor_a));
        table.merge_rip(&[entry("10.1.0.0/16", 0)], neighbor_b, ip("10.0.0.1"));
        assert_eq!(table.rip_routes()[0].gateway, Some(neighbor_b));
        assert_eq!(table.rip_routes()[0].metric, 1);

        // The current neighbor may make things worse, and infinity removes the route
        table.merge_rip(&[entry("10.1.0.0/16", 4)], neighbor_b, ip("10.0.0.1"));
        assert_eq!(table.rip_routes()[0].metric, 5);
        table.merge_rip(&[entry("10.1.0.0/16", 16)], neighbor_b, ip("10.0.0.1"));
        assert!(table.rip_routes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rip_routes_expire() {
        let table = RoutingTable::new();
        let mut changes = table.subscribe();
        let entry = RipEntry {
            target: cidr("10.1.0.0/16"),
            metric: 1,
        };

        table.merge_rip(std::slice::from_ref(&entry), ip("10.0.0.2"), ip("10.0.0.1"));
        tokio::time::sleep(Duration::from_secs(100)).await;
        table.merge_rip(std::slice::from_ref(&entry), ip("10.0.0.2"), ip("10.0.0.1"));
        tokio::time::sleep(Duration::from_secs(100)).await;

        // Refreshed 100s ago
        table.expire_rip(Duration::from_secs(180));
        assert_eq!(table.rip_routes().len(), 1);

        tokio::time::sleep(Duration::from_secs(80)).await;
        table.expire_rip(Duration::from_secs(180));
        assert!(table.rip_routes().is_empty());

        assert!(matches!(changes.try_recv(), Ok(RoutingTableChange::Added(_))));
        assert!(matches!(changes.try_recv(), Ok(RoutingTableChange::Removed(_))));
    }
}
