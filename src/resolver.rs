//! Request resolution against the rule table and the endpoint directory.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::directory::{Directory, Endpoint};
use crate::rules::RuleTable;

/// Resolution counters. They only ever increase.
#[derive(Debug, Default)]
pub struct Stats {
    rule_hits: AtomicU64,
    found: AtomicU64,
    not_found: AtomicU64,
}

/// A point-in-time copy of [`Stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Requests that resolved to no endpoint.
    #[serde(rename = "errNotFound")]
    pub not_found: u64,
    /// Requests that resolved to an endpoint.
    pub found: u64,
    /// Requests whose host or path matched a rule.
    #[serde(rename = "ruleHit")]
    pub rule_hits: u64,
}

impl Stats {
    /// Reads the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            not_found: self.not_found.load(Ordering::Relaxed),
            found: self.found.load(Ordering::Relaxed),
            rule_hits: self.rule_hits.load(Ordering::Relaxed),
        }
    }
}

/// How a request key was matched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchedBy {
    /// The request host matched a rule.
    HostRule,
    /// The request path key matched a rule.
    PathRule,
    /// The request path key was looked up as a pod identity.
    Identity,
}

/// Outcome of resolving a request.
#[derive(Clone, Debug)]
pub struct Resolution {
    /// The key that decided the outcome: the host for a host rule, the path
    /// key otherwise.
    pub key: String,
    /// Which step of the lookup decided the outcome.
    pub matched_by: MatchedBy,
    /// The endpoint, when one is currently known.
    pub endpoint: Option<Endpoint>,
    /// Path to request from the endpoint. A host rule keeps the whole
    /// request path; otherwise the matched key is cut off the front.
    pub rest: String,
}

/// Resolves request hosts and paths to endpoints.
///
/// Lookups are tried in order, and the first that matches decides:
///
/// 1. the host against the rule table,
/// 2. the first path segment against the rule table,
/// 3. the first path segment as a pod identity, then the first two segments
///    as a `namespace/name` identity.
///
/// A rule match never falls through, even when the rule's target is not in
/// the directory.
#[derive(Debug)]
pub struct Resolver {
    rules: Arc<RuleTable>,
    directory: Directory,
    stats: Stats,
}

impl Resolver {
    /// Creates a resolver over the given rules and directory.
    #[must_use]
    pub fn new(rules: Arc<RuleTable>, directory: Directory) -> Self {
        Self {
            rules,
            directory,
            stats: Stats::default(),
        }
    }

    /// Resolves a request.
    ///
    /// `path` is the request path; its first segment, without the leading
    /// `/`, is the path key.
    pub fn resolve(&self, host: &str, path: &str) -> Resolution {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let (segment, tail) = split_segment(trimmed);

        let resolution = if let Some(service) = self.rules.lookup(host) {
            self.stats.rule_hits.fetch_add(1, Ordering::Relaxed);
            Resolution {
                key: host.to_string(),
                matched_by: MatchedBy::HostRule,
                endpoint: self.directory.lookup(service),
                rest: remainder(path),
            }
        } else if let Some(service) = self.rules.lookup(segment) {
            self.stats.rule_hits.fetch_add(1, Ordering::Relaxed);
            Resolution {
                key: segment.to_string(),
                matched_by: MatchedBy::PathRule,
                endpoint: self.directory.lookup(service),
                rest: remainder(tail),
            }
        } else if let Some(endpoint) = self.directory.lookup(segment) {
            Resolution {
                key: segment.to_string(),
                matched_by: MatchedBy::Identity,
                endpoint: Some(endpoint),
                rest: remainder(tail),
            }
        } else if let Some((key, endpoint, tail)) = self.namespaced(trimmed) {
            Resolution {
                key: key.to_string(),
                matched_by: MatchedBy::Identity,
                endpoint: Some(endpoint),
                rest: remainder(tail),
            }
        } else {
            Resolution {
                key: segment.to_string(),
                matched_by: MatchedBy::Identity,
                endpoint: None,
                rest: remainder(tail),
            }
        };

        if resolution.endpoint.is_some() {
            self.stats.found.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.not_found.fetch_add(1, Ordering::Relaxed);
        }

        tracing::debug!(
            host,
            path,
            key = %resolution.key,
            matched_by = ?resolution.matched_by,
            found = resolution.endpoint.is_some(),
            "resolved request"
        );
        resolution
    }

    /// Looks up the first two segments of `path` as a `namespace/name`
    /// identity.
    fn namespaced<'p>(&self, path: &'p str) -> Option<(&'p str, Endpoint, &'p str)> {
        let (namespace, tail) = split_segment(path);
        let (name, rest) = split_segment(tail.strip_prefix('/')?);
        if namespace.is_empty() || name.is_empty() {
            return None;
        }

        let key = &path[..namespace.len() + 1 + name.len()];
        let endpoint = self.directory.lookup(key)?;
        Some((key, endpoint, rest))
    }

    /// The rule table.
    #[must_use]
    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// The endpoint directory.
    #[must_use]
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// The resolution counters.
    #[must_use]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }
}

/// Splits a path without its leading `/` into its first segment and the
/// rest, which keeps its `/`.
fn split_segment(path: &str) -> (&str, &str) {
    match path.find('/') {
        Some(at) => path.split_at(at),
        None => (path, ""),
    }
}

fn remainder(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Container, LifecycleEvent, Phase, UnitSnapshot};

    fn running(identity: &str, address: &str, port: u16) -> LifecycleEvent {
        LifecycleEvent::Observed(UnitSnapshot {
            identity: identity.into(),
            phase: Phase::Running,
            address: Some(address.parse().unwrap()),
            containers: vec![Container::new("app", vec![port])],
        })
    }

    fn shop_resolver() -> Resolver {
        let rules = RuleTable::parse("shop.example.com:shop-svc,api.example.com:api-svc").0;
        let directory = Directory::new();
        directory.apply(running("shop-svc", "10.0.0.5", 8080));
        Resolver::new(Arc::new(rules), directory)
    }

    #[test]
    fn host_rule_resolves() {
        let resolver = shop_resolver();

        let res = resolver.resolve("shop.example.com", "/");

        assert_eq!(res.matched_by, MatchedBy::HostRule);
        assert_eq!(res.key, "shop.example.com");
        assert_eq!(
            res.endpoint.unwrap().socket_addr(),
            Some("10.0.0.5:8080".parse().unwrap())
        );
        assert_eq!(
            resolver.stats().snapshot(),
            StatsSnapshot {
                not_found: 0,
                found: 1,
                rule_hits: 1,
            }
        );
    }

    #[test]
    fn falls_through_to_identity() {
        let resolver = shop_resolver();

        let res = resolver.resolve("unknown.example.com", "/shop-svc");

        assert_eq!(res.matched_by, MatchedBy::Identity);
        assert_eq!(res.key, "shop-svc");
        assert!(res.endpoint.is_some());
        let stats = resolver.stats().snapshot();
        assert_eq!(stats.rule_hits, 0);
        assert_eq!(stats.found, 1);
    }

    #[test]
    fn host_rule_miss_does_not_fall_through() {
        let resolver = shop_resolver();

        let res = resolver.resolve("api.example.com", "/shop-svc");

        assert_eq!(res.matched_by, MatchedBy::HostRule);
        assert!(res.endpoint.is_none());
        assert_eq!(
            resolver.stats().snapshot(),
            StatsSnapshot {
                not_found: 1,
                found: 0,
                rule_hits: 1,
            }
        );
    }

    #[test]
    fn host_rule_precedes_path_rule() {
        let rules = RuleTable::parse("shop.example.com:shop-svc,api:api-svc").0;
        let directory = Directory::new();
        directory.apply(running("shop-svc", "10.0.0.5", 8080));
        directory.apply(running("api-svc", "10.0.0.6", 9090));
        let resolver = Resolver::new(Arc::new(rules), directory);

        let res = resolver.resolve("shop.example.com", "/api");

        assert_eq!(res.matched_by, MatchedBy::HostRule);
        assert_eq!(res.endpoint.unwrap().port, 8080);
        assert_eq!(resolver.stats().snapshot().rule_hits, 1);
    }

    #[test]
    fn path_rule_resolves() {
        let rules = RuleTable::parse("api:default/api").0;
        let directory = Directory::new();
        directory.apply(running("default/api", "10.0.0.6", 9090));
        let resolver = Resolver::new(Arc::new(rules), directory);

        let res = resolver.resolve("localhost", "/api");

        assert_eq!(res.matched_by, MatchedBy::PathRule);
        assert_eq!(res.key, "api");
        assert_eq!(res.endpoint.unwrap().port, 9090);
        assert_eq!(resolver.stats().snapshot().rule_hits, 1);
    }

    #[test]
    fn first_segment_resolves_identity() {
        let resolver = shop_resolver();

        let res = resolver.resolve("unknown.example.com", "/shop-svc/items");

        assert_eq!(res.matched_by, MatchedBy::Identity);
        assert_eq!(res.key, "shop-svc");
        assert_eq!(res.rest, "/items");
        assert_eq!(res.endpoint.unwrap().port, 8080);
        assert_eq!(resolver.stats().snapshot().found, 1);
    }

    #[test]
    fn first_segment_hits_path_rule() {
        let rules = RuleTable::parse("shop.example.com:shop-svc,cart:shop-svc").0;
        let directory = Directory::new();
        directory.apply(running("shop-svc", "10.0.0.5", 8080));
        let resolver = Resolver::new(Arc::new(rules), directory);

        let res = resolver.resolve("unknown.example.com", "/cart/42");

        assert_eq!(res.matched_by, MatchedBy::PathRule);
        assert_eq!(res.key, "cart");
        assert_eq!(res.rest, "/42");
        assert!(res.endpoint.is_some());
        assert_eq!(
            resolver.stats().snapshot(),
            StatsSnapshot {
                not_found: 0,
                found: 1,
                rule_hits: 1,
            }
        );
    }

    #[test]
    fn host_rule_keeps_whole_path() {
        let resolver = shop_resolver();

        let res = resolver.resolve("shop.example.com", "/cart/42");

        assert_eq!(res.rest, "/cart/42");
    }

    #[test]
    fn split_segment_keeps_separator() {
        assert_eq!(split_segment("shop-svc/items/1"), ("shop-svc", "/items/1"));
        assert_eq!(split_segment("shop-svc"), ("shop-svc", ""));
        assert_eq!(split_segment(""), ("", ""));
    }

    #[test]
    fn namespaced_identity_is_addressable_by_path() {
        let directory = Directory::new();
        directory.apply(running("default/echo", "10.0.0.7", 5678));
        let resolver = Resolver::new(Arc::new(RuleTable::default()), directory);

        let res = resolver.resolve("localhost", "/default/echo");

        assert_eq!(res.key, "default/echo");
        assert_eq!(res.rest, "/");
        assert!(res.endpoint.is_some());

        let res = resolver.resolve("localhost", "/default/echo/health");

        assert_eq!(res.key, "default/echo");
        assert_eq!(res.rest, "/health");
        assert!(res.endpoint.is_some());
    }

    #[test]
    fn namespace_alone_is_a_miss() {
        let directory = Directory::new();
        directory.apply(running("default/echo", "10.0.0.7", 5678));
        let resolver = Resolver::new(Arc::new(RuleTable::default()), directory);

        let res = resolver.resolve("localhost", "/default");

        assert_eq!(res.key, "default");
        assert!(res.endpoint.is_none());
        assert_eq!(resolver.stats().snapshot().not_found, 1);
    }

    #[test]
    fn miss_counts_not_found() {
        let resolver = shop_resolver();

        let res = resolver.resolve("unknown.example.com", "/nothing");
        resolver.resolve("unknown.example.com", "/");

        assert_eq!(res.matched_by, MatchedBy::Identity);
        assert!(res.endpoint.is_none());
        assert_eq!(
            resolver.stats().snapshot(),
            StatsSnapshot {
                not_found: 2,
                found: 0,
                rule_hits: 0,
            }
        );
    }

    #[test]
    fn resolution_follows_directory_changes() {
        let resolver = shop_resolver();
        assert!(resolver.resolve("shop.example.com", "/").endpoint.is_some());

        resolver
            .directory()
            .apply(LifecycleEvent::Deleted("shop-svc".into()));

        assert!(resolver.resolve("shop.example.com", "/").endpoint.is_none());
    }

    #[test]
    fn concurrent_resolves_lose_no_counts() {
        const THREADS: u64 = 8;
        const REQUESTS: u64 = 500;

        let resolver = shop_resolver();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..REQUESTS {
                    let directory = resolver.directory();
                    directory.apply(running("churn", "10.0.0.9", 9000));
                    directory.apply(LifecycleEvent::Deleted("churn".into()));
                }
            });

            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..REQUESTS {
                        let res = resolver.resolve("shop.example.com", "/");
                        assert!(res.endpoint.is_some());
                        resolver.resolve("unknown.example.com", "/churn");
                    }
                });
            }
        });

        let stats = resolver.stats().snapshot();
        assert_eq!(stats.found + stats.not_found, THREADS * REQUESTS * 2);
        assert_eq!(stats.rule_hits, THREADS * REQUESTS);
        assert!(stats.found >= THREADS * REQUESTS);
        assert!(resolver.directory().lookup("churn").is_none());
    }

    #[test]
    fn stats_serialize_with_wire_names() {
        let stats = StatsSnapshot {
            not_found: 3,
            found: 2,
            rule_hits: 1,
        };

        assert_eq!(
            serde_json::to_string(&stats).unwrap(),
            r#"{"errNotFound":3,"found":2,"ruleHit":1}"#
        );
    }
}
