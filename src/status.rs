//! Diagnostic views of the ingress state.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::directory::Identity;
use crate::resolver::{Resolver, StatsSnapshot};

/// The status document served at `/ingress`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// Resolution counters.
    pub stats: StatsSnapshot,
    /// Endpoint logical names mapped to their ports.
    pub pods: BTreeMap<String, u16>,
    /// Rule keys mapped to service names.
    pub rules: BTreeMap<String, String>,
}

impl StatusReport {
    /// Collects a report from the resolver's rules, directory and counters.
    #[must_use]
    pub fn collect(resolver: &Resolver) -> Self {
        let pods = resolver
            .directory()
            .endpoints()
            .into_iter()
            .map(|(_, ep)| (ep.logical_name, ep.port))
            .collect();

        let rules = resolver
            .rules()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Self {
            stats: resolver.stats().snapshot(),
            pods,
            rules,
        }
    }

    /// Renders the report as indented JSON.
    ///
    /// # Errors
    ///
    /// Fails only if serialization fails, which the report's types do not do.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Plain text listing returned when a request resolves to nothing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Listing {
    /// The key that failed to resolve.
    pub missing: String,
    /// Tracked pod identities.
    pub pods: Vec<Identity>,
    /// Rule keys.
    pub rules: Vec<String>,
}

impl Listing {
    /// Builds a listing for a failed lookup of `missing`.
    #[must_use]
    pub fn collect(resolver: &Resolver, missing: impl Into<String>) -> Self {
        Self {
            missing: missing.into(),
            pods: resolver.directory().known_identities().into_iter().collect(),
            rules: resolver.rules().keys().map(String::from).collect(),
        }
    }
}

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pods: Vec<_> = self.pods.iter().map(Identity::as_str).collect();

        writeln!(f, "no endpoint for '{}'", self.missing)?;
        writeln!(f, "pods: {pods:?}")?;
        writeln!(f, "rules: {:?}", self.rules)
    }
}
