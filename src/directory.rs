//! Directory of reachable pod endpoints.
//!
//! The directory is driven by lifecycle events: a pod enters it the first time
//! it is observed in the `Running` phase and leaves it when it is observed in
//! any other phase or deleted.
//!
//! # Container policy
//!
//! A pod contributes at most one [`Endpoint`]. Containers are scanned in
//! declaration order and the first container declaring at least one port wins;
//! its first declared port becomes the endpoint port. Later containers are not
//! considered, even if they declare ports too.
//!
//! # Idempotence
//!
//! Once a pod is tracked, further `Running` observations are ignored; the
//! endpoint is not refreshed until the pod leaves the directory and is
//! observed again.

use std::borrow::Borrow;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;

/// Stable key of a pod: `namespace/name`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity(String);

impl Identity {
    /// Builds the `namespace/name` identity of a pod.
    #[must_use]
    pub fn new(namespace: &str, name: &str) -> Self {
        Self(format!("{namespace}/{name}"))
    }

    /// Returns the identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Identity {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Identity {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for Identity {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Readiness phase of a pod.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Accepted but not all containers are running yet.
    Pending,
    /// Bound to a node with all containers started.
    Running,
    /// All containers terminated successfully.
    Succeeded,
    /// All containers terminated, at least one in failure.
    Failed,
    /// Phase could not be determined.
    Unknown,
}

impl From<&str> for Phase {
    fn from(phase: &str) -> Self {
        match phase {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// A container of a pod and the ports it declares, in declaration order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Container {
    /// Container name.
    pub name: String,
    /// Declared container ports.
    pub ports: Vec<u16>,
}

impl Container {
    /// Creates a container description.
    #[must_use]
    pub fn new(name: impl Into<String>, ports: Vec<u16>) -> Self {
        Self {
            name: name.into(),
            ports,
        }
    }
}

/// The state of a pod as delivered by a watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitSnapshot {
    /// Identity of the pod.
    pub identity: Identity,
    /// Current phase.
    pub phase: Phase,
    /// Pod address, absent until one is assigned.
    pub address: Option<IpAddr>,
    /// Containers in declaration order.
    pub containers: Vec<Container>,
}

/// A reachable network target for one pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// The pod identity, suffixed with the container name when the pod has
    /// more than one container.
    pub logical_name: String,
    /// Pod address.
    pub address: Option<IpAddr>,
    /// First port of the selected container.
    pub port: u16,
    /// The snapshot this endpoint was derived from, for diagnostics only.
    pub source: Arc<UnitSnapshot>,
}

impl Endpoint {
    /// Returns the socket address of the endpoint, if the pod has an address.
    #[must_use]
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.address.map(|ip| SocketAddr::new(ip, self.port))
    }
}

/// A lifecycle notification about pods.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A pod was added or updated.
    Observed(UnitSnapshot),
    /// A pod was deleted.
    Deleted(Identity),
    /// A full relist completed; these are all the pods that currently exist.
    Relisted(BTreeSet<Identity>),
}

/// The effect an event had on the directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The pod started being tracked. Carries whether an endpoint was stored.
    Tracked {
        /// True when one of the pod's containers declares a port.
        endpoint: bool,
    },
    /// The listed pods stopped being tracked.
    Untracked(Vec<Identity>),
    /// Nothing changed.
    Unchanged,
}

/// Receives lifecycle events from a watch.
///
/// Returning an error asks the caller to redeliver the event later.
pub trait LifecycleHandler: Send + Sync {
    /// Applies a single event.
    ///
    /// # Errors
    ///
    /// Returns an error when the event could not be applied and should be
    /// retried.
    fn handle(&self, event: LifecycleEvent) -> Result<Transition>;
}

/// The unsynchronized directory state.
#[derive(Debug, Default)]
struct State {
    known: BTreeSet<Identity>,
    endpoints: HashMap<Identity, Endpoint>,
}

impl State {
    fn apply(&mut self, event: LifecycleEvent) -> Transition {
        match event {
            LifecycleEvent::Observed(unit) if unit.phase == Phase::Running => self.track(unit),
            LifecycleEvent::Observed(unit) => self.untrack(&unit.identity),
            LifecycleEvent::Deleted(identity) => self.untrack(&identity),
            LifecycleEvent::Relisted(live) => {
                let stale: Vec<_> = self.known.difference(&live).cloned().collect();
                for identity in &stale {
                    self.remove(identity);
                }

                if stale.is_empty() {
                    Transition::Unchanged
                } else {
                    tracing::info!(pods = ?stale, "removing pods missing from relist");
                    Transition::Untracked(stale)
                }
            }
        }
    }

    fn track(&mut self, unit: UnitSnapshot) -> Transition {
        if self.known.contains(&unit.identity) {
            return Transition::Unchanged;
        }

        tracing::info!(pod = %unit.identity, address = ?unit.address, "tracking pod");
        self.known.insert(unit.identity.clone());

        let multi = unit.containers.len() > 1;
        let selected = unit
            .containers
            .iter()
            .find_map(|c| c.ports.first().map(|port| (c.name.clone(), *port)));

        let Some((container, port)) = selected else {
            tracing::debug!(pod = %unit.identity, "pod declares no ports");
            return Transition::Tracked { endpoint: false };
        };

        let logical_name = if multi {
            format!("{}/{container}", unit.identity)
        } else {
            unit.identity.to_string()
        };

        tracing::debug!(pod = %unit.identity, %container, port, "storing endpoint");
        let identity = unit.identity.clone();
        let endpoint = Endpoint {
            logical_name,
            address: unit.address,
            port,
            source: Arc::new(unit),
        };
        self.endpoints.insert(identity, endpoint);

        Transition::Tracked { endpoint: true }
    }

    fn untrack(&mut self, identity: &Identity) -> Transition {
        if self.remove(identity) {
            tracing::info!(pod = %identity, "untracking pod");
            Transition::Untracked(vec![identity.clone()])
        } else {
            Transition::Unchanged
        }
    }

    fn remove(&mut self, identity: &Identity) -> bool {
        self.endpoints.remove(identity);
        self.known.remove(identity)
    }
}

/// Shared handle to the endpoint directory.
///
/// Clones share the same state. Events are applied under a write lock and
/// every query returns owned copies, so callers never hold the lock while
/// doing I/O.
#[derive(Clone, Debug, Default)]
pub struct Directory {
    state: Arc<RwLock<State>>,
}

impl Directory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a lifecycle event and reports its effect.
    pub fn apply(&self, event: LifecycleEvent) -> Transition {
        self.state.write().apply(event)
    }

    /// Returns a copy of the endpoint stored for `identity`.
    #[must_use]
    pub fn lookup(&self, identity: &str) -> Option<Endpoint> {
        self.state.read().endpoints.get(identity).cloned()
    }

    /// Returns the identities of every tracked pod, including pods without an
    /// endpoint.
    #[must_use]
    pub fn known_identities(&self) -> BTreeSet<Identity> {
        self.state.read().known.clone()
    }

    /// Returns copies of all stored endpoints, ordered by identity.
    #[must_use]
    pub fn endpoints(&self) -> Vec<(Identity, Endpoint)> {
        let state = self.state.read();
        let mut endpoints: Vec<_> = state
            .endpoints
            .iter()
            .map(|(id, ep)| (id.clone(), ep.clone()))
            .collect();
        drop(state);

        endpoints.sort_by(|(a, _), (b, _)| a.cmp(b));
        endpoints
    }
}

impl LifecycleHandler for Directory {
    fn handle(&self, event: LifecycleEvent) -> Result<Transition> {
        Ok(self.apply(event))
    }
}
