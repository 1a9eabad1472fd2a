#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! A minimal Kubernetes ingress that routes HTTP requests to running pods.
//!
//! The ingress keeps a live directory of pod endpoints built from pod
//! lifecycle events, and resolves every incoming request against a static
//! rule table and that directory before forwarding it to the matching pod.
//!
//! # Features
//!
//! - **Pod discovery**: Real-time endpoint updates via a `Pod` watch, with
//!   periodic resync and relist reconciliation
//! - **Host and path rules**: `host:service` tuples loaded once at startup
//! - **Direct addressing**: `/<namespace>/<name>` reaches a pod without a rule
//! - **Diagnostics**: `/ingress` reports endpoints, rules and hit counters
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use pod_ingress::{Directory, Dispatcher, Resolver, RuleTable, Server, WatchConfig, watch};
//!
//! let rules = Arc::new(RuleTable::load("shop.example.com:default/shop"));
//! let directory = Directory::new();
//! let (signal, drain) = drain::channel();
//!
//! // Feed the directory from the cluster
//! let client = kube::Client::try_default().await?;
//! watch(client, WatchConfig::new(), directory.clone(), drain.clone());
//!
//! // Serve requests
//! let resolver = Arc::new(Resolver::new(rules, directory));
//! let server = Arc::new(Server::new(resolver, Dispatcher::new(Duration::from_secs(10))));
//! server.bind_and_serve("0.0.0.0:80".parse()?, drain).await?;
//! ```

mod args;
mod directory;
mod error;
mod k8s;
mod proxy;
mod resolver;
mod rules;
mod server;
mod status;

pub use args::Args;
pub use directory::{
    Container, Directory, Endpoint, Identity, LifecycleEvent, LifecycleHandler, Phase, Transition,
    UnitSnapshot,
};
pub use error::{Error, Result};
pub use k8s::{WatchConfig, watch};
pub use proxy::{Body, Dispatcher, full};
pub use resolver::{MatchedBy, Resolution, Resolver, Stats, StatsSnapshot};
pub use rules::{RuleError, RuleTable};
pub use server::Server;
pub use status::{Listing, StatusReport};
