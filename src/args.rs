use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time;
use tracing::info;

use crate::directory::Directory;
use crate::k8s::{self, WatchConfig};
use crate::proxy::Dispatcher;
use crate::resolver::Resolver;
use crate::rules::RuleTable;
use crate::server::Server;

/// Command line and environment configuration of the ingress.
#[derive(Clone, Debug, Parser)]
#[command(name = "pod-ingress", about = "Routes HTTP requests to running pods", version)]
pub struct Args {
    /// Tracing filter directive.
    #[arg(long, default_value = "info", env = "INGRESS_LOG")]
    pub log_level: String,

    /// Comma-separated `host:service` routing rules.
    #[arg(long, default_value = "", env = "RULES")]
    pub rules: String,

    /// Address the HTTP server listens on.
    #[arg(long, default_value = "0.0.0.0:80", env = "LISTEN_ADDR")]
    pub listen_addr: SocketAddr,

    /// Only watch pods in this namespace.
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Only watch pods matching this label selector.
    #[arg(long, env = "POD_SELECTOR")]
    pub selector: Option<String>,

    /// Seconds between full replays of the cached pods.
    #[arg(
        long,
        default_value = "5",
        env = "RESYNC_INTERVAL_SECS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub resync_interval_secs: u64,

    /// Redeliveries of a rejected lifecycle event before it is dropped.
    #[arg(long, default_value = "5", env = "MAX_RETRIES")]
    pub max_retries: usize,

    /// Milliseconds to wait for an upstream pod to answer.
    #[arg(
        long,
        default_value = "10000",
        env = "UPSTREAM_TIMEOUT_MS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub upstream_timeout_ms: u64,

    /// Answer unresolved requests with 404 instead of 200.
    #[arg(long, env = "STRICT_NOT_FOUND")]
    pub strict_not_found: bool,

    /// Seconds to wait for in-flight requests on shutdown.
    #[arg(long, default_value = "30", env = "SHUTDOWN_GRACE_SECS")]
    pub shutdown_grace_secs: u64,
}

impl Args {
    /// Builds the pod watch configuration.
    #[must_use]
    pub fn watch_config(&self) -> WatchConfig {
        let mut config = WatchConfig::new()
            .resync_interval(Duration::from_secs(self.resync_interval_secs))
            .max_retries(self.max_retries);
        if let Some(namespace) = &self.namespace {
            config = config.namespace(namespace);
        }
        if let Some(selector) = &self.selector {
            config = config.labels(selector);
        }
        config
    }

    /// Runs the ingress until SIGINT or SIGTERM.
    ///
    /// # Errors
    ///
    /// Fails when no Kubernetes configuration can be found or the listen
    /// address cannot be bound.
    pub async fn run(self) -> Result<()> {
        let rules = Arc::new(RuleTable::load(&self.rules));
        let directory = Directory::new();

        let client = kube::Client::try_default()
            .await
            .context("error loading kubernetes configuration")?;

        let (signal, drain) = drain::channel();

        let watcher = k8s::watch(client, self.watch_config(), directory.clone(), drain.clone());

        let resolver = Arc::new(Resolver::new(rules, directory));
        let dispatcher = Dispatcher::new(Duration::from_millis(self.upstream_timeout_ms));
        let server = Arc::new(Server::new(resolver, dispatcher).strict_not_found(self.strict_not_found));
        let mut serving = tokio::spawn(server.bind_and_serve(self.listen_addr, drain));

        tokio::select! {
            () = shutdown_signal() => {}
            res = &mut serving => {
                // The server only returns before shutdown if it failed to bind
                signal.drain().await;
                return res.context("server task panicked")?.map_err(Into::into);
            }
        }

        info!("shutting down");
        let grace = Duration::from_secs(self.shutdown_grace_secs);
        if time::timeout(grace, signal.drain()).await.is_err() {
            tracing::warn!("in-flight requests did not finish within {grace:?}");
        }

        serving.abort();
        watcher.abort();
        Ok(())
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            },
            Err(error) => {
                tracing::warn!(%error, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("pod-ingress").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn explicit_flags() {
        let args = parse(&[
            "--rules",
            "shop.example.com:default/shop",
            "--listen-addr",
            "127.0.0.1:8080",
            "--namespace",
            "shop",
            "--selector",
            "app=web",
            "--resync-interval-secs",
            "30",
            "--max-retries",
            "2",
            "--upstream-timeout-ms",
            "500",
            "--strict-not-found",
        ]);

        assert_eq!(args.rules, "shop.example.com:default/shop");
        assert_eq!(args.listen_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(args.upstream_timeout_ms, 500);
        assert!(args.strict_not_found);

        let config = args.watch_config();
        assert_eq!(config.namespace.as_deref(), Some("shop"));
        assert_eq!(config.label_selector.as_deref(), Some("app=web"));
        assert_eq!(config.resync_interval, Duration::from_secs(30));
        assert_eq!(config.max_retries, 2);
    }

    #[test]
    fn zero_resync_interval_is_rejected() {
        let res = Args::try_parse_from(["pod-ingress", "--resync-interval-secs", "0"]);

        assert!(res.is_err());
    }

    #[test]
    fn invalid_listen_addr_is_rejected() {
        let res = Args::try_parse_from(["pod-ingress", "--listen-addr", "nowhere"]);

        assert!(res.is_err());
    }
}
