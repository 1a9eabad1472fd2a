//! Kubernetes pod watch feeding the endpoint directory.
//!
//! # How It Works
//!
//! 1. Lists and watches `Pod` resources (optionally in one namespace or
//!    matching a label selector)
//! 2. Converts each pod into a [`UnitSnapshot`]
//! 3. Delivers lifecycle events to a [`LifecycleHandler`], redelivering events
//!    the handler rejects a bounded number of times
//! 4. Periodically replays every cached pod to the handler (resync)
//!
//! A full relist (on startup and after the watch reconnects) ends with a
//! [`LifecycleEvent::Relisted`] event carrying every pod seen, so pods deleted
//! while the watch was down are dropped too.

use std::collections::BTreeSet;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Container as PodContainer, Pod};
use kube::runtime::WatchStreamExt;
use kube::runtime::reflector;
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::{Api, Client};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::Instrument;

use crate::directory::{Container, Identity, LifecycleEvent, LifecycleHandler, Phase, UnitSnapshot};
use crate::error::{Error, Result};

/// Delay before the first redelivery of a rejected event. Later attempts
/// wait proportionally longer.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Shortest resync period; `tokio::time::interval` rejects a zero period.
const MIN_RESYNC_INTERVAL: Duration = Duration::from_millis(1);

/// Configuration for the pod watch.
#[derive(Clone, Debug)]
pub struct WatchConfig {
    /// Namespace to watch. If `None`, pods in all namespaces are watched.
    pub namespace: Option<String>,

    /// Label selector restricting the watched pods.
    pub label_selector: Option<String>,

    /// Period between full replays of the cached pods.
    pub resync_interval: Duration,

    /// How many times a rejected event is redelivered before it is dropped.
    pub max_retries: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            label_selector: None,
            resync_interval: Duration::from_secs(5),
            max_retries: 5,
        }
    }
}

impl WatchConfig {
    /// Creates a configuration watching all namespaces.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the watch to a namespace.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Restricts the watch to pods matching a label selector.
    #[must_use]
    pub fn labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    /// Sets the resync period. Periods below one millisecond are raised to
    /// one millisecond.
    #[must_use]
    pub fn resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval.max(MIN_RESYNC_INTERVAL);
        self
    }

    /// The resync period actually used by the watch, never zero even when
    /// the field was set directly.
    fn resync_period(&self) -> Duration {
        self.resync_interval.max(MIN_RESYNC_INTERVAL)
    }

    /// Sets the number of redeliveries for rejected events.
    #[must_use]
    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }
}

impl TryFrom<&Pod> for UnitSnapshot {
    type Error = Error;

    fn try_from(pod: &Pod) -> Result<Self> {
        let identity = pod_identity(pod)?;
        let status = pod.status.as_ref();

        let phase = status
            .and_then(|s| s.phase.as_deref())
            .map_or(Phase::Unknown, Phase::from);

        let address = status
            .and_then(|s| s.pod_ip.as_deref())
            .and_then(|ip| ip.parse().ok());

        let containers = pod
            .spec
            .as_ref()
            .map(|spec| spec.containers.iter().map(container).collect())
            .unwrap_or_default();

        Ok(Self {
            identity,
            phase,
            address,
            containers,
        })
    }
}

fn pod_identity(pod: &Pod) -> Result<Identity> {
    let name = pod
        .metadata
        .name
        .as_deref()
        .ok_or(Error::InvalidPod("name"))?;
    let namespace = pod
        .metadata
        .namespace
        .as_deref()
        .ok_or(Error::InvalidPod("namespace"))?;

    Ok(Identity::new(namespace, name))
}

fn container(c: &PodContainer) -> Container {
    let ports = c
        .ports
        .iter()
        .flatten()
        .filter_map(|p| u16::try_from(p.container_port).ok())
        .filter(|p| *p != 0)
        .collect();

    Container::new(c.name.clone(), ports)
}

/// Starts watching pods and delivering lifecycle events to `handler`.
///
/// This function spawns a background task that runs until `drain` is
/// signaled or the watch stream ends.
///
/// # Requirements
///
/// - The application must have RBAC permissions to list and watch `Pod`
///   resources
/// - Kubernetes client configuration (in-cluster or kubeconfig)
pub fn watch<H>(client: Client, config: WatchConfig, handler: H, drain: drain::Watch) -> JoinHandle<()>
where
    H: LifecycleHandler + 'static,
{
    let span = tracing::info_span!("watch", namespace = config.namespace.as_deref().unwrap_or("*"));

    tokio::spawn(watch_loop(client, config, handler, drain).instrument(span))
}

/// Background task that watches pods and delivers lifecycle events.
///
/// Watch errors are retried with backoff by the watcher itself; this only
/// returns on shutdown or when the stream ends.
async fn watch_loop<H>(client: Client, config: WatchConfig, handler: H, drain: drain::Watch)
where
    H: LifecycleHandler,
{
    let pods: Api<Pod> = match &config.namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    };

    let mut watcher_config = WatcherConfig::default();
    if let Some(selector) = &config.label_selector {
        watcher_config = watcher_config.labels(selector);
    }

    let (reader, writer) = reflector::store::<Pod>();
    let stream = watcher::watcher(pods, watcher_config)
        .default_backoff()
        .reflect(writer);
    tokio::pin!(stream);

    let period = config.resync_period();
    let mut resync = time::interval_at(Instant::now() + period, period);
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = drain.signaled();
    tokio::pin!(shutdown);

    let mut relist = None;

    tracing::debug!(
        "Starting Kubernetes pod watch, resync every {:?}",
        period
    );

    loop {
        tokio::select! {
            release = &mut shutdown => {
                tracing::info!("stopping pod watch");
                drop(release);
                return;
            }

            event = stream.next() => match event {
                Some(Ok(event)) => {
                    for event in process_event(&event, &mut relist) {
                        deliver(&handler, event, config.max_retries).await;
                    }
                }
                Some(Err(error)) => tracing::warn!(%error, "pod watch failed, retrying"),
                None => {
                    tracing::warn!("pod watch ended");
                    return;
                }
            },

            _ = resync.tick() => {
                let cached = reader.state();
                tracing::debug!(pods = cached.len(), "resyncing pods");
                for pod in cached {
                    if let Some(event) = observed(&pod) {
                        deliver(&handler, event, config.max_retries).await;
                    }
                }
            }
        }
    }
}

/// Converts a watcher event into lifecycle events.
///
/// `relist` collects identities between `Init` and `InitDone`.
fn process_event(
    event: &Event<Pod>,
    relist: &mut Option<BTreeSet<Identity>>,
) -> Vec<LifecycleEvent> {
    match event {
        Event::Apply(pod) => observed(pod).into_iter().collect(),

        Event::InitApply(pod) => {
            let Some(event) = observed(pod) else {
                return Vec::new();
            };

            if let (Some(seen), LifecycleEvent::Observed(unit)) = (relist.as_mut(), &event) {
                seen.insert(unit.identity.clone());
            }

            vec![event]
        }

        Event::Delete(pod) => match pod_identity(pod) {
            Ok(identity) => vec![LifecycleEvent::Deleted(identity)],
            Err(error) => {
                tracing::warn!(%error, "ignoring deleted pod");
                Vec::new()
            }
        },

        Event::Init => {
            tracing::debug!("Kubernetes pod relist started");
            *relist = Some(BTreeSet::new());
            Vec::new()
        }

        Event::InitDone => {
            let seen = relist.take().unwrap_or_default();
            tracing::debug!(pods = seen.len(), "Kubernetes pod relist done");
            vec![LifecycleEvent::Relisted(seen)]
        }
    }
}

/// Converts a pod into an observation, skipping pods that cannot be
/// identified.
fn observed(pod: &Pod) -> Option<LifecycleEvent> {
    match UnitSnapshot::try_from(pod) {
        Ok(unit) => Some(LifecycleEvent::Observed(unit)),
        Err(error) => {
            tracing::warn!(%error, "ignoring pod");
            None
        }
    }
}

/// Hands an event to `handler`, redelivering it up to `max_retries` times.
///
/// Returns whether the event was eventually accepted.
async fn deliver<H>(handler: &H, event: LifecycleEvent, max_retries: usize) -> bool
where
    H: LifecycleHandler + ?Sized,
{
    let mut attempt = 0;
    loop {
        match handler.handle(event.clone()) {
            Ok(transition) => {
                tracing::trace!(?transition, "handled lifecycle event");
                return true;
            }
            Err(error) if attempt < max_retries => {
                attempt += 1;
                tracing::debug!(%error, attempt, "lifecycle event rejected, retrying");
                time::sleep(RETRY_BACKOFF * u32::try_from(attempt).unwrap_or(u32::MAX)).await;
            }
            Err(error) => {
                tracing::error!(%error, ?event, "dropping lifecycle event after {attempt} retries");
                return false;
            }
        }
    }
}
