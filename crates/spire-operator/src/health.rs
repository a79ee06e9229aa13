//! Health aggregation for SpireServer workloads.
//!
//! Each SpireServer gets one long-lived monitor that lists the server pods on
//! a fixed interval, folds their conditions into a single [`HealthState`] and
//! writes it to the object's status. Monitors are tracked in
//! [`HealthMonitors`] so that repeated reconciliations never start a second
//! one and deletion can stop it deterministically.

use std::{fmt, sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use k8s_openapi::api::core::v1::Pod;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{Level, instrument};

use crate::{
    Error, Result,
    api::{HealthState, SpireServerStatus},
    client::ClusterClient,
};

pub const SERVER_POD_SELECTOR: &str = "app=spire-server";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Best condition a single pod has reached, least favorable first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PodHealth {
    Error,
    Scheduled,
    Initialized,
    Ready,
}

/// Identity of a monitored SpireServer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

pub fn classify(pod: &Pod) -> PodHealth {
    let conditions = pod
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_deref())
        .unwrap_or_default();
    let holds = |type_: &str| {
        conditions
            .iter()
            .any(|c| c.type_ == type_ && c.status == "True")
    };

    if holds("Ready") {
        PodHealth::Ready
    } else if holds("Initialized") {
        PodHealth::Initialized
    } else if holds("ContainersReady") || holds("PodScheduled") {
        PodHealth::Scheduled
    } else {
        PodHealth::Error
    }
}

/// Folds per-pod health into the object's state.
///
/// Any errored pod wins; otherwise the state is the best level every one of
/// `replicas` pods has reached.
pub fn aggregate(replicas: i32, pods: &[PodHealth]) -> HealthState {
    if pods.contains(&PodHealth::Error) {
        return HealthState::Error;
    }

    let replicas = usize::try_from(replicas).unwrap_or_default();
    let reached = |level: PodHealth| pods.iter().filter(|&&pod| pod >= level).count() >= replicas;

    if reached(PodHealth::Ready) {
        HealthState::Ready
    } else if reached(PodHealth::Initialized) {
        HealthState::Live
    } else {
        HealthState::Initializing
    }
}

/// One poll tick: list, classify, aggregate, write.
///
/// The status is written every time, changed or not.
#[instrument(level = Level::DEBUG, skip(client), fields(server = %key))]
pub async fn observe_once(
    client: &dyn ClusterClient,
    key: &ObjectKey,
    replicas: i32,
) -> Result<HealthState> {
    let pods = client
        .list_pods(&key.namespace, SERVER_POD_SELECTOR)
        .await
        .map_err(|e| Error::Observation(Box::new(e)))?;
    let classes: Vec<_> = pods.iter().map(classify).collect();
    let health = aggregate(replicas, &classes);

    client
        .patch_server_status(
            &key.namespace,
            &key.name,
            &SpireServerStatus {
                health: Some(health),
            },
        )
        .await
        .map_err(|e| Error::Observation(Box::new(e)))?;

    tracing::debug!(%health, pods = pods.len(), "Observed health");
    Ok(health)
}

/// Polls until `cancel` fires or a tick fails.
///
/// Cancellation is only noticed between ticks, and no status is written
/// after it.
pub async fn watch_health(
    client: Arc<dyn ClusterClient>,
    key: ObjectKey,
    replicas: watch::Receiver<i32>,
    mut cancel: watch::Receiver<bool>,
    period: Duration,
) -> Result<()> {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.changed() => return Ok(()),
            _ = ticker.tick() => {}
        }
        if *cancel.borrow() {
            return Ok(());
        }

        let replicas = *replicas.borrow();
        observe_once(client.as_ref(), &key, replicas).await?;
    }
}

struct Monitor {
    cancel: watch::Sender<bool>,
    replicas: watch::Sender<i32>,
    task: JoinHandle<Result<()>>,
}

/// Registry of running monitors, at most one per SpireServer.
#[derive(Clone)]
pub struct HealthMonitors {
    monitors: Arc<DashMap<ObjectKey, Monitor>>,
    period: Duration,
}

impl Default for HealthMonitors {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl HealthMonitors {
    pub fn new(period: Duration) -> Self {
        Self {
            monitors: Arc::new(DashMap::new()),
            period,
        }
    }

    /// Starts a monitor for `key` unless a live one exists, in which case
    /// only its replica count is refreshed. Returns whether a new monitor
    /// was spawned.
    pub fn ensure_started(
        &self,
        client: Arc<dyn ClusterClient>,
        key: ObjectKey,
        replicas: i32,
    ) -> bool {
        match self.monitors.entry(key.clone()) {
            Entry::Occupied(entry) if !entry.get().task.is_finished() => {
                entry.get().replicas.send_replace(replicas);
                false
            }
            Entry::Occupied(mut entry) => {
                tracing::info!(server = %key, "Restarting ended health monitor");
                entry.insert(self.spawn(client, key, replicas));
                true
            }
            Entry::Vacant(entry) => {
                tracing::info!(server = %key, "Starting health monitor");
                entry.insert(self.spawn(client, key, replicas));
                true
            }
        }
    }

    /// Cancels the monitor for `key` and waits for it to finish.
    /// Returns whether one was registered.
    pub async fn stop(&self, key: &ObjectKey) -> bool {
        let Some((_, monitor)) = self.monitors.remove(key) else {
            return false;
        };

        let _ = monitor.cancel.send(true);
        match monitor.task.await {
            Ok(Ok(())) => tracing::info!(server = %key, "Stopped health monitor"),
            Ok(Err(e)) => tracing::warn!(server = %key, "Health monitor had failed: {e}"),
            Err(e) => tracing::error!(server = %key, "Health monitor panicked: {e}"),
        }
        true
    }

    pub fn is_running(&self, key: &ObjectKey) -> bool {
        self.monitors
            .get(key)
            .is_some_and(|monitor| !monitor.task.is_finished())
    }

    fn spawn(&self, client: Arc<dyn ClusterClient>, key: ObjectKey, replicas: i32) -> Monitor {
        let (cancel, cancel_rx) = watch::channel(false);
        let (replicas, replicas_rx) = watch::channel(replicas);
        let period = self.period;

        let task = tokio::spawn(async move {
            let result = watch_health(client, key.clone(), replicas_rx, cancel_rx, period).await;
            if let Err(e) = &result {
                tracing::error!(server = %key, "Health monitor stopped: {e}");
            }
            result
        });

        Monitor {
            cancel,
            replicas,
            task,
        }
    }
}
