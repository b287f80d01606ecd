// Proxy manager - owns the current snapshot and routes requests into it
//
// A snapshot is the immutable runtime form of one parsed config: instances
// and groups in parallel vectors, cross-referenced by index maps. Requests
// resolve against whichever snapshot Arc they grabbed; reload swaps the
// pointer atomically, so no request ever sees a mix of old and new models.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::{Config, Settings};
use crate::error::RouteError;
use crate::events::{EventBus, ProxyEvent, ReloadPhase, TokenMetric};
use crate::group::Group;
use crate::instance::{AcquireError, Instance, InstanceState, InstanceStatus, RequestGuard, StopReason};
use crate::ports::PortAllocator;

/// Metric events retained for /api/metrics
const METRICS_RING_CAPACITY: usize = 1000;

/// Delay before the reload end marker, giving subscribers time to resettle
const RELOAD_END_DELAY: Duration = Duration::from_secs(3);

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Immutable runtime form of one config. Owns its instances, groups and
/// port allocator; destroyed only once every request holding it is done.
pub struct Snapshot {
    pub settings: Settings,
    pub instances: Vec<Arc<Instance>>,
    pub groups: Vec<Arc<Group>>,
    /// id and every alias -> index into `instances`
    by_name: HashMap<String, usize>,
    /// id -> index into `groups`
    group_index: HashMap<String, usize>,
    pub created: DateTime<Utc>,
}

impl Snapshot {
    pub fn build(config: Config, bus: &EventBus) -> Self {
        let ports = Arc::new(PortAllocator::new(config.settings.start_port));

        let mut instances = Vec::with_capacity(config.models.len());
        let mut by_name = HashMap::new();
        for model in &config.models {
            let persistent = config
                .group_of(&model.id)
                .map(|g| g.persistent)
                .unwrap_or(false);
            let index = instances.len();
            by_name.insert(model.id.clone(), index);
            for alias in &model.aliases {
                by_name.insert(alias.clone(), index);
            }
            instances.push(Instance::new(
                model.clone(),
                persistent,
                bus.clone(),
                ports.clone(),
            ));
        }

        let mut groups = Vec::with_capacity(config.groups.len());
        let mut group_index = HashMap::new();
        for group_config in &config.groups {
            let members: Vec<Arc<Instance>> = group_config
                .members
                .iter()
                .map(|id| instances[by_name[id]].clone())
                .collect();
            for id in &group_config.members {
                group_index.insert(id.clone(), groups.len());
            }
            groups.push(Group::new(group_config.clone(), members));
        }

        Self {
            settings: config.settings,
            instances,
            groups,
            by_name,
            group_index,
            created: Utc::now(),
        }
    }

    /// Resolve a request name (id or alias) to its instance and group
    pub fn resolve(&self, name: &str) -> Option<(Arc<Instance>, Arc<Group>)> {
        let instance = self.instances[*self.by_name.get(name)?].clone();
        let group = self.groups[*self.group_index.get(instance.id())?].clone();
        Some((instance, group))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

/// A dispatched request: the instance to forward to, and the RAII slot that
/// keeps it accounted (and its TTL quiet) until the response stream drops.
pub struct Ticket {
    pub instance: Arc<Instance>,
    pub guard: RequestGuard,
}

pub struct Manager {
    bus: EventBus,
    current: RwLock<Arc<Snapshot>>,
    /// Serializes reload with itself
    reload_lock: Mutex<()>,
    metrics: StdMutex<VecDeque<TokenMetric>>,
}

impl Manager {
    pub fn new(config: Config, bus: EventBus) -> Arc<Self> {
        let snapshot = Arc::new(Snapshot::build(config, &bus));
        let manager = Arc::new(Self {
            bus,
            current: RwLock::new(snapshot),
            reload_lock: Mutex::new(()),
            metrics: StdMutex::new(VecDeque::with_capacity(METRICS_RING_CAPACITY)),
        });
        manager.clone().spawn_metrics_task();
        manager
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The snapshot in force right now
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().unwrap().clone()
    }

    /// Route a request to a ready instance: resolve, group admission,
    /// readiness, in-flight slot. The retry covers the narrow race where an
    /// idle unload wins between readiness and acquisition.
    pub async fn dispatch(&self, name: &str) -> Result<Ticket, RouteError> {
        let snapshot = self.snapshot();
        let (instance, group) = snapshot
            .resolve(name)
            .ok_or_else(|| RouteError::ModelNotFound(name.to_string()))?;

        for _ in 0..2 {
            group.admit(&instance).await?;
            match instance.try_acquire() {
                Ok(guard) => return Ok(Ticket { instance, guard }),
                Err(AcquireError::Saturated) => {
                    return Err(RouteError::ConcurrencyLimit(instance.id().to_string()))
                }
                Err(AcquireError::NotReady) => continue,
            }
        }
        Err(RouteError::GroupDenied(instance.id().to_string()))
    }

    /// Stop every non-stopped instance in parallel; returns once all are
    /// Stopped.
    pub async fn unload_all(&self) {
        let snapshot = self.snapshot();
        futures::future::join_all(
            snapshot
                .instances
                .iter()
                .map(|instance| instance.stop(StopReason::Shutdown)),
        )
        .await;
    }

    /// Status rows for every instance of the current snapshot
    pub fn running(&self) -> Vec<InstanceStatus> {
        self.snapshot()
            .instances
            .iter()
            .map(|i| i.status())
            .collect()
    }

    /// Counts for /health
    pub fn model_counts(&self) -> (usize, usize) {
        let snapshot = self.snapshot();
        let total = snapshot.instances.len();
        let loaded = snapshot
            .instances
            .iter()
            .filter(|i| i.state() == InstanceState::Ready)
            .count();
        (total, loaded)
    }

    /// Replace the snapshot with one built from `config`, announcing both
    /// reload phases around the swap.
    pub async fn reload(&self, config: Config) {
        self.announce_reload();
        self.apply_reload(config).await;
        self.finish_reload();
    }

    /// Emit the start phase of a reload attempt. The file watcher calls
    /// this for every detected change, before the new config has parsed.
    pub fn announce_reload(&self) {
        self.bus.emit(ProxyEvent::ConfigFileChanged {
            phase: ReloadPhase::Start,
        });
    }

    /// Emit the end phase once a reload attempt has settled, successful or
    /// not, after a short delay so subscribers can resettle.
    pub fn finish_reload(&self) {
        let bus = self.bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RELOAD_END_DELAY).await;
            bus.emit(ProxyEvent::ConfigFileChanged {
                phase: ReloadPhase::End,
            });
        });
    }

    /// Drain the old snapshot and swap in one built from `config`. The
    /// pointer swap itself is atomic; reloads are serialized with each
    /// other.
    pub async fn apply_reload(&self, config: Config) {
        let _serialized = self.reload_lock.lock().await;
        tracing::info!("config reload: draining current instances");

        let old = self.snapshot();
        futures::future::join_all(
            old.instances
                .iter()
                .map(|instance| instance.stop(StopReason::Reload)),
        )
        .await;

        let fresh = Arc::new(Snapshot::build(config, &self.bus));
        *self.current.write().unwrap() = fresh;
        tracing::info!("config reload: new snapshot in force");
    }

    /// Snapshot of the metric ring, oldest first
    pub fn metrics(&self) -> Vec<TokenMetric> {
        self.metrics.lock().unwrap().iter().cloned().collect()
    }

    /// Aggregate Metric events off the bus into the bounded ring
    fn spawn_metrics_task(self: Arc<Self>) {
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ProxyEvent::Metric(metric)) => {
                        let mut ring = self.metrics.lock().unwrap();
                        if ring.len() >= METRICS_RING_CAPACITY {
                            ring.pop_front();
                        }
                        ring.push_back(metric);
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    fn sample_config(ttl: u64) -> Config {
        let yaml = format!(
            r#"
startPort: 24000
models:
  m1:
    cmd: "echo 'server listening'; sleep 30"
    proxy: "http://127.0.0.1:1"
    aliases: ["gpt-3.5-turbo"]
    ttl: {}
  m2:
    cmd: "echo 'server listening'; sleep 30"
    proxy: "http://127.0.0.1:1"
    unlisted: true
"#,
            ttl
        );
        config::parse(&yaml).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dispatch_resolves_aliases() {
        let bus = EventBus::new();
        let manager = Manager::new(sample_config(0), bus);

        let ticket = manager.dispatch("gpt-3.5-turbo").await.unwrap();
        assert_eq!(ticket.instance.id(), "m1");
        assert_eq!(ticket.instance.in_flight(), 1);
        drop(ticket);

        manager.unload_all().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dispatch_unknown_model_is_not_found() {
        let bus = EventBus::new();
        let manager = Manager::new(sample_config(0), bus);
        assert!(matches!(
            manager.dispatch("ghost").await,
            Err(RouteError::ModelNotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unload_all_reaches_quiescence() {
        let bus = EventBus::new();
        let manager = Manager::new(sample_config(0), bus);

        let t1 = manager.dispatch("m1").await.unwrap();
        let t2 = manager.dispatch("m2").await.unwrap();
        drop((t1, t2));

        manager.unload_all().await;
        for status in manager.running() {
            assert_eq!(status.state, InstanceState::Stopped);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reload_swaps_snapshot_and_emits_phases() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let manager = Manager::new(sample_config(0), bus);

        let ticket = manager.dispatch("m1").await.unwrap();
        drop(ticket);

        let replacement = config::parse(
            "startPort: 24100\nmodels:\n  only:\n    cmd: \"echo 'server listening'; sleep 30\"\n    proxy: \"http://127.0.0.1:1\"\n",
        )
        .unwrap();
        manager.reload(replacement).await;

        // Old ids are gone, new id resolves
        assert!(matches!(
            manager.dispatch("m1").await,
            Err(RouteError::ModelNotFound(_))
        ));
        assert!(manager.snapshot().resolve("only").is_some());

        // start phase was emitted before the swap finished
        let mut saw_start = false;
        while let Ok(event) = events.try_recv() {
            if matches!(
                event,
                ProxyEvent::ConfigFileChanged {
                    phase: ReloadPhase::Start
                }
            ) {
                saw_start = true;
            }
        }
        assert!(saw_start);

        manager.unload_all().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn persistent_group_suppresses_ttl() {
        let yaml = r#"
startPort: 24200
models:
  keep:
    cmd: "echo 'server listening'; sleep 30"
    proxy: "http://127.0.0.1:1"
    ttl: 1
groups:
  pinned:
    persistent: true
    members: ["keep"]
"#;
        let bus = EventBus::new();
        let manager = Manager::new(config::parse(yaml).unwrap(), bus);

        let ticket = manager.dispatch("keep").await.unwrap();
        drop(ticket);

        // Without the persistent flag the 1s TTL would have fired by now
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(manager.running()[0].state, InstanceState::Ready);

        manager.unload_all().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn metric_events_land_in_the_ring() {
        let bus = EventBus::new();
        let manager = Manager::new(sample_config(0), bus.clone());

        bus.emit(ProxyEvent::Metric(TokenMetric {
            id: "m1".to_string(),
            prompt_tokens: 10,
            completion_tokens: 20,
            tokens_per_second: 15.0,
            duration_ms: 1500,
            timestamp: Utc::now(),
        }));

        // The aggregation task runs asynchronously
        tokio::time::sleep(Duration::from_millis(100)).await;
        let metrics = manager.metrics();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].completion_tokens, 20);
    }
}
