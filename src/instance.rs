// Instance - one upstream subprocess for one model id
//
// Owns the process handle, the assigned port and the lifecycle state
// machine:
//
//   stopped -> starting -> ready -> stopping -> stopped
//                  \-> failed (launch error or health timeout)
//
// Transitions are serialized by a per-instance async mutex; waiters observe
// a watch channel and never hold the mutex while waiting. A waiter that
// disappears (client disconnect) abandons only its wait - the launch keeps
// running in spawned tasks for the benefit of later requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};

use crate::config::ModelConfig;
use crate::error::RouteError;
use crate::events::{EventBus, LogSource, ProxyEvent};
use crate::logmonitor::LogMonitor;
use crate::ports::PortAllocator;

/// Health endpoint polling cadence while starting
const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Grace period between SIGTERM and SIGKILL
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Launch attempts per request before the failure surfaces to the client
const MAX_LAUNCHES_PER_REQUEST: u32 = 2;

/// How much captured output accompanies a start failure
const FAILURE_EXCERPT_BYTES: usize = 1024;

// ─────────────────────────────────────────────────────────────────────────────
// States and reasons
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Stopped,
    Starting,
    Ready,
    Stopping,
    Failed,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Stopped => "stopped",
            InstanceState::Starting => "starting",
            InstanceState::Ready => "ready",
            InstanceState::Stopping => "stopping",
            InstanceState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why an instance is being stopped; logged and useful in tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Idle,
    Evicted,
    Reload,
    Shutdown,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Idle => "idle",
            StopReason::Evicted => "evicted",
            StopReason::Reload => "reload",
            StopReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Why `try_acquire` refused a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// State moved off Ready between ensure_ready and acquire; retry
    NotReady,
    /// concurrency_limit reached
    Saturated,
}

/// Row in the /running listing
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub id: String,
    pub state: InstanceState,
    pub started_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub in_flight: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Instance
// ─────────────────────────────────────────────────────────────────────────────

pub struct Instance {
    /// Self-handle for spawning lifecycle tasks (prober, TTL timer)
    weak: Weak<Instance>,
    config: ModelConfig,
    /// From the owning group; suppresses TTL arming entirely
    persistent: bool,
    bus: EventBus,
    ports: Arc<PortAllocator>,
    monitor: Arc<LogMonitor>,

    /// Serializes every state transition; never held across a readiness wait
    op_lock: Mutex<()>,
    state_tx: watch::Sender<InstanceState>,

    child: StdMutex<Option<Child>>,
    port: StdMutex<Option<u16>>,
    proxy_url: StdMutex<Option<String>>,
    last_error: StdMutex<Option<RouteErrorKind>>,

    in_flight: AtomicUsize,
    started_at: StdMutex<Option<DateTime<Utc>>>,
    ready_at: StdMutex<Option<DateTime<Utc>>>,
    /// Bumped on every acquire/rearm; a TTL task only fires if its
    /// generation is still current
    ttl_gen: AtomicU64,
}

/// What the prober recorded for a failed launch, replayed to later requests
#[derive(Debug, Clone)]
enum RouteErrorKind {
    StartFailure(String),
    HealthTimeout(u64),
}

impl Instance {
    pub fn new(
        config: ModelConfig,
        persistent: bool,
        bus: EventBus,
        ports: Arc<PortAllocator>,
    ) -> Arc<Self> {
        let monitor = Arc::new(LogMonitor::new(
            LogSource::Upstream(config.id.clone()),
            &config.ready_marker,
            bus.clone(),
        ));
        let (state_tx, _) = watch::channel(InstanceState::Stopped);
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            config,
            persistent,
            bus,
            ports,
            monitor,
            op_lock: Mutex::new(()),
            state_tx,
            child: StdMutex::new(None),
            port: StdMutex::new(None),
            proxy_url: StdMutex::new(None),
            last_error: StdMutex::new(None),
            in_flight: AtomicUsize::new(0),
            started_at: StdMutex::new(None),
            ready_at: StdMutex::new(None),
            ttl_gen: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Owned handle to self for spawned tasks. Valid for the whole life of
    /// the instance; only Drop itself could observe a dead Weak.
    fn strong(&self) -> Arc<Self> {
        self.weak.upgrade().expect("instance alive")
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn state(&self) -> InstanceState {
        *self.state_tx.borrow()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Base URL of the running upstream; Some only in starting/ready/stopping
    pub fn proxy_url(&self) -> Option<String> {
        self.proxy_url.lock().unwrap().clone()
    }

    pub fn status(&self) -> InstanceStatus {
        InstanceStatus {
            id: self.config.id.clone(),
            state: self.state(),
            started_at: *self.started_at.lock().unwrap(),
            ready_at: *self.ready_at.lock().unwrap(),
            in_flight: self.in_flight(),
        }
    }

    /// Subscribe to state transitions (tests, group eviction)
    pub fn watch_state(&self) -> watch::Receiver<InstanceState> {
        self.state_tx.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Readiness
    // ─────────────────────────────────────────────────────────────────────

    /// Drive this instance to Ready, launching it if necessary.
    ///
    /// Idempotent on a Ready instance. A Failed instance is cleared and
    /// relaunched; at most [`MAX_LAUNCHES_PER_REQUEST`] launches happen on
    /// behalf of one call before the stored failure surfaces.
    pub async fn ensure_ready(&self) -> Result<(), RouteError> {
        let mut launches = 0u32;
        loop {
            {
                let _op = self.op_lock.lock().await;
                match self.state() {
                    InstanceState::Ready => {
                        // Rearm: any pending idle timer is stale now
                        self.bump_ttl_gen();
                        return Ok(());
                    }
                    InstanceState::Stopped => {
                        if launches >= MAX_LAUNCHES_PER_REQUEST {
                            return Err(self.stored_failure());
                        }
                        launches += 1;
                        self.launch()?;
                    }
                    InstanceState::Failed => {
                        if launches >= MAX_LAUNCHES_PER_REQUEST {
                            return Err(self.stored_failure());
                        }
                        self.set_state(InstanceState::Stopped);
                        launches += 1;
                        self.launch()?;
                    }
                    InstanceState::Starting | InstanceState::Stopping => {}
                }
            }

            // Wait for the launch (ours or a peer's) to settle. Dropping
            // this future mid-wait abandons nothing but the wait itself.
            let mut rx = self.state_tx.subscribe();
            let settled = rx
                .wait_for(|s| !matches!(s, InstanceState::Starting | InstanceState::Stopping))
                .await;
            if settled.is_err() {
                return Err(RouteError::Cancelled);
            }
        }
    }

    /// Spawn the subprocess and the tasks that watch it. Caller holds the
    /// op lock and has verified state is Stopped.
    fn launch(&self) -> Result<(), RouteError> {
        let port = self.ports.allocate()?;
        let cmdline = self.config.command_for_port(port);
        let proxy_url = self.config.proxy_url_for_port(port);

        self.monitor.reset_marker();

        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(&cmdline)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        for pair in &self.config.env {
            if let Some((key, value)) = pair.split_once('=') {
                command.env(key, value);
            }
        }

        tracing::info!("starting `{}` on port {}: {}", self.config.id, port, cmdline);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.ports.release(port);
                let err = RouteErrorKind::StartFailure(format!("spawn failed: {}", e));
                *self.last_error.lock().unwrap() = Some(err);
                self.set_state(InstanceState::Failed);
                return Err(self.stored_failure());
            }
        };

        if let Some(stdout) = child.stdout.take() {
            let monitor = Arc::clone(&self.monitor);
            tokio::spawn(async move { monitor.pump(stdout).await });
        }
        if let Some(stderr) = child.stderr.take() {
            let monitor = Arc::clone(&self.monitor);
            tokio::spawn(async move { monitor.pump(stderr).await });
        }

        *self.child.lock().unwrap() = Some(child);
        *self.port.lock().unwrap() = Some(port);
        *self.proxy_url.lock().unwrap() = Some(proxy_url);
        *self.started_at.lock().unwrap() = Some(Utc::now());
        *self.ready_at.lock().unwrap() = None;
        *self.last_error.lock().unwrap() = None;
        self.set_state(InstanceState::Starting);

        let this = self.strong();
        tokio::spawn(async move { this.probe_until_ready().await });
        Ok(())
    }

    /// Poll the health endpoint every 250 ms until it answers 200, the log
    /// marker fires, the process exits, or the deadline passes. Runs as its
    /// own task so readiness survives cancelled requests.
    async fn probe_until_ready(self: Arc<Self>) {
        let url = self
            .proxy_url()
            .map(|base| format!("{}{}", base, self.config.check_endpoint));
        let client = reqwest::Client::builder()
            .timeout(PROBE_INTERVAL)
            .build()
            .ok();
        let marker = self.monitor.marker_seen();
        let timeout = Duration::from_secs(self.config.health_check_timeout.max(1));

        let outcome = tokio::time::timeout(timeout, async {
            loop {
                if self.state() != InstanceState::Starting {
                    return Ok(()); // stop() took over; nothing to decide
                }
                if let Some(excerpt) = self.reap_if_exited() {
                    return Err(RouteErrorKind::StartFailure(excerpt));
                }
                if *marker.borrow() {
                    return Ok(());
                }
                if let (Some(url), Some(client)) = (url.as_deref(), client.as_ref()) {
                    if let Ok(resp) = client.get(url).send().await {
                        if resp.status().is_success() {
                            return Ok(());
                        }
                    }
                }
                tokio::time::sleep(PROBE_INTERVAL).await;
            }
        })
        .await;

        let _op = self.op_lock.lock().await;
        if self.state() != InstanceState::Starting {
            return; // a stop raced us and owns the process now
        }
        match outcome {
            Ok(Ok(())) => {
                *self.ready_at.lock().unwrap() = Some(Utc::now());
                self.set_state(InstanceState::Ready);
                tracing::info!("`{}` is ready", self.config.id);
            }
            Ok(Err(kind)) => {
                self.halt_process().await;
                *self.last_error.lock().unwrap() = Some(kind);
                self.set_state(InstanceState::Failed);
                tracing::warn!("`{}` failed to start", self.config.id);
            }
            Err(_) => {
                self.halt_process().await;
                *self.last_error.lock().unwrap() = Some(RouteErrorKind::HealthTimeout(
                    self.config.health_check_timeout,
                ));
                self.set_state(InstanceState::Failed);
                tracing::warn!(
                    "`{}` health check timed out after {}s",
                    self.config.id,
                    self.config.health_check_timeout
                );
            }
        }
    }

    /// If the process already exited, reap it and return a log excerpt
    fn reap_if_exited(&self) -> Option<String> {
        let mut child = self.child.lock().unwrap();
        match child.as_mut()?.try_wait() {
            Ok(Some(status)) => {
                child.take();
                let tail = self.monitor.tail(FAILURE_EXCERPT_BYTES);
                Some(format!(
                    "exited with {} before becoming ready\n{}",
                    status,
                    String::from_utf8_lossy(&tail)
                ))
            }
            _ => None,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Stopping
    // ─────────────────────────────────────────────────────────────────────

    /// Gracefully stop the process. No-op unless Ready or Starting.
    /// Returns once the instance is Stopped and its port released.
    pub async fn stop(&self, reason: StopReason) {
        let _op = self.op_lock.lock().await;
        if !matches!(self.state(), InstanceState::Ready | InstanceState::Starting) {
            return;
        }
        tracing::info!("stopping `{}` ({})", self.config.id, reason);
        self.set_state(InstanceState::Stopping);
        self.halt_process().await;
        self.set_state(InstanceState::Stopped);
    }

    /// TTL expiry path: stop only if this timer generation is still current
    /// and the instance is genuinely idle.
    async fn stop_if_idle(&self, generation: u64) {
        let _op = self.op_lock.lock().await;
        if self.ttl_gen.load(Ordering::SeqCst) != generation
            || self.in_flight() > 0
            || self.state() != InstanceState::Ready
        {
            return;
        }
        tracing::info!("stopping `{}` ({})", self.config.id, StopReason::Idle);
        self.set_state(InstanceState::Stopping);
        self.halt_process().await;
        self.set_state(InstanceState::Stopped);
    }

    /// SIGTERM the process group, escalate to SIGKILL after the grace
    /// period, reap, release the port. Caller holds the op lock.
    async fn halt_process(&self) {
        let child = self.child.lock().unwrap().take();
        if let Some(mut child) = child {
            signal_group(&child, libc::SIGTERM);
            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!(
                        "`{}` ignored SIGTERM for {}s, killing",
                        self.config.id,
                        STOP_GRACE.as_secs()
                    );
                    signal_group(&child, libc::SIGKILL);
                    let _ = child.kill().await;
                }
            }
        }
        if let Some(port) = self.port.lock().unwrap().take() {
            self.ports.release(port);
        }
        *self.proxy_url.lock().unwrap() = None;
    }

    // ─────────────────────────────────────────────────────────────────────
    // In-flight accounting and TTL
    // ─────────────────────────────────────────────────────────────────────

    /// Claim an in-flight slot. Only valid in Ready; the returned guard
    /// releases the slot (and rearms the idle timer) on drop, wherever the
    /// response stream ends up being dropped.
    pub fn try_acquire(&self) -> Result<RequestGuard, AcquireError> {
        if self.state() != InstanceState::Ready {
            return Err(AcquireError::NotReady);
        }
        let limit = self.config.concurrency_limit;
        let claim = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if limit > 0 && n >= limit {
                    None
                } else {
                    Some(n + 1)
                }
            });
        if claim.is_err() {
            return Err(AcquireError::Saturated);
        }
        self.bump_ttl_gen();
        Ok(RequestGuard {
            instance: self.strong(),
        })
    }

    fn release(&self) {
        let before = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(before > 0, "release without acquire");
        if before == 1 {
            self.arm_ttl();
        }
    }

    fn bump_ttl_gen(&self) -> u64 {
        self.ttl_gen.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Schedule an idle unload after `ttl` seconds of zero in-flight.
    /// Persistent-group members and ttl=0 models never unload.
    fn arm_ttl(&self) {
        if self.config.ttl == 0 || self.persistent {
            return;
        }
        let generation = self.bump_ttl_gen();
        let ttl = Duration::from_secs(self.config.ttl);
        let this = self.strong();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            this.stop_if_idle(generation).await;
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────

    /// Record a transition and publish it. Caller holds the op lock.
    fn set_state(&self, to: InstanceState) {
        let from = self.state();
        if from == to {
            return;
        }
        self.state_tx.send_replace(to);
        self.bus.emit(ProxyEvent::ModelStateChanged {
            id: self.config.id.clone(),
            from,
            to,
            timestamp: Utc::now(),
        });
    }

    /// The error a Failed instance reports to requests that hit it
    fn stored_failure(&self) -> RouteError {
        match self.last_error.lock().unwrap().clone() {
            Some(RouteErrorKind::StartFailure(excerpt)) => RouteError::StartFailure {
                id: self.config.id.clone(),
                log_excerpt: excerpt,
            },
            Some(RouteErrorKind::HealthTimeout(secs)) => RouteError::HealthTimeout {
                id: self.config.id.clone(),
                timeout_secs: secs,
            },
            None => RouteError::StartFailure {
                id: self.config.id.clone(),
                log_excerpt: String::new(),
            },
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        // Snapshot teardown safety net; normal paths reap via stop()
        if let Ok(mut slot) = self.child.lock() {
            if let Some(mut child) = slot.take() {
                signal_group(&child, libc::SIGKILL);
                let _ = child.start_kill();
            }
        }
    }
}

/// Signal the whole process group so children of `sh -c` die with it
fn signal_group(child: &Child, signal: i32) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
    #[cfg(not(unix))]
    let _ = (child, signal);
}

/// RAII in-flight slot. Dropping it releases the slot and, at zero
/// in-flight, rearms the TTL timer.
pub struct RequestGuard {
    instance: Arc<Instance>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.instance.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    fn model(id: &str, cmd: &str, proxy: &str) -> ModelConfig {
        ModelConfig {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            cmd: cmd.to_string(),
            proxy: proxy.to_string(),
            aliases: vec![],
            env: vec![],
            ttl: 0,
            unlisted: false,
            use_model_name: None,
            health_check_timeout: 3,
            concurrency_limit: 0,
            check_endpoint: "/health".to_string(),
            ready_marker: "server listening".to_string(),
        }
    }

    fn harness() -> (EventBus, Arc<PortAllocator>) {
        (EventBus::new(), Arc::new(PortAllocator::new(22000)))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn marker_in_logs_drives_instance_to_ready() {
        let (bus, ports) = harness();
        let mut events = bus.subscribe();
        // No listener behind the proxy URL; readiness comes from the marker
        let cfg = model(
            "m1",
            "echo 'server listening'; sleep 30",
            "http://127.0.0.1:1",
        );
        let instance = Instance::new(cfg, false, bus, ports);

        instance.ensure_ready().await.expect("should become ready");
        assert_eq!(instance.state(), InstanceState::Ready);

        // stopped -> starting -> ready, in order, on the bus
        let mut transitions = vec![];
        while transitions.len() < 2 {
            if let ProxyEvent::ModelStateChanged { to, .. } = events.recv().await.unwrap() {
                transitions.push(to);
            }
        }
        assert_eq!(
            transitions,
            vec![InstanceState::Starting, InstanceState::Ready]
        );

        instance.stop(StopReason::Shutdown).await;
        assert_eq!(instance.state(), InstanceState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ensure_ready_is_idempotent_when_ready() {
        let (bus, ports) = harness();
        let cfg = model(
            "m1",
            "echo 'server listening'; sleep 30",
            "http://127.0.0.1:1",
        );
        let instance = Instance::new(cfg, false, bus, ports);

        instance.ensure_ready().await.unwrap();
        let started = *instance.started_at.lock().unwrap();
        instance.ensure_ready().await.unwrap();
        // Same launch, not a restart
        assert_eq!(*instance.started_at.lock().unwrap(), started);

        instance.stop(StopReason::Shutdown).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exiting_process_fails_after_retry() {
        let (bus, ports) = harness();
        let cfg = model("m1", "echo boom; exit 7", "http://127.0.0.1:1");
        let instance = Instance::new(cfg, false, bus, ports.clone());

        let err = instance.ensure_ready().await.expect_err("must fail");
        match err {
            RouteError::StartFailure { id, log_excerpt } => {
                assert_eq!(id, "m1");
                assert!(log_excerpt.contains("boom"), "excerpt: {}", log_excerpt);
            }
            other => panic!("expected StartFailure, got {:?}", other),
        }
        assert_eq!(instance.state(), InstanceState::Failed);
        // Port released on failure
        assert_eq!(ports.held(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn health_timeout_marks_failed() {
        let (bus, ports) = harness();
        let mut cfg = model("m1", "sleep 30", "http://127.0.0.1:1");
        cfg.health_check_timeout = 1;
        let instance = Instance::new(cfg, false, bus, ports);

        let err = instance.ensure_ready().await.expect_err("must time out");
        assert!(matches!(err, RouteError::HealthTimeout { .. }));
        assert_eq!(instance.state(), InstanceState::Failed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ttl_unloads_idle_instance_and_restart_works() {
        let (bus, ports) = harness();
        let mut cfg = model(
            "m1",
            "echo 'server listening'; sleep 30",
            "http://127.0.0.1:1",
        );
        cfg.ttl = 1;
        let instance = Instance::new(cfg, false, bus, ports);

        instance.ensure_ready().await.unwrap();
        let guard = instance.try_acquire().unwrap();
        assert_eq!(instance.in_flight(), 1);

        // TTL must not fire while the request is in flight
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(instance.state(), InstanceState::Ready);

        drop(guard);
        let mut rx = instance.watch_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| *s == InstanceState::Stopped),
        )
        .await
        .expect("ttl should stop the instance")
        .unwrap();

        // A later request restarts it
        instance.ensure_ready().await.unwrap();
        assert_eq!(instance.state(), InstanceState::Ready);
        instance.stop(StopReason::Shutdown).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrency_limit_rejects_excess_acquires() {
        let (bus, ports) = harness();
        let mut cfg = model(
            "m1",
            "echo 'server listening'; sleep 30",
            "http://127.0.0.1:1",
        );
        cfg.concurrency_limit = 1;
        let instance = Instance::new(cfg, false, bus, ports);

        instance.ensure_ready().await.unwrap();
        let _guard = instance.try_acquire().unwrap();
        assert!(matches!(
            instance.try_acquire(),
            Err(AcquireError::Saturated)
        ));

        instance.stop(StopReason::Shutdown).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_on_stopped_is_a_noop() {
        let (bus, ports) = harness();
        let cfg = model("m1", "sleep 30", "http://127.0.0.1:1");
        let instance = Instance::new(cfg, false, bus.clone(), ports);

        let mut events = bus.subscribe();
        instance.stop(StopReason::Idle).await;
        assert_eq!(instance.state(), InstanceState::Stopped);
        assert!(events.try_recv().is_err(), "no-op stop must not emit");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn abandoned_waiter_does_not_abort_launch() {
        let (bus, ports) = harness();
        // Slow to become ready: marker appears after 1s
        let cfg = model(
            "m1",
            "sleep 1; echo 'server listening'; sleep 30",
            "http://127.0.0.1:1",
        );
        let instance = Instance::new(cfg, false, bus, ports);

        // First waiter gives up after 200ms (simulated client disconnect)
        let early = tokio::time::timeout(Duration::from_millis(200), instance.ensure_ready()).await;
        assert!(early.is_err(), "first waiter should have timed out");
        assert_eq!(instance.state(), InstanceState::Starting);

        // Second waiter inherits the same launch
        instance.ensure_ready().await.expect("launch should finish");
        assert_eq!(instance.state(), InstanceState::Ready);
        instance.stop(StopReason::Shutdown).await;
    }
}
