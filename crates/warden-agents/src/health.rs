use crate::registry::{AgentHandle, AgentRegistry};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use warden_core::{ExecutionContext, Finding, WardenError, WardenResult};

/// Tuning for the circuit breaker and reliability score.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Seconds an open breaker waits before a trial call.
    pub cooldown_secs: u64,
    /// Per-call execution timeout in seconds.
    pub call_timeout_secs: u64,
    /// Average response at or under this scores 100.
    pub fast_response_ms: u64,
    /// Average response at or over this scores 0.
    pub slow_response_ms: u64,
    /// Response times kept for the average.
    pub response_window: usize,
    /// Recovery rounds run when the breaker opens.
    pub recovery_attempts: u32,
    /// Seconds between background sweep probes.
    pub sweep_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 300,
            call_timeout_secs: 60,
            fast_response_ms: 2_000,
            slow_response_ms: 30_000,
            response_window: 20,
            recovery_attempts: 3,
            sweep_interval_secs: 60,
        }
    }
}

impl HealthConfig {
    fn cooldown(&self) -> chrono::Duration {
        // Capped at ten years so `now + cooldown` cannot overflow.
        chrono::Duration::seconds(self.cooldown_secs.min(315_360_000) as i64)
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Background sweep period; never shorter than one second.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls pass through.
    #[default]
    Closed,
    /// Calls fail fast until the cooldown elapses.
    Open,
    /// One trial call decides between closing and reopening.
    HalfOpen,
}

/// Result of a liveness probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Probed agent.
    pub agent: String,
    /// Whether the probe succeeded.
    pub ok: bool,
    /// When the probe finished.
    pub at: DateTime<Utc>,
    /// Probe error, if any.
    pub error: Option<String>,
}

/// Per-agent health counters and breaker state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealthMetrics {
    /// Agent name.
    pub agent: String,
    /// Calls that reached the agent.
    pub total_calls: u64,
    /// Successful calls.
    pub successes: u64,
    /// Failed calls, timeouts included.
    pub failures: u64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Current breaker state.
    pub state: BreakerState,
    /// End of the current cooldown.
    pub open_until: Option<DateTime<Utc>>,
    /// Most recent response times, oldest first.
    pub response_times_ms: VecDeque<u64>,
    /// Score in 0..=100, see [`reliability_score`].
    pub reliability: f64,
    /// Recovery rounds used since the breaker last opened.
    pub recovery_attempts: u32,
    /// Set when recovery gave up; only [`HealthMonitor::reset`] clears it.
    pub manual_reset_required: bool,
    /// Message of the last failure.
    pub last_error: Option<String>,
    /// Time of the last success.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Time of the last failure.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Most recent recovery or sweep probe.
    pub last_probe: Option<ProbeResult>,
    #[serde(skip)]
    half_open_trial: bool,
}

impl AgentHealthMetrics {
    fn new(agent: &str) -> Self {
        Self {
            agent: agent.to_string(),
            total_calls: 0,
            successes: 0,
            failures: 0,
            consecutive_failures: 0,
            state: BreakerState::Closed,
            open_until: None,
            response_times_ms: VecDeque::new(),
            reliability: 100.0,
            recovery_attempts: 0,
            manual_reset_required: false,
            last_error: None,
            last_success_at: None,
            last_failure_at: None,
            last_probe: None,
            half_open_trial: false,
        }
    }

    /// Percentage of successful calls; 100 with no calls.
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            100.0
        } else {
            self.successes as f64 / self.total_calls as f64 * 100.0
        }
    }

    /// Mean of the response window, `None` before the first call.
    pub fn average_response_ms(&self) -> Option<f64> {
        if self.response_times_ms.is_empty() {
            None
        } else {
            let sum: u64 = self.response_times_ms.iter().sum();
            Some(sum as f64 / self.response_times_ms.len() as f64)
        }
    }

    fn record_response(&mut self, elapsed: Duration, window: usize) {
        self.response_times_ms
            .push_back(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        while self.response_times_ms.len() > window.max(1) {
            self.response_times_ms.pop_front();
        }
    }

    fn refresh_reliability(&mut self, config: &HealthConfig) {
        self.reliability = reliability_score(
            self.success_rate(),
            self.consecutive_failures,
            self.average_response_ms(),
            config,
        );
    }

    fn open(&mut self, config: &HealthConfig, now: DateTime<Utc>) {
        self.state = BreakerState::Open;
        self.open_until = Some(now + config.cooldown());
        self.half_open_trial = false;
    }

    fn close(&mut self) {
        self.state = BreakerState::Closed;
        self.open_until = None;
        self.consecutive_failures = 0;
        self.recovery_attempts = 0;
        self.manual_reset_required = false;
        self.half_open_trial = false;
    }

    fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        !self.manual_reset_required && self.open_until.map_or(true, |until| now >= until)
    }

    fn retry_after_secs(&self, config: &HealthConfig, now: DateTime<Utc>) -> u64 {
        if self.manual_reset_required {
            return config.cooldown_secs;
        }
        self.open_until
            .map(|until| {
                let ms = (until - now).num_milliseconds().max(0);
                u64::try_from(ms).unwrap_or(0).div_ceil(1000)
            })
            .unwrap_or(0)
    }
}

/// Weighted 0..=100 score: 40% success rate, 30% consecutive-failure
/// penalty, 30% response speed.
pub fn reliability_score(
    success_rate: f64,
    consecutive_failures: u32,
    average_response_ms: Option<f64>,
    config: &HealthConfig,
) -> f64 {
    let streak = (100.0 - 20.0 * f64::from(consecutive_failures)).max(0.0);
    let response = match average_response_ms {
        None => 100.0,
        Some(avg) => {
            let fast = config.fast_response_ms as f64;
            let slow = config.slow_response_ms as f64;
            if avg <= fast {
                100.0
            } else if avg >= slow {
                0.0
            } else {
                100.0 * (slow - avg) / (slow - fast)
            }
        }
    };
    (0.4 * success_rate + 0.3 * streak + 0.3 * response).clamp(0.0, 100.0)
}

/// Per-agent circuit breakers with timeouts, recovery, and reliability scoring.
///
/// All breaker transitions happen inside this type under one lock; agent
/// calls themselves run outside the lock.
pub struct HealthMonitor {
    config: HealthConfig,
    metrics: Mutex<HashMap<String, AgentHealthMetrics>>,
}

impl HealthMonitor {
    /// Create a monitor with no tracked agents.
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            metrics: Mutex::new(HashMap::new()),
        }
    }

    /// Active tuning.
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Run an agent through its breaker and the call timeout.
    ///
    /// Crossing the failure threshold triggers recovery before the error is
    /// returned; the breaker stays open either way.
    pub async fn execute(
        &self,
        registry: &AgentRegistry,
        handle: &AgentHandle,
        ctx: &ExecutionContext,
    ) -> WardenResult<Vec<Finding>> {
        let name = handle.name().to_string();
        let mut trial = TrialSlot {
            monitor: self,
            agent: &name,
            held: self.admit(&name)?,
        };

        let started = Instant::now();
        let result =
            match tokio::time::timeout(self.config.call_timeout(), handle.agent.analyze(ctx, &handle.settings))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(WardenError::Timeout(format!(
                    "agent '{name}' exceeded {}s",
                    self.config.call_timeout_secs
                ))),
            };
        let elapsed = started.elapsed();

        match &result {
            Ok(findings) => {
                self.record_success(&name, elapsed);
                trial.settle();
                debug!(agent = %name, findings = findings.len(), elapsed_ms = elapsed.as_millis() as u64, "Agent call succeeded");
            }
            Err(WardenError::ContextRequirement { .. }) | Err(WardenError::Cancelled(_)) => {}
            Err(e) => {
                let tripped = self.record_failure(&name, e, elapsed);
                trial.settle();
                if tripped {
                    self.recover(registry, handle).await;
                }
            }
        }
        result
    }

    /// Fail fast while OPEN; move to HALF_OPEN once the cooldown elapsed.
    /// Returns `true` when the caller holds the HALF_OPEN trial slot.
    fn admit(&self, agent: &str) -> WardenResult<bool> {
        let now = Utc::now();
        let mut metrics = self.metrics.lock();
        let m = metrics
            .entry(agent.to_string())
            .or_insert_with(|| AgentHealthMetrics::new(agent));
        match m.state {
            BreakerState::Closed => Ok(false),
            BreakerState::Open if m.cooldown_elapsed(now) => {
                m.state = BreakerState::HalfOpen;
                m.half_open_trial = true;
                info!(agent = %agent, "Circuit half-open, allowing trial call");
                Ok(true)
            }
            BreakerState::HalfOpen if !m.half_open_trial => {
                m.half_open_trial = true;
                Ok(true)
            }
            _ => Err(WardenError::CircuitOpen {
                agent: agent.to_string(),
                retry_after_secs: m.retry_after_secs(&self.config, now),
            }),
        }
    }

    fn record_success(&self, agent: &str, elapsed: Duration) {
        let now = Utc::now();
        let mut metrics = self.metrics.lock();
        let m = metrics
            .entry(agent.to_string())
            .or_insert_with(|| AgentHealthMetrics::new(agent));
        m.total_calls += 1;
        m.successes += 1;
        m.consecutive_failures = 0;
        m.last_success_at = Some(now);
        m.record_response(elapsed, self.config.response_window);
        if m.state == BreakerState::HalfOpen {
            m.close();
            info!(agent = %agent, "Circuit closed after successful trial");
        }
        m.refresh_reliability(&self.config);
    }

    /// Returns `true` when this failure opened the breaker from CLOSED.
    fn record_failure(&self, agent: &str, error: &WardenError, elapsed: Duration) -> bool {
        let now = Utc::now();
        let mut metrics = self.metrics.lock();
        let m = metrics
            .entry(agent.to_string())
            .or_insert_with(|| AgentHealthMetrics::new(agent));
        m.total_calls += 1;
        m.failures += 1;
        m.consecutive_failures += 1;
        m.last_error = Some(error.to_string());
        m.last_failure_at = Some(now);
        m.record_response(elapsed, self.config.response_window);

        let tripped = match m.state {
            BreakerState::HalfOpen => {
                m.open(&self.config, now);
                warn!(agent = %agent, error = %error, "Trial call failed, circuit reopened");
                false
            }
            BreakerState::Closed if m.consecutive_failures >= self.config.failure_threshold => {
                m.open(&self.config, now);
                warn!(
                    agent = %agent,
                    consecutive_failures = m.consecutive_failures,
                    cooldown_secs = self.config.cooldown_secs,
                    error = %error,
                    "Circuit opened"
                );
                true
            }
            _ => {
                warn!(agent = %agent, error = %error, "Agent call failed");
                false
            }
        };
        m.refresh_reliability(&self.config);
        tripped
    }

    /// Reset settings, clear the cache, re-probe; up to `recovery_attempts` times.
    /// The breaker stays OPEN; exhausting every attempt requires a manual reset.
    async fn recover(&self, registry: &AgentRegistry, handle: &AgentHandle) -> bool {
        let name = handle.name().to_string();
        for attempt in 1..=self.config.recovery_attempts {
            if let Some(m) = self.metrics.lock().get_mut(&name) {
                m.recovery_attempts = attempt;
            }
            if let Err(e) = registry.reset_settings(&name) {
                warn!(agent = %name, error = %e, "Recovery could not reset settings");
            }
            if let Err(e) = handle.agent.clear_cache().await {
                warn!(agent = %name, error = %e, "Recovery could not clear cache");
            }
            let probe = self.probe(handle).await;
            let ok = probe.ok;
            if let Some(m) = self.metrics.lock().get_mut(&name) {
                m.last_probe = Some(probe);
            }
            if ok {
                info!(agent = %name, attempt, "Recovery probe succeeded, waiting for cooldown");
                return true;
            }
            debug!(agent = %name, attempt, "Recovery probe failed");
        }
        if let Some(m) = self.metrics.lock().get_mut(&name) {
            m.manual_reset_required = true;
        }
        warn!(
            agent = %name,
            attempts = self.config.recovery_attempts,
            "Recovery exhausted, manual reset required"
        );
        false
    }

    async fn probe(&self, handle: &AgentHandle) -> ProbeResult {
        let outcome = match tokio::time::timeout(self.config.call_timeout(), handle.agent.probe()).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("probe exceeded {}s", self.config.call_timeout_secs)),
        };
        ProbeResult {
            agent: handle.name().to_string(),
            ok: outcome.is_none(),
            at: Utc::now(),
            error: outcome,
        }
    }

    /// Probe every registered agent once and advance breakers accordingly.
    pub async fn sweep_once(&self, registry: &AgentRegistry) -> Vec<ProbeResult> {
        let mut results = Vec::new();
        for handle in registry.all() {
            let probe = self.probe(&handle).await;
            let now = Utc::now();
            {
                let mut metrics = self.metrics.lock();
                let m = metrics
                    .entry(handle.name().to_string())
                    .or_insert_with(|| AgentHealthMetrics::new(handle.name()));
                if m.state == BreakerState::Open && m.cooldown_elapsed(now) {
                    m.state = BreakerState::HalfOpen;
                    debug!(agent = %m.agent, "Sweep moved circuit to half-open");
                }
                if m.state == BreakerState::HalfOpen && probe.ok {
                    m.close();
                    info!(agent = %m.agent, "Sweep probe succeeded, circuit closed");
                }
                m.last_probe = Some(probe.clone());
                m.refresh_reliability(&self.config);
            }
            results.push(probe);
        }
        results
    }

    /// Spawn the background sweep. Abort the returned handle to stop it.
    pub fn spawn_sweep(
        self: Arc<Self>,
        registry: Arc<AgentRegistry>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let interval = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let results = self.sweep_once(&registry).await;
                let failed = results.iter().filter(|r| !r.ok).count();
                debug!(probed = results.len(), failed, "Health sweep finished");
            }
        })
    }

    /// Spawn the background sweep at the configured `sweep_interval_secs`.
    pub fn spawn_sweep_from_config(self: Arc<Self>, registry: Arc<AgentRegistry>) -> JoinHandle<()> {
        let interval = self.config.sweep_interval();
        info!(interval_secs = interval.as_secs(), "Starting health sweep");
        self.spawn_sweep(registry, interval)
    }

    /// Force the breaker closed and clear the manual-reset flag.
    pub fn reset(&self, agent: &str) {
        let mut metrics = self.metrics.lock();
        let m = metrics
            .entry(agent.to_string())
            .or_insert_with(|| AgentHealthMetrics::new(agent));
        m.close();
        m.refresh_reliability(&self.config);
        info!(agent = %agent, "Circuit manually reset");
    }

    /// Breaker state; CLOSED for agents never called.
    pub fn state(&self, agent: &str) -> BreakerState {
        self.metrics
            .lock()
            .get(agent)
            .map(|m| m.state)
            .unwrap_or_default()
    }

    /// Copy of an agent's metrics.
    pub fn metrics(&self, agent: &str) -> Option<AgentHealthMetrics> {
        self.metrics.lock().get(agent).cloned()
    }

    /// 100 for agents never called.
    pub fn reliability(&self, agent: &str) -> f64 {
        self.metrics
            .lock()
            .get(agent)
            .map_or(100.0, |m| m.reliability)
    }

    /// All tracked agents, sorted by name.
    pub fn snapshot(&self) -> Vec<AgentHealthMetrics> {
        let mut all: Vec<_> = self.metrics.lock().values().cloned().collect();
        all.sort_by(|a, b| a.agent.cmp(&b.agent));
        all
    }

    /// Serialize the current state as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        let agents = self.snapshot();
        let open = agents
            .iter()
            .filter(|m| m.state != BreakerState::Closed)
            .count();
        serde_json::json!({
            "agents": agents,
            "open_circuits": open,
            "config": self.config,
        })
    }
}

/// HALF_OPEN trial slot held by one in-flight call. Dropping it unsettled,
/// e.g. when the caller abandons the call, frees the slot for the next call.
struct TrialSlot<'a> {
    monitor: &'a HealthMonitor,
    agent: &'a str,
    held: bool,
}

impl TrialSlot<'_> {
    /// The call outcome was recorded; the breaker state now owns the slot.
    fn settle(&mut self) {
        self.held = false;
    }
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        if let Some(m) = self.monitor.metrics.lock().get_mut(self.agent) {
            if m.state == BreakerState::HalfOpen {
                m.half_open_trial = false;
                debug!(agent = %self.agent, "Trial call ended without a result, slot released");
            }
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentSettings};
    use crate::descriptor::{AgentCategory, AgentDescriptor};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use uuid::Uuid;

    struct FlakyAgent {
        descriptor: AgentDescriptor,
        fail: AtomicBool,
        probe_ok: AtomicBool,
        calls: AtomicUsize,
        cache_clears: AtomicUsize,
        delay_ms: AtomicU64,
    }

    impl FlakyAgent {
        fn new(name: &str) -> Self {
            Self {
                descriptor: AgentDescriptor::new(name, AgentCategory::Threat),
                fail: AtomicBool::new(false),
                probe_ok: AtomicBool::new(true),
                calls: AtomicUsize::new(0),
                cache_clears: AtomicUsize::new(0),
                delay_ms: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl Agent for FlakyAgent {
        fn descriptor(&self) -> &AgentDescriptor {
            &self.descriptor
        }

        async fn analyze(
            &self,
            _ctx: &ExecutionContext,
            _settings: &AgentSettings,
        ) -> WardenResult<Vec<Finding>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                Err(WardenError::ProviderUnavailable("503".into()))
            } else {
                Ok(vec![])
            }
        }

        async fn clear_cache(&self) -> WardenResult<()> {
            self.cache_clears.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn probe(&self) -> WardenResult<()> {
            if self.probe_ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(WardenError::ProviderUnavailable("probe".into()))
            }
        }
    }

    fn setup(agent: FlakyAgent, config: HealthConfig) -> (Arc<FlakyAgent>, AgentRegistry, HealthMonitor) {
        let agent = Arc::new(agent);
        let registry = AgentRegistry::new();
        registry.register(agent.clone()).unwrap();
        (agent, registry, HealthMonitor::new(config))
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(Uuid::new_v4()).with_input_text("doc")
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_fails_fast() {
        let (agent, registry, monitor) = setup(FlakyAgent::new("stride"), HealthConfig::default());
        agent.fail.store(true, Ordering::SeqCst);
        let handle = registry.get("stride").unwrap();

        for _ in 0..3 {
            let err = monitor.execute(&registry, &handle, &ctx()).await.unwrap_err();
            assert!(matches!(err, WardenError::ProviderUnavailable(_)));
        }
        assert_eq!(monitor.state("stride"), BreakerState::Open);

        let err = monitor.execute(&registry, &handle, &ctx()).await.unwrap_err();
        match err {
            WardenError::CircuitOpen { agent: a, retry_after_secs } => {
                assert_eq!(a, "stride");
                assert!(retry_after_secs > 0 && retry_after_secs <= 300);
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
        assert_eq!(agent.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_successful_recovery_keeps_breaker_open() {
        let (agent, registry, monitor) = setup(FlakyAgent::new("stride"), HealthConfig::default());
        agent.fail.store(true, Ordering::SeqCst);
        let handle = registry.get("stride").unwrap();
        for _ in 0..3 {
            let _ = monitor.execute(&registry, &handle, &ctx()).await;
        }
        let m = monitor.metrics("stride").unwrap();
        assert_eq!(m.state, BreakerState::Open);
        assert_eq!(m.recovery_attempts, 1);
        assert!(!m.manual_reset_required);
        assert!(m.last_probe.unwrap().ok);
        assert_eq!(agent.cache_clears.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_recovery_requires_manual_reset() {
        let config = HealthConfig {
            cooldown_secs: 0,
            ..HealthConfig::default()
        };
        let (agent, registry, monitor) = setup(FlakyAgent::new("stride"), config);
        agent.fail.store(true, Ordering::SeqCst);
        agent.probe_ok.store(false, Ordering::SeqCst);
        let handle = registry.get("stride").unwrap();
        for _ in 0..3 {
            let _ = monitor.execute(&registry, &handle, &ctx()).await;
        }
        let m = monitor.metrics("stride").unwrap();
        assert!(m.manual_reset_required);
        assert_eq!(m.recovery_attempts, 3);
        assert_eq!(agent.cache_clears.load(Ordering::SeqCst), 3);

        // Cooldown is zero, but the flag keeps the breaker open.
        agent.fail.store(false, Ordering::SeqCst);
        assert!(matches!(
            monitor.execute(&registry, &handle, &ctx()).await,
            Err(WardenError::CircuitOpen { .. })
        ));

        monitor.reset("stride");
        assert_eq!(monitor.state("stride"), BreakerState::Closed);
        assert!(monitor.execute(&registry, &handle, &ctx()).await.is_ok());
    }

    #[tokio::test]
    async fn test_half_open_success_closes_and_failure_reopens() {
        let config = HealthConfig {
            cooldown_secs: 0,
            ..HealthConfig::default()
        };
        let (agent, registry, monitor) = setup(FlakyAgent::new("stride"), config);
        agent.fail.store(true, Ordering::SeqCst);
        let handle = registry.get("stride").unwrap();
        for _ in 0..3 {
            let _ = monitor.execute(&registry, &handle, &ctx()).await;
        }
        assert_eq!(monitor.state("stride"), BreakerState::Open);

        // Trial call fails: reopened, no new recovery.
        let _ = monitor.execute(&registry, &handle, &ctx()).await;
        assert_eq!(monitor.state("stride"), BreakerState::Open);
        assert_eq!(monitor.metrics("stride").unwrap().recovery_attempts, 1);

        agent.fail.store(false, Ordering::SeqCst);
        monitor.execute(&registry, &handle, &ctx()).await.unwrap();
        let m = monitor.metrics("stride").unwrap();
        assert_eq!(m.state, BreakerState::Closed);
        assert_eq!(m.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let slow = FlakyAgent::new("slow");
        slow.delay_ms.store(2_000, Ordering::SeqCst);
        let config = HealthConfig {
            call_timeout_secs: 0,
            ..HealthConfig::default()
        };
        let (_agent, registry, monitor) = setup(slow, config);
        let handle = registry.get("slow").unwrap();
        let err = monitor.execute(&registry, &handle, &ctx()).await.unwrap_err();
        assert!(matches!(err, WardenError::Timeout(_)));
        assert_eq!(monitor.metrics("slow").unwrap().failures, 1);
    }

    #[tokio::test]
    async fn test_sweep_closes_elapsed_breakers() {
        let config = HealthConfig {
            cooldown_secs: 0,
            ..HealthConfig::default()
        };
        let (agent, registry, monitor) = setup(FlakyAgent::new("stride"), config);
        agent.fail.store(true, Ordering::SeqCst);
        let handle = registry.get("stride").unwrap();
        for _ in 0..3 {
            let _ = monitor.execute(&registry, &handle, &ctx()).await;
        }
        assert_eq!(monitor.state("stride"), BreakerState::Open);

        let results = monitor.sweep_once(&registry).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].ok);
        assert_eq!(monitor.state("stride"), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_abandoned_trial_call_frees_half_open_slot() {
        let config = HealthConfig {
            cooldown_secs: 0,
            ..HealthConfig::default()
        };
        let (agent, registry, monitor) = setup(FlakyAgent::new("stride"), config);
        agent.fail.store(true, Ordering::SeqCst);
        let handle = registry.get("stride").unwrap();
        for _ in 0..3 {
            let _ = monitor.execute(&registry, &handle, &ctx()).await;
        }
        assert_eq!(monitor.state("stride"), BreakerState::Open);

        // The trial call is abandoned before the agent answers.
        agent.fail.store(false, Ordering::SeqCst);
        agent.delay_ms.store(500, Ordering::SeqCst);
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            monitor.execute(&registry, &handle, &ctx()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(monitor.state("stride"), BreakerState::HalfOpen);

        agent.delay_ms.store(0, Ordering::SeqCst);
        monitor.execute(&registry, &handle, &ctx()).await.unwrap();
        assert_eq!(monitor.state("stride"), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_sweep_closes_half_open_with_trial_in_flight() {
        let config = HealthConfig {
            cooldown_secs: 0,
            ..HealthConfig::default()
        };
        let (agent, registry, monitor) = setup(FlakyAgent::new("stride"), config);
        agent.fail.store(true, Ordering::SeqCst);
        let handle = registry.get("stride").unwrap();
        for _ in 0..3 {
            let _ = monitor.execute(&registry, &handle, &ctx()).await;
        }

        agent.fail.store(false, Ordering::SeqCst);
        agent.delay_ms.store(200, Ordering::SeqCst);
        let trial_ctx = ctx();
        let (trial, state_after_sweep) = tokio::join!(
            monitor.execute(&registry, &handle, &trial_ctx),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                assert_eq!(monitor.state("stride"), BreakerState::HalfOpen);
                monitor.sweep_once(&registry).await;
                monitor.state("stride")
            }
        );
        assert_eq!(state_after_sweep, BreakerState::Closed);
        assert!(trial.is_ok());
        assert_eq!(monitor.state("stride"), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_spawn_sweep_from_config_uses_interval() {
        let config = HealthConfig {
            sweep_interval_secs: 0,
            ..HealthConfig::default()
        };
        assert_eq!(config.sweep_interval(), Duration::from_secs(1));
        let (_agent, registry, monitor) = setup(FlakyAgent::new("stride"), config);
        let monitor = Arc::new(monitor);
        let handle = monitor.clone().spawn_sweep_from_config(Arc::new(registry));
        tokio::time::sleep(Duration::from_millis(1_300)).await;
        handle.abort();
        assert!(monitor.metrics("stride").unwrap().last_probe.is_some());
    }

    #[tokio::test]
    async fn test_spawn_sweep_probes_in_background() {
        let (_agent, registry, monitor) = setup(FlakyAgent::new("stride"), HealthConfig::default());
        let monitor = Arc::new(monitor);
        let handle = monitor
            .clone()
            .spawn_sweep(Arc::new(registry), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();
        assert!(monitor.metrics("stride").unwrap().last_probe.is_some());
    }

    #[test]
    fn test_reliability_score() {
        let config = HealthConfig::default();
        assert!((reliability_score(100.0, 0, None, &config) - 100.0).abs() < 1e-9);
        assert!((reliability_score(100.0, 0, Some(1_000.0), &config) - 100.0).abs() < 1e-9);
        assert!(reliability_score(0.0, 5, Some(30_000.0), &config).abs() < 1e-9);
        // 0.4*50 + 0.3*60 + 0.3*50
        let mid = reliability_score(50.0, 2, Some(16_000.0), &config);
        assert!((mid - 53.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_to_json_reports_open_circuits() {
        let (agent, registry, monitor) = setup(FlakyAgent::new("stride"), HealthConfig::default());
        agent.fail.store(true, Ordering::SeqCst);
        let handle = registry.get("stride").unwrap();
        for _ in 0..3 {
            let _ = monitor.execute(&registry, &handle, &ctx()).await;
        }
        let json = monitor.to_json();
        assert_eq!(json["open_circuits"], 1);
        assert_eq!(json["agents"][0]["state"], "open");
        assert!(monitor.reliability("stride") < 50.0);
    }
}
