//! Supervisor for the out-of-process synthesis worker.
//!
//! Owns exactly one live worker process, speaks the line-delimited JSON
//! protocol over its stdin/stdout, watches stderr for the readiness marker,
//! correlates responses to pending requests (by id, FIFO as fallback), and
//! restarts crashed workers with exponential backoff. All admission is gated
//! by the circuit breaker; a bounded number of restart attempts guards
//! against restart-looping forever.

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::engine::{SpeechOptions, SpokenAudio, Synthesizer};
use crate::protocol::{WireRequest, WireResponse};
use crate::runtime::{DevicePreference, WorkerRuntime};
use crate::{Result, SynthError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{oneshot, watch, Mutex, Semaphore};
use tracing::{debug, error, info, warn};

/// Substrings the worker prints on stderr once model loading completes.
const READY_MARKERS: [&str; 2] = ["service is ready", "service ready"];
/// Stderr substrings that mean startup cannot succeed.
const FATAL_MARKERS: [&str; 3] = ["Initialization failed", "model not found", "Traceback"];

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub device: DevicePreference,
    /// Model loading can legitimately take minutes.
    pub startup_timeout: Duration,
    /// Short wait used by the `is_ready` probe.
    pub ready_probe_timeout: Duration,
    /// Floor for per-request timeouts.
    pub base_request_timeout: Duration,
    /// Cap for per-request timeouts.
    pub max_request_timeout: Duration,
    /// The timeout scales up by one base step per this many input chars.
    pub timeout_scale_chars: usize,
    pub restart_base_delay: Duration,
    pub restart_max_delay: Duration,
    /// After this many consecutive failed restarts the supervisor reports
    /// itself permanently degraded instead of looping.
    pub max_restart_attempts: u32,
    /// Concurrent in-flight requests admitted to the worker. Defaults to 1:
    /// the worker is treated as non-reentrant unless it is known to echo
    /// request ids.
    pub max_inflight: usize,
    pub breaker: BreakerConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let startup_timeout = env_ms("VERSE_STARTUP_TIMEOUT_MS", 300_000);
        let max_restart_attempts = env_u32("VERSE_MAX_RESTARTS", 5);
        let max_inflight = env_u32("VERSE_MAX_INFLIGHT", 1).max(1) as usize;
        Self {
            device: DevicePreference::from_env(),
            startup_timeout,
            ready_probe_timeout: Duration::from_secs(5),
            base_request_timeout: Duration::from_secs(60),
            max_request_timeout: Duration::from_secs(300),
            timeout_scale_chars: 400,
            restart_base_delay: Duration::from_secs(1),
            restart_max_delay: Duration::from_secs(60),
            max_restart_attempts,
            max_inflight,
            breaker: BreakerConfig::default(),
        }
    }
}

fn env_ms(key: &str, default_ms: u64) -> Duration {
    let ms = std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, PartialEq)]
enum WorkerStatus {
    Down,
    Starting,
    Ready,
    Failed(String),
}

struct PendingEntry {
    tx: oneshot::Sender<Result<WireResponse>>,
    started_at: Instant,
}

struct ProcSlot {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    /// Bumped on every spawn so readers of a replaced process cannot run the
    /// exit path for the current one.
    generation: u64,
}

struct Inner {
    runtime: WorkerRuntime,
    cfg: WorkerConfig,
    breaker: CircuitBreaker,
    pending: DashMap<u64, PendingEntry>,
    /// Send-order queue of pending ids, used when a response carries no id.
    fifo: StdMutex<VecDeque<u64>>,
    next_id: AtomicU64,
    inflight: Semaphore,
    slot: Mutex<ProcSlot>,
    status_tx: watch::Sender<WorkerStatus>,
    /// Spawn-on-demand honors this backoff window after a crash.
    next_restart_at: StdMutex<Option<Instant>>,
    restart_attempts: AtomicU32,
    degraded: AtomicBool,
    shutting_down: AtomicBool,
}

/// Cloneable handle; all clones share one worker process and one breaker.
#[derive(Clone)]
pub struct WorkerSupervisor {
    inner: Arc<Inner>,
}

impl WorkerSupervisor {
    pub fn new(runtime: WorkerRuntime, cfg: WorkerConfig) -> Self {
        let (status_tx, _) = watch::channel(WorkerStatus::Down);
        let max_inflight = cfg.max_inflight.max(1);
        let breaker = CircuitBreaker::new(cfg.breaker.clone());
        Self {
            inner: Arc::new(Inner {
                runtime,
                cfg,
                breaker,
                pending: DashMap::new(),
                fifo: StdMutex::new(VecDeque::new()),
                next_id: AtomicU64::new(1),
                inflight: Semaphore::new(max_inflight),
                slot: Mutex::new(ProcSlot {
                    child: None,
                    stdin: None,
                    generation: 0,
                }),
                status_tx,
                next_restart_at: StdMutex::new(None),
                restart_attempts: AtomicU32::new(0),
                degraded: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    /// Synthesize one text via the worker. One admission check against the
    /// breaker, one wire request, one correlated response or timeout.
    pub async fn generate(&self, text: &str, opts: &SpeechOptions) -> Result<SpokenAudio> {
        let inner = &self.inner;
        let text = text.trim();
        if text.is_empty() {
            return Err(SynthError::EmptyText);
        }
        if !(opts.speed.is_finite() && opts.speed > 0.0) {
            return Err(SynthError::InvalidSpeed(opts.speed));
        }

        if inner.degraded.load(Ordering::SeqCst) {
            return Err(SynthError::RecoveryExhausted {
                attempts: inner.cfg.max_restart_attempts,
            });
        }
        if !inner.breaker.can_execute() {
            let retry_after = inner
                .breaker
                .retry_after()
                .unwrap_or(inner.cfg.breaker.base_delay);
            return Err(SynthError::CircuitOpen { retry_after });
        }

        let _permit = inner
            .inflight
            .acquire()
            .await
            .map_err(|_| SynthError::WorkerExited("supervisor shut down".into()))?;

        self.ensure_ready().await?;

        let request_id = inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(
            request_id,
            PendingEntry {
                tx,
                started_at: Instant::now(),
            },
        );
        self.fifo_locked().push_back(request_id);

        let request = WireRequest {
            request_id,
            text: text.to_string(),
            speed: opts.speed,
            lang_code: opts.lang_code.clone(),
            voice: opts.voice.clone(),
        };
        let line = request.to_line()?;
        if let Err(e) = self.send_line(&line).await {
            self.unregister(request_id);
            inner.breaker.record_failure();
            return Err(SynthError::WorkerExited(format!(
                "failed to write request: {e}"
            )));
        }

        let waited = compute_timeout(&inner.cfg, text.chars().count());
        debug!(request_id, timeout = ?waited, chars = text.chars().count(), "request sent");

        match tokio::time::timeout(waited, rx).await {
            Err(_) => {
                // The worker may still answer later; the late response is then
                // dropped as unsolicited. Only the first resolver wins.
                if self.unregister(request_id) {
                    inner.breaker.record_failure();
                }
                Err(SynthError::Timeout { request_id, waited })
            }
            Ok(Err(_)) => Err(SynthError::WorkerExited(
                "request dropped during supervisor teardown".into(),
            )),
            // Exit-cleanup errors arrive pre-classified; the breaker was
            // already informed exactly once by the exit path.
            Ok(Ok(Err(e))) => Err(e),
            Ok(Ok(Ok(resp))) => self.settle(request_id, resp),
        }
    }

    fn settle(&self, request_id: u64, resp: WireResponse) -> Result<SpokenAudio> {
        let inner = &self.inner;
        if resp.success {
            match resp.decode_audio() {
                Ok(wav) => {
                    inner.breaker.record_success();
                    inner.restart_attempts.store(0, Ordering::SeqCst);
                    if let Some(device) = resp.device.as_deref() {
                        debug!(request_id, device, bytes = wav.len(), "synthesis complete");
                    }
                    Ok(SpokenAudio {
                        wav,
                        device: resp.device,
                    })
                }
                Err(e) => {
                    inner.breaker.record_failure();
                    Err(e)
                }
            }
        } else {
            inner.breaker.record_failure();
            Err(SynthError::Worker(resp.error_message()))
        }
    }

    /// Readiness probe: breaker first, then current state, then a short wait
    /// for the readiness/error event. Outcome is reported to the breaker.
    pub async fn is_ready(&self) -> bool {
        let inner = &self.inner;
        if inner.degraded.load(Ordering::SeqCst) {
            return false;
        }
        if !inner.breaker.can_execute() {
            return false;
        }
        if *inner.status_tx.borrow() == WorkerStatus::Ready {
            inner.breaker.record_success();
            return true;
        }

        self.hold_for_restart_gate().await;
        {
            let mut slot = inner.slot.lock().await;
            if slot.child.is_none() {
                if let Err(e) = self.spawn_locked(&mut slot) {
                    warn!("readiness probe could not start worker: {e}");
                    inner.breaker.record_failure();
                    return false;
                }
            }
        }

        let mut rx = inner.status_tx.subscribe();
        let wait = async {
            loop {
                match rx.borrow_and_update().clone() {
                    WorkerStatus::Ready => return true,
                    WorkerStatus::Failed(_) => return false,
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        match tokio::time::timeout(inner.cfg.ready_probe_timeout, wait).await {
            Ok(true) => {
                inner.breaker.record_success();
                true
            }
            _ => {
                inner.breaker.record_failure();
                false
            }
        }
    }

    /// Terminate the child and reject all pending requests. Outstanding
    /// callers must not be left hanging across host shutdown.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutting_down.store(true, Ordering::SeqCst);
        inner.inflight.close();
        {
            let mut slot = inner.slot.lock().await;
            slot.stdin = None;
            if let Some(mut child) = slot.child.take() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        self.fail_all_pending("supervisor shutting down");
        inner.status_tx.send_replace(WorkerStatus::Down);
        info!("synthesis worker supervisor shut down");
    }

    /// A crashed worker is only respawned once its backoff window has
    /// elapsed, even when a caller or probe shows up earlier.
    async fn hold_for_restart_gate(&self) {
        let hold = {
            let gate = self
                .inner
                .next_restart_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            gate.map(|at| at.saturating_duration_since(Instant::now()))
        };
        if let Some(hold) = hold {
            if !hold.is_zero() {
                tokio::time::sleep(hold).await;
            }
        }
    }

    async fn ensure_ready(&self) -> Result<()> {
        let inner = &self.inner;
        self.hold_for_restart_gate().await;

        let mut rx = inner.status_tx.subscribe();
        {
            let mut slot = inner.slot.lock().await;
            if *inner.status_tx.borrow() == WorkerStatus::Ready {
                return Ok(());
            }
            if slot.child.is_none() {
                if let Err(e) = self.spawn_locked(&mut slot) {
                    inner.breaker.record_failure();
                    inner
                        .status_tx
                        .send_replace(WorkerStatus::Failed(e.to_string()));
                    return Err(e);
                }
            }
        }

        let wait = async {
            loop {
                match rx.borrow_and_update().clone() {
                    WorkerStatus::Ready => return Ok(()),
                    WorkerStatus::Failed(msg) => return Err(SynthError::Startup(msg)),
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(SynthError::Startup("supervisor dropped".into()));
                }
            }
        };
        match tokio::time::timeout(inner.cfg.startup_timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout = ?inner.cfg.startup_timeout, "worker readiness wait timed out");
                // Kill the stuck process; its exit path records the failure
                // and schedules the restart.
                let mut slot = inner.slot.lock().await;
                slot.stdin = None;
                if let Some(mut child) = slot.child.take() {
                    let _ = child.start_kill();
                }
                Err(SynthError::Startup(format!(
                    "worker not ready within {:?}",
                    inner.cfg.startup_timeout
                )))
            }
        }
    }

    fn spawn_locked(&self, slot: &mut ProcSlot) -> Result<()> {
        let inner = &self.inner;
        inner.status_tx.send_replace(WorkerStatus::Starting);

        let mut cmd = inner.runtime.command(inner.cfg.device);
        let mut child = cmd
            .spawn()
            .map_err(|e| SynthError::Startup(format!("failed to spawn worker: {e}")))?;

        slot.generation += 1;
        let generation = slot.generation;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SynthError::Startup("worker stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SynthError::Startup("worker stderr unavailable".into()))?;
        slot.stdin = child.stdin.take();
        slot.child = Some(child);
        *self
            .inner
            .next_restart_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        info!(
            generation,
            device = inner.cfg.device.as_env_value(),
            script = %inner.runtime.script.display(),
            "spawned synthesis worker"
        );

        // Response stream: one JSON object per line. BufReader keeps partial
        // writes buffered until the trailing newline arrives.
        let this = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => this.handle_line(&line),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("worker stdout read error: {e}");
                        break;
                    }
                }
            }
            this.on_exit(generation).await;
        });

        // Diagnostic stream: readiness marker and startup errors.
        let this = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                this.handle_diagnostic(&line);
            }
        });

        Ok(())
    }

    fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match WireResponse::parse(line) {
            Ok(resp) => {
                let id = match resp.request_id {
                    Some(id) => id,
                    // FIFO fallback for workers that do not echo ids.
                    None => match self.fifo_locked().front().copied() {
                        Some(id) => id,
                        None => {
                            debug!("unsolicited worker response dropped");
                            return;
                        }
                    },
                };
                let Some((_, entry)) = self.inner.pending.remove(&id) else {
                    debug!(id, "late or duplicate worker response dropped");
                    return;
                };
                self.fifo_remove(id);
                debug!(id, elapsed = ?entry.started_at.elapsed(), "worker response correlated");
                let _ = entry.tx.send(Ok(resp));
            }
            Err(e) => {
                // A malformed line consumed the oldest request's slot on a
                // FIFO worker; fail that request rather than letting it wait
                // for its timeout.
                warn!("malformed worker response line: {e}");
                self.inner.breaker.record_failure();
                if let Some(id) = self.fifo_locked().front().copied() {
                    if let Some((_, entry)) = self.inner.pending.remove(&id) {
                        self.fifo_remove(id);
                        let _ = entry
                            .tx
                            .send(Err(SynthError::Worker("malformed worker response".into())));
                    }
                }
            }
        }
    }

    fn handle_diagnostic(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        debug!(target: "verse_core::worker::diag", "{line}");
        if READY_MARKERS.iter().any(|m| line.contains(m)) {
            info!("worker reported ready");
            self.inner.status_tx.send_replace(WorkerStatus::Ready);
        } else if FATAL_MARKERS.iter().any(|m| line.contains(m))
            && *self.inner.status_tx.borrow() == WorkerStatus::Starting
        {
            self.inner
                .status_tx
                .send_replace(WorkerStatus::Failed(line.to_string()));
            // The process may linger after a fatal init error. Kill it so the
            // exit path records the failure and schedules the restart instead
            // of the supervisor wedging on a dead-but-alive worker.
            let this = self.clone();
            tokio::spawn(async move {
                let mut slot = this.inner.slot.lock().await;
                slot.stdin = None;
                if let Some(mut child) = slot.child.take() {
                    let _ = child.start_kill();
                }
            });
        }
    }

    /// Exit path for a worker process. Runs at most once per generation:
    /// fails every pending request, reports a single breaker failure, and
    /// schedules a bounded-backoff restart.
    async fn on_exit(&self, generation: u64) {
        let inner = &self.inner;
        {
            let mut slot = inner.slot.lock().await;
            if slot.generation != generation {
                return;
            }
            slot.stdin = None;
            if let Some(mut child) = slot.child.take() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }

        self.fail_all_pending("worker process exited");
        inner.status_tx.send_replace(WorkerStatus::Down);

        if inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        warn!(generation, "synthesis worker exited");
        // One exit event is one failure, regardless of pending count.
        inner.breaker.record_failure();

        let attempts = inner.restart_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempts > inner.cfg.max_restart_attempts {
            error!(
                attempts,
                "worker restart attempts exhausted; supervisor degraded"
            );
            inner.degraded.store(true, Ordering::SeqCst);
            inner
                .status_tx
                .send_replace(WorkerStatus::Failed("restart attempts exhausted".into()));
            return;
        }

        let first_delay = restart_delay(&inner.cfg, attempts);
        *inner
            .next_restart_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now() + first_delay);

        let this = self.clone();
        let restart: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(async move {
            let mut attempt = attempts;
            loop {
                let delay = restart_delay(&this.inner.cfg, attempt);
                info!(attempt, ?delay, "scheduling worker restart");
                tokio::time::sleep(delay).await;
                let inner = &this.inner;
                if inner.shutting_down.load(Ordering::SeqCst)
                    || inner.degraded.load(Ordering::SeqCst)
                {
                    return;
                }
                let mut slot = inner.slot.lock().await;
                if slot.child.is_some() {
                    return;
                }
                match this.spawn_locked(&mut slot) {
                    Ok(()) => return,
                    Err(e) => {
                        drop(slot);
                        warn!("worker restart failed: {e}");
                        inner.breaker.record_failure();
                        attempt = inner.restart_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                        if attempt > inner.cfg.max_restart_attempts {
                            error!(
                                attempts = attempt,
                                "worker restart attempts exhausted; supervisor degraded"
                            );
                            inner.degraded.store(true, Ordering::SeqCst);
                            inner.status_tx.send_replace(WorkerStatus::Failed(
                                "restart attempts exhausted".into(),
                            ));
                            return;
                        }
                    }
                }
            }
        });
        tokio::spawn(restart);
    }

    async fn send_line(&self, line: &str) -> std::io::Result<()> {
        let mut slot = self.inner.slot.lock().await;
        let stdin = slot.stdin.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "worker stdin closed")
        })?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await
    }

    /// Remove a pending entry; true if this caller performed the removal.
    /// Every entry is removed exactly once: by its response, its timeout, or
    /// exit cleanup, whichever comes first.
    fn unregister(&self, request_id: u64) -> bool {
        let removed = self.inner.pending.remove(&request_id).is_some();
        if removed {
            self.fifo_remove(request_id);
        }
        removed
    }

    fn fail_all_pending(&self, reason: &str) {
        let ids: Vec<u64> = self.inner.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.inner.pending.remove(&id) {
                let _ = entry.tx.send(Err(SynthError::WorkerExited(reason.into())));
            }
        }
        self.fifo_locked().clear();
    }

    fn fifo_locked(&self) -> std::sync::MutexGuard<'_, VecDeque<u64>> {
        self.inner
            .fifo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn fifo_remove(&self, request_id: u64) {
        let mut fifo = self.fifo_locked();
        if let Some(pos) = fifo.iter().position(|&id| id == request_id) {
            fifo.remove(pos);
        }
    }
}

#[async_trait]
impl Synthesizer for WorkerSupervisor {
    async fn synthesize(&self, text: &str, opts: &SpeechOptions) -> Result<SpokenAudio> {
        self.generate(text, opts).await
    }
}

/// Scale the wait to the input: short texts must not wait as long as long
/// ones, and nothing waits past the cap.
fn compute_timeout(cfg: &WorkerConfig, chars: usize) -> Duration {
    let steps = (chars / cfg.timeout_scale_chars.max(1)) as u32 + 1;
    cfg.base_request_timeout
        .saturating_mul(steps)
        .min(cfg.max_request_timeout)
}

fn restart_delay(cfg: &WorkerConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(6);
    cfg.restart_base_delay
        .saturating_mul(1u32 << exponent)
        .min(cfg.restart_max_delay)
}
