//! Model load gate.
//!
//! Before the dispatcher talks to the server it runs `ensure_ready`, which
//! applies the configured load strategy: `off` trusts the caller, `jit`
//! defers to the server's load-on-first-use behavior, `cli` shells out to
//! the `lms` CLI and polls the loaded-model list until the deadline.
//!
//! The gate is stateless across calls. The server owns the truth about what
//! is loaded and may unload models on its own, so nothing is cached here;
//! each call builds a fresh [`ModelLoadState`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::server::InferenceBackend;

/// How to get a model into memory before sending the real request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LoadStrategy {
    /// Let the server load the model on first use; the dispatcher retries
    /// once if the first request lands before the load.
    #[default]
    Jit,
    /// Load explicitly through the external CLI, then poll until loaded.
    Cli,
    /// Do nothing; the inference call surfaces any resulting error.
    Off,
}

/// Why the gate could not resolve to ready.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoadFailure {
    #[error("model load timed out")]
    Timeout,
    #[error("model load failed: {0}")]
    LoadError(String),
}

/// External load command, `lms load <model>` in production.
#[async_trait]
pub trait LoadCommand: Send + Sync {
    /// Request a load of `model_id`. `Err` carries the command's own
    /// diagnostic (non-zero exit, unrecognized model, missing binary).
    async fn load(&self, model_id: &str) -> Result<(), String>;
}

/// Time source for the polling loop, injected so tests can advance time
/// without sleeping.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// `lms` CLI invocation via subprocess.
pub struct LmsCli {
    program: String,
}

impl Default for LmsCli {
    fn default() -> Self {
        Self {
            program: "lms".into(),
        }
    }
}

#[async_trait]
impl LoadCommand for LmsCli {
    async fn load(&self, model_id: &str) -> Result<(), String> {
        let output = tokio::process::Command::new(&self.program)
            .args(["load", model_id, "-y"])
            .output()
            .await
            .map_err(|e| format!("{} not runnable: {e}", self.program))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        Err(format!(
            "{} load exited with {}: {detail}",
            self.program, output.status
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unknown,
    Probing,
    Loading,
    Ready,
    Failed,
}

/// Transient per-call record of the gate's progress. One instance per
/// outstanding request; never shared or persisted.
struct ModelLoadState {
    model_id: String,
    strategy: LoadStrategy,
    deadline: Instant,
    attempts: u32,
    phase: Phase,
}

impl ModelLoadState {
    fn new(model_id: &str, strategy: LoadStrategy, deadline: Instant) -> Self {
        Self {
            model_id: model_id.to_string(),
            strategy,
            deadline,
            attempts: 0,
            phase: Phase::Unknown,
        }
    }

    fn advance(&mut self, phase: Phase) {
        tracing::trace!(
            model = %self.model_id,
            from = ?self.phase,
            to = ?phase,
            "load state transition"
        );
        self.phase = phase;
    }
}

/// The load orchestrator: strategy dispatch plus the bounded poll loop.
pub struct ModelGate {
    backend: Arc<dyn InferenceBackend>,
    load_command: Arc<dyn LoadCommand>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl ModelGate {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        load_command: Arc<dyn LoadCommand>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            backend,
            load_command,
            clock,
            poll_interval,
        }
    }

    /// Resolve the gate for one request.
    ///
    /// An empty `model_id` means "use the server default" and there is
    /// nothing to load, whatever the strategy.
    pub async fn ensure_ready(
        &self,
        model_id: &str,
        strategy: LoadStrategy,
        timeout: Duration,
    ) -> Result<(), LoadFailure> {
        if model_id.is_empty() || strategy == LoadStrategy::Off {
            return Ok(());
        }

        let mut state = ModelLoadState::new(model_id, strategy, self.clock.now() + timeout);
        let result = match strategy {
            LoadStrategy::Off => Ok(()),
            LoadStrategy::Jit => self.ensure_jit(&mut state).await,
            LoadStrategy::Cli => self.ensure_cli(&mut state).await,
        };

        match &result {
            Ok(()) => tracing::debug!(
                model = %state.model_id,
                strategy = ?state.strategy,
                attempts = state.attempts,
                "load gate ready"
            ),
            Err(failure) => tracing::warn!(
                model = %state.model_id,
                strategy = ?state.strategy,
                attempts = state.attempts,
                error = %failure,
                "load gate failed"
            ),
        }
        result
    }

    async fn ensure_jit(&self, state: &mut ModelLoadState) -> Result<(), LoadFailure> {
        state.advance(Phase::Probing);
        state.attempts += 1;
        if self.probe(&state.model_id).await {
            tracing::debug!(model = %state.model_id, "model already loaded");
        } else {
            // The server loads on first use; the dispatcher bounds the wait
            // and retries once if the first request beats the load.
            tracing::debug!(model = %state.model_id, "deferring to first-touch load");
        }
        state.advance(Phase::Ready);
        Ok(())
    }

    async fn ensure_cli(&self, state: &mut ModelLoadState) -> Result<(), LoadFailure> {
        state.advance(Phase::Probing);
        state.attempts += 1;
        if self.probe(&state.model_id).await {
            state.advance(Phase::Ready);
            return Ok(());
        }

        state.advance(Phase::Loading);
        if let Err(detail) = self.load_command.load(&state.model_id).await {
            state.advance(Phase::Failed);
            return Err(LoadFailure::LoadError(detail));
        }

        loop {
            if self.clock.now() >= state.deadline {
                state.advance(Phase::Failed);
                return Err(LoadFailure::Timeout);
            }
            self.clock.sleep(self.poll_interval).await;
            state.attempts += 1;
            if self.probe(&state.model_id).await {
                state.advance(Phase::Ready);
                return Ok(());
            }
        }
    }

    async fn probe(&self, model_id: &str) -> bool {
        match self.backend.loaded_models().await {
            Ok(ids) => ids.iter().any(|id| id.contains(model_id)),
            Err(e) => {
                tracing::warn!(error = %e, "could not query loaded models");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{ChatError, ChatRequest};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend fake: scripted `loaded_models` answers, call counting.
    struct FakeBackend {
        /// Each probe pops the front answer; the last answer repeats.
        model_lists: Mutex<Vec<Vec<String>>>,
        probes: AtomicU32,
    }

    impl FakeBackend {
        fn new(model_lists: Vec<Vec<String>>) -> Self {
            Self {
                model_lists: Mutex::new(model_lists),
                probes: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl InferenceBackend for FakeBackend {
        async fn chat(&self, _request: &ChatRequest) -> Result<String, ChatError> {
            panic!("gate must not issue chat requests");
        }

        async fn loaded_models(&self) -> Result<Vec<String>, ChatError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let mut lists = self.model_lists.lock().unwrap();
            if lists.len() > 1 {
                Ok(lists.remove(0))
            } else {
                Ok(lists.first().cloned().unwrap_or_default())
            }
        }
    }

    struct FakeLoadCommand {
        result: Result<(), String>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LoadCommand for FakeLoadCommand {
        async fn load(&self, _model_id: &str) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    /// Clock whose sleeps advance simulated time instantly.
    struct TestClock {
        base: Instant,
        offset: Mutex<Duration>,
        sleeps: AtomicU32,
    }

    impl TestClock {
        fn new() -> Self {
            Self {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
                sleeps: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Clock for TestClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock().unwrap()
        }

        async fn sleep(&self, duration: Duration) {
            self.sleeps.fetch_add(1, Ordering::SeqCst);
            *self.offset.lock().unwrap() += duration;
        }
    }

    fn gate(
        backend: Arc<FakeBackend>,
        load: Arc<FakeLoadCommand>,
        clock: Arc<TestClock>,
    ) -> ModelGate {
        ModelGate::new(backend, load, clock, Duration::from_millis(500))
    }

    fn ok_command() -> Arc<FakeLoadCommand> {
        Arc::new(FakeLoadCommand {
            result: Ok(()),
            calls: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn off_is_ready_without_contacting_server() {
        let backend = Arc::new(FakeBackend::new(vec![]));
        let clock = Arc::new(TestClock::new());
        let gate = gate(backend.clone(), ok_command(), clock);

        gate.ensure_ready("m1", LoadStrategy::Off, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(backend.probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_model_id_skips_every_strategy() {
        let backend = Arc::new(FakeBackend::new(vec![]));
        let command = ok_command();
        let clock = Arc::new(TestClock::new());
        let gate = gate(backend.clone(), command.clone(), clock);

        for strategy in [LoadStrategy::Jit, LoadStrategy::Cli, LoadStrategy::Off] {
            gate.ensure_ready("", strategy, Duration::from_secs(60))
                .await
                .unwrap();
        }
        assert_eq!(backend.probes.load(Ordering::SeqCst), 0);
        assert_eq!(command.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn jit_resolves_ready_whether_or_not_model_is_listed() {
        let clock = Arc::new(TestClock::new());
        let loaded = Arc::new(FakeBackend::new(vec![vec!["org/m1".into()]]));
        gate(loaded, ok_command(), clock.clone())
            .ensure_ready("m1", LoadStrategy::Jit, Duration::from_secs(60))
            .await
            .unwrap();

        let unloaded = Arc::new(FakeBackend::new(vec![vec![]]));
        gate(unloaded, ok_command(), clock)
            .ensure_ready("m1", LoadStrategy::Jit, Duration::from_secs(60))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cli_skips_load_when_model_already_listed() {
        let backend = Arc::new(FakeBackend::new(vec![vec!["qwen3b-30b-a3b".into()]]));
        let command = ok_command();
        let clock = Arc::new(TestClock::new());
        let gate = gate(backend, command.clone(), clock);

        gate.ensure_ready("qwen3b", LoadStrategy::Cli, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(command.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cli_command_failure_is_immediate_and_never_polls() {
        let backend = Arc::new(FakeBackend::new(vec![vec![]]));
        let command = Arc::new(FakeLoadCommand {
            result: Err("unknown model".into()),
            calls: AtomicU32::new(0),
        });
        let clock = Arc::new(TestClock::new());
        let gate = gate(backend, command, clock.clone());

        let err = gate
            .ensure_ready("m1", LoadStrategy::Cli, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert_eq!(err, LoadFailure::LoadError("unknown model".into()));
        assert_eq!(clock.sleeps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cli_polls_until_model_appears() {
        let backend = Arc::new(FakeBackend::new(vec![
            vec![],
            vec![],
            vec!["m1".into()],
        ]));
        let command = ok_command();
        let clock = Arc::new(TestClock::new());
        let gate = gate(backend.clone(), command.clone(), clock.clone());

        gate.ensure_ready("m1", LoadStrategy::Cli, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(command.calls.load(Ordering::SeqCst), 1);
        // Initial probe plus two polls.
        assert_eq!(backend.probes.load(Ordering::SeqCst), 3);
        assert_eq!(clock.sleeps.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cli_times_out_at_the_deadline() {
        let backend = Arc::new(FakeBackend::new(vec![vec![]]));
        let clock = Arc::new(TestClock::new());
        let gate = gate(backend, ok_command(), clock.clone());

        let err = gate
            .ensure_ready("m1", LoadStrategy::Cli, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err, LoadFailure::Timeout);
        // 2 s budget at 500 ms per poll.
        assert_eq!(clock.sleeps.load(Ordering::SeqCst), 4);
    }
}
