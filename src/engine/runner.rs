// Driftlab Engine — Experiment Runner
//
// The supervisor owns the experiment map and validates every control
// transition synchronously under its lock; each experiment runs on its own
// long-lived tokio worker that drives the episode loop. Within one
// experiment episodes are strictly sequential: memory admission of
// episode N happens-before retrieval of N+1, strategy updates
// happen-before the next selection, and events are emitted in order.
//
// Suspension points are exactly three: the pause/stop check at the top of
// each episode, the gateway await, and the inter-episode tick.

use crate::atoms::config::{CacheConfig, ExperimentConfig, GatewayRole};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::*;
use crate::engine::embedding::{CacheStats, EmbeddingCache, EmbeddingProvider};
use crate::engine::gateway::{
    complete_or_fallback, ChatModel, CompletionOutcome, FALLBACK_COMPLETION,
};
use crate::engine::memory::ExperienceMemory;
use crate::engine::prompt;
use crate::engine::reviewer::{DefenseStatistics, ReviewStats, SafetyReviewer};
use crate::engine::reward::{simulate_outcome, RewardCalculator};
use crate::engine::scenario::generate_issue;
use crate::engine::strategy::{StrategyRecord, StrategyTable};
use log::{error, info, warn};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Capacity of each experiment's event channel. A full channel drops the
/// event (counted) rather than blocking the worker.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ── Shared experiment state ────────────────────────────────────────────────

/// State shared between the supervisor (control + queries) and the worker
/// (episode loop). The worker holds the lock only across single steps.
pub struct ExperimentState {
    pub id: String,
    pub name: String,
    pub status: ExperimentStatus,
    pub config: ExperimentConfig,
    pub current_episode: u64,
    pub statistics: ExperimentStatistics,
    pub strategy_table: StrategyTable,
    /// Full experience log, in episode order. In-memory lifetime only.
    pub experiences: Vec<Experience>,
    pub error: Option<String>,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
}

/// Point-in-time view returned by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub uuid: String,
    pub name: String,
    pub status: ExperimentStatus,
    pub current_episode: u64,
    pub total_episodes: u64,
    pub statistics: ExperimentStatistics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentSummary {
    pub uuid: String,
    pub name: String,
    pub status: ExperimentStatus,
    pub current_episode: u64,
    pub total_episodes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartReceipt {
    pub uuid: String,
    pub status: ExperimentStatus,
}

// ── Event bus ──────────────────────────────────────────────────────────────

struct EventBus {
    experiment_id: String,
    tx: mpsc::Sender<EventEnvelope>,
    seq: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    fn new(experiment_id: String, tx: mpsc::Sender<EventEnvelope>) -> Self {
        EventBus {
            experiment_id,
            tx,
            seq: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn emit(&self, event: ExperimentEvent) {
        let envelope = EventEnvelope {
            experiment_id: self.experiment_id.clone(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            at: chrono::Utc::now().to_rfc3339(),
            event,
        };
        if self.tx.try_send(envelope).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 || dropped % 100 == 0 {
                warn!(
                    "[runner] event channel full for {}, {} dropped so far",
                    self.experiment_id, dropped
                );
            }
        }
    }
}

/// Whether the reply closes the ticket, in any tense ("close", "closing",
/// "closed"). This is the signal the close-ticket bonus keys on.
fn mentions_ticket_close(content: &str) -> bool {
    let lower = content.to_lowercase();
    lower.contains("close") || lower.contains("closing")
}

// ── Gateway-backed embedding provider ──────────────────────────────────────

/// Adapts the chat gateway's embed endpoint to the cache's provider seam.
struct GatewayEmbedder {
    gateway: Arc<dyn ChatModel>,
}

#[async_trait::async_trait]
impl EmbeddingProvider for GatewayEmbedder {
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        self.gateway.embed(text).await
    }
}

// ── Handles ────────────────────────────────────────────────────────────────

struct ExperimentHandle {
    shared: Arc<Mutex<ExperimentState>>,
    memory: Arc<ExperienceMemory>,
    bus: Arc<EventBus>,
    /// Receiver for the event stream; taken at most once per launch.
    events_rx: Option<mpsc::Receiver<EventEnvelope>>,
}

// ── Supervisor ─────────────────────────────────────────────────────────────

/// Owns all in-flight experiments and the process-wide embedding cache and
/// defense statistics. All control operations validate the state machine
/// synchronously and return structured errors without side effects.
pub struct Supervisor {
    experiments: Mutex<HashMap<String, Arc<Mutex<ExperimentHandle>>>>,
    gateway: Arc<dyn ChatModel>,
    cache: Arc<EmbeddingCache>,
    review_stats: Arc<ReviewStats>,
}

impl Supervisor {
    pub fn new(gateway: Arc<dyn ChatModel>, cache_config: CacheConfig) -> Self {
        let embedder = Arc::new(GatewayEmbedder {
            gateway: Arc::clone(&gateway),
        });
        Supervisor {
            experiments: Mutex::new(HashMap::new()),
            gateway,
            cache: Arc::new(EmbeddingCache::new(
                embedder,
                cache_config.enabled,
                cache_config.max_entries,
            )),
            review_stats: ReviewStats::new(),
        }
    }

    /// Create an experiment and begin running it.
    pub fn start(&self, name: &str, mut config: ExperimentConfig) -> EngineResult<StartReceipt> {
        config.validate()?;

        let uuid = uuid::Uuid::new_v4().to_string();
        // Resolve the seed once at creation so reset + launch replays the
        // exact same episode sequence.
        if config.seed.is_none() {
            let mut hasher = DefaultHasher::new();
            uuid.hash(&mut hasher);
            config.seed = Some(hasher.finish());
        }

        let memory = Arc::new(ExperienceMemory::new(
            Arc::clone(&self.cache),
            config.memory.clone(),
        ));
        let epsilon = config.epsilon;
        let state = ExperimentState {
            id: uuid.clone(),
            name: name.to_string(),
            status: ExperimentStatus::Created,
            config,
            current_episode: 0,
            statistics: ExperimentStatistics::default(),
            strategy_table: StrategyTable::new(epsilon),
            experiences: Vec::new(),
            error: None,
            started_at: None,
            ended_at: None,
        };

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle = ExperimentHandle {
            shared: Arc::new(Mutex::new(state)),
            memory,
            bus: Arc::new(EventBus::new(uuid.clone(), tx)),
            events_rx: Some(rx),
        };

        self.experiments
            .lock()
            .insert(uuid.clone(), Arc::new(Mutex::new(handle)));

        info!("[runner] experiment '{}' created ({})", name, uuid);
        self.launch(&uuid)?;
        Ok(StartReceipt {
            uuid,
            status: ExperimentStatus::Running,
        })
    }

    /// Transition a `created` experiment to `running` and spawn its worker.
    /// Used by `start` and after `reset` for deterministic replays.
    pub fn launch(&self, uuid: &str) -> EngineResult<()> {
        let handle = self.handle(uuid)?;
        let (shared, memory, bus) = {
            let guard = handle.lock();
            let mut state = guard.shared.lock();
            if !state.status.can_start() {
                return Err(EngineError::state("start", state.status));
            }
            state.status = ExperimentStatus::Running;
            state.started_at = Some(chrono::Utc::now().to_rfc3339());
            guard.bus.emit(ExperimentEvent::StatusChanged {
                from: ExperimentStatus::Created,
                to: ExperimentStatus::Running,
            });
            (
                Arc::clone(&guard.shared),
                Arc::clone(&guard.memory),
                Arc::clone(&guard.bus),
            )
        };

        let gateway = Arc::clone(&self.gateway);
        let review_stats = Arc::clone(&self.review_stats);
        let monitor_shared = Arc::clone(&shared);
        let monitor_bus = Arc::clone(&bus);
        let worker = tokio::spawn(async move {
            run_worker(shared, memory, bus, gateway, review_stats).await;
        });
        // A panicked worker must not leave the experiment stuck in
        // `running`; mark it failed and preserve its state for inspection.
        tokio::spawn(async move {
            if let Err(join_err) = worker.await {
                let from = {
                    let mut state = monitor_shared.lock();
                    if state.status.is_terminal() {
                        return;
                    }
                    let from = state.status;
                    state.status = ExperimentStatus::Failed;
                    state.error = Some(join_err.to_string());
                    state.ended_at = Some(chrono::Utc::now().to_rfc3339());
                    from
                };
                monitor_bus.emit(ExperimentEvent::Error {
                    message: join_err.to_string(),
                });
                monitor_bus.emit(ExperimentEvent::StatusChanged {
                    from,
                    to: ExperimentStatus::Failed,
                });
            }
        });
        Ok(())
    }

    pub fn pause(&self, uuid: &str) -> EngineResult<()> {
        self.transition(uuid, "pause", ExperimentStatus::Paused, |s| s.can_pause())
    }

    pub fn resume(&self, uuid: &str) -> EngineResult<()> {
        self.transition(uuid, "resume", ExperimentStatus::Running, |s| s.can_resume())
    }

    pub fn stop(&self, uuid: &str) -> EngineResult<()> {
        let handle = self.handle(uuid)?;
        let guard = handle.lock();
        let mut state = guard.shared.lock();
        if !state.status.can_stop() {
            return Err(EngineError::state("stop", state.status));
        }
        let from = state.status;
        state.status = ExperimentStatus::Stopped;
        state.ended_at = Some(chrono::Utc::now().to_rfc3339());
        guard.bus.emit(ExperimentEvent::StatusChanged {
            from,
            to: ExperimentStatus::Stopped,
        });
        info!("[runner] experiment {} stopped", uuid);
        Ok(())
    }

    /// Return a non-running experiment to `created`, clearing statistics,
    /// the experience log, per-experiment memory, and the strategy table.
    pub fn reset(&self, uuid: &str) -> EngineResult<()> {
        let handle = self.handle(uuid)?;
        let mut guard = handle.lock();
        {
            let mut state = guard.shared.lock();
            if !state.status.can_reset() {
                return Err(EngineError::state("reset", state.status));
            }
            let from = state.status;
            state.status = ExperimentStatus::Created;
            state.current_episode = 0;
            state.statistics = ExperimentStatistics::default();
            state.strategy_table = StrategyTable::new(state.config.epsilon);
            state.experiences.clear();
            state.error = None;
            state.started_at = None;
            state.ended_at = None;
            guard.bus.emit(ExperimentEvent::StatusChanged {
                from,
                to: ExperimentStatus::Created,
            });
        }
        guard.memory.clear();

        // Fresh event channel; sequence numbers restart with the run.
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        guard.bus = Arc::new(EventBus::new(uuid.to_string(), tx));
        guard.events_rx = Some(rx);

        info!("[runner] experiment {} reset", uuid);
        Ok(())
    }

    pub fn status(&self, uuid: &str) -> EngineResult<StatusSnapshot> {
        let handle = self.handle(uuid)?;
        let guard = handle.lock();
        let state = guard.shared.lock();
        Ok(StatusSnapshot {
            uuid: state.id.clone(),
            name: state.name.clone(),
            status: state.status,
            current_episode: state.current_episode,
            total_episodes: state.config.total_episodes,
            statistics: state.statistics.clone(),
            error: state.error.clone(),
        })
    }

    pub fn metrics(&self, uuid: &str) -> EngineResult<ExperimentStatistics> {
        Ok(self.status(uuid)?.statistics)
    }

    pub fn strategy_records(&self, uuid: &str) -> EngineResult<Vec<StrategyRecord>> {
        let handle = self.handle(uuid)?;
        let guard = handle.lock();
        let state = guard.shared.lock();
        Ok(state.strategy_table.records().to_vec())
    }

    pub fn experiences(&self, uuid: &str) -> EngineResult<Vec<Experience>> {
        let handle = self.handle(uuid)?;
        let guard = handle.lock();
        let state = guard.shared.lock();
        Ok(state.experiences.clone())
    }

    pub fn config(&self, uuid: &str) -> EngineResult<ExperimentConfig> {
        let handle = self.handle(uuid)?;
        let guard = handle.lock();
        let state = guard.shared.lock();
        Ok(state.config.clone())
    }

    pub fn list(&self) -> Vec<ExperimentSummary> {
        self.experiments
            .lock()
            .values()
            .map(|h| {
                let guard = h.lock();
                let state = guard.shared.lock();
                ExperimentSummary {
                    uuid: state.id.clone(),
                    name: state.name.clone(),
                    status: state.status,
                    current_episode: state.current_episode,
                    total_episodes: state.config.total_episodes,
                }
            })
            .collect()
    }

    /// Take the event stream for an experiment. Yields `None` after the
    /// stream was already taken for the current run.
    pub fn events(&self, uuid: &str) -> EngineResult<Option<mpsc::Receiver<EventEnvelope>>> {
        let handle = self.handle(uuid)?;
        let mut guard = handle.lock();
        Ok(guard.events_rx.take())
    }

    pub fn defense_statistics(&self) -> DefenseStatistics {
        self.review_stats.snapshot()
    }

    pub fn defense_statistics_reset(&self) {
        self.review_stats.reset();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Poll until the experiment reaches a terminal status.
    pub async fn await_terminal(&self, uuid: &str, timeout: Duration) -> EngineResult<StatusSnapshot> {
        let deadline = Instant::now() + timeout;
        loop {
            let snapshot = self.status(uuid)?;
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Internal(format!(
                    "experiment {uuid} still {} after {:?}",
                    snapshot.status, timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn handle(&self, uuid: &str) -> EngineResult<Arc<Mutex<ExperimentHandle>>> {
        self.experiments
            .lock()
            .get(uuid)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(uuid.to_string()))
    }

    fn transition(
        &self,
        uuid: &str,
        action: &str,
        to: ExperimentStatus,
        allowed: impl Fn(&ExperimentStatus) -> bool,
    ) -> EngineResult<()> {
        let handle = self.handle(uuid)?;
        let guard = handle.lock();
        let mut state = guard.shared.lock();
        if !allowed(&state.status) {
            return Err(EngineError::state(action, state.status));
        }
        let from = state.status;
        state.status = to;
        guard.bus.emit(ExperimentEvent::StatusChanged { from, to });
        info!("[runner] experiment {} {} ({} → {})", uuid, action, from, to);
        Ok(())
    }
}

// ── Worker ─────────────────────────────────────────────────────────────────

async fn run_worker(
    shared: Arc<Mutex<ExperimentState>>,
    memory: Arc<ExperienceMemory>,
    bus: Arc<EventBus>,
    gateway: Arc<dyn ChatModel>,
    review_stats: Arc<ReviewStats>,
) {
    let (config, uuid) = {
        let state = shared.lock();
        (state.config.clone(), state.id.clone())
    };

    let seed = config.seed.unwrap_or(0);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let calculator = RewardCalculator::new(config.weights);
    let reviewer = if config.enable_defense {
        let judge = if config.defense.judge_enabled {
            Some(Arc::clone(&gateway))
        } else {
            None
        };
        Some(SafetyReviewer::new(
            judge,
            config.defense.clone(),
            review_stats,
        ))
    } else {
        None
    };

    info!(
        "[runner] worker up for {} (episodes={}, seed={})",
        uuid, config.total_episodes, seed
    );

    loop {
        // Suspension point 1: pause / cancellation check.
        let status = shared.lock().status;
        match status {
            ExperimentStatus::Paused => {
                tokio::time::sleep(Duration::from_millis(config.pause_poll_ms)).await;
                continue;
            }
            ExperimentStatus::Running => {}
            _ => {
                info!("[runner] worker for {} exiting ({})", uuid, status);
                return;
            }
        }

        let episode = {
            let state = shared.lock();
            if state.current_episode >= config.total_episodes {
                break;
            }
            state.current_episode + 1
        };

        match run_episode(
            episode, &config, &shared, &memory, &bus, gateway.as_ref(), &calculator,
            reviewer.as_ref(), &mut rng,
        )
        .await
        {
            Ok(()) => {
                let mut state = shared.lock();
                // A stop during the episode wins; the step already ran to
                // completion, the loop exits at the next check.
                if state.status == ExperimentStatus::Running
                    || state.status == ExperimentStatus::Paused
                {
                    state.current_episode = episode;
                }
            }
            Err(e) => {
                error!("[runner] experiment {} failed at episode {}: {}", uuid, episode, e);
                let mut state = shared.lock();
                let from = state.status;
                state.status = ExperimentStatus::Failed;
                state.error = Some(e.to_string());
                state.ended_at = Some(chrono::Utc::now().to_rfc3339());
                drop(state);
                bus.emit(ExperimentEvent::Error {
                    message: e.to_string(),
                });
                bus.emit(ExperimentEvent::StatusChanged {
                    from,
                    to: ExperimentStatus::Failed,
                });
                return;
            }
        }

        // Suspension point 3: inter-episode tick.
        if config.episode_tick_ms > 0 {
            tokio::time::sleep(Duration::from_millis(config.episode_tick_ms)).await;
        }
    }

    // All episodes done. Complete, unless a control transition won.
    let completed = {
        let mut state = shared.lock();
        if state.status == ExperimentStatus::Running {
            state.status = ExperimentStatus::Completed;
            state.ended_at = Some(chrono::Utc::now().to_rfc3339());
            true
        } else {
            false
        }
    };
    if completed {
        bus.emit(ExperimentEvent::StatusChanged {
            from: ExperimentStatus::Running,
            to: ExperimentStatus::Completed,
        });
        bus.emit(ExperimentEvent::ExperimentCompleted {
            total_episodes: config.total_episodes,
        });
        info!("[runner] experiment {} completed", uuid);
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_episode(
    episode: u64,
    config: &ExperimentConfig,
    shared: &Arc<Mutex<ExperimentState>>,
    memory: &Arc<ExperienceMemory>,
    bus: &Arc<EventBus>,
    gateway: &dyn ChatModel,
    calculator: &RewardCalculator,
    reviewer: Option<&SafetyReviewer>,
    rng: &mut ChaCha8Rng,
) -> EngineResult<()> {
    // 2. Synthesize the customer issue.
    let issue = generate_issue(rng, episode);

    // 3. Retrieve similar past experience.
    let memories = if config.enable_memory {
        memory
            .retrieve_similar(&issue.content, config.memory.top_k)
            .await
    } else {
        Vec::new()
    };

    // 4. Select a strategy before the call; this tag is authoritative.
    let strategy = {
        let state = shared.lock();
        state.strategy_table.select(rng)
    };

    // 5. Build the prompt and call the gateway (suspension point 2).
    let system_prompt = prompt::compose_system_prompt(strategy);
    let user_prompt = prompt::compose_user_prompt(&issue, &memories);
    let call_started = Instant::now();
    let outcome = complete_or_fallback(gateway, GatewayRole::Agent, &system_prompt, &user_prompt).await;
    let response_time_secs = call_started.elapsed().as_secs_f64();

    let (content, strategy, fallback_reason) = match outcome {
        CompletionOutcome::Ok(text) => (text, strategy, None),
        // Fallback always presents as the polite canned apology.
        CompletionOutcome::Fallback(reason) => (
            FALLBACK_COMPLETION.to_string(),
            StrategyKind::Polite,
            Some(reason),
        ),
    };

    let mut metadata = HashMap::new();
    if let Some(reason) = &fallback_reason {
        metadata.insert(META_GATEWAY_FALLBACK.to_string(), reason.clone());
    }

    let mut response = AgentResponse {
        id: uuid::Uuid::new_v4().to_string(),
        issue_id: issue.id.clone(),
        content,
        strategy,
        ticket_closed: false,
        response_time_secs,
        metadata,
        rewritten_from: None,
        created_at: chrono::Utc::now().to_rfc3339(),
    };
    response.ticket_closed = mentions_ticket_close(&response.content);

    // 6. Defense review, or observer-only rule detection when defense is
    //    off. The distinction is the core of the experiment: the observer
    //    sees every violation for the statistics, but the LEARNER (reward
    //    penalty, strategy-table violation counts) only receives violation
    //    feedback through the in-line reviewer. With defense disabled the
    //    reward is exactly the mis-specified signal that elicits drift.
    let mut observed_violation;
    let mut observed_tags;
    let mut learner_violation = false;
    let mut blocked = false;

    if let Some(reviewer) = reviewer {
        let review = reviewer.review(&issue, &response).await;
        observed_violation = !review.approved;
        observed_tags = review.violation_tags.clone();
        learner_violation = !review.approved;

        match review.action {
            ReviewAction::Accept => {}
            ReviewAction::Warn => {
                bus.emit(ExperimentEvent::DefenseAction {
                    episode,
                    action: review.action,
                    escalated: false,
                });
            }
            ReviewAction::Rewrite => {
                let rewrite = review
                    .suggested_rewrite
                    .clone()
                    .unwrap_or_else(|| FALLBACK_COMPLETION.to_string());
                response = AgentResponse {
                    id: uuid::Uuid::new_v4().to_string(),
                    content: rewrite,
                    ticket_closed: false,
                    rewritten_from: Some(review.id.clone()),
                    created_at: chrono::Utc::now().to_rfc3339(),
                    ..response
                };
                bus.emit(ExperimentEvent::DefenseAction {
                    episode,
                    action: review.action,
                    escalated: false,
                });
            }
            ReviewAction::Block | ReviewAction::Escalate => {
                blocked = true;
                // The block prevents execution: the close never happens.
                response.ticket_closed = false;
                bus.emit(ExperimentEvent::DefenseAction {
                    episode,
                    action: review.action,
                    escalated: review.action == ReviewAction::Escalate,
                });
            }
        }
    } else {
        let (violation, tags) = crate::engine::reviewer::detect(&issue, &response);
        observed_violation = violation;
        observed_tags = tags;
    }

    // A degraded gateway reply is never the agent's own violation.
    if fallback_reason.is_some() {
        observed_violation = false;
        observed_tags = Vec::new();
        learner_violation = false;
    }

    if observed_violation {
        bus.emit(ExperimentEvent::ViolationDetected {
            episode,
            tags: observed_tags.clone(),
        });
    }

    // 7. Simulate the delayed outcome, skipped for blocked decisions and
    //    for fallback episodes (no real reply reached the customer). The
    //    customer reacts to what the agent actually did, so the Bernoulli
    //    draws condition on the observed violation.
    let outcome = if blocked || fallback_reason.is_some() {
        None
    } else {
        Some(simulate_outcome(rng, strategy, observed_violation))
    };

    // 8. Score the decision. The penalty lands only on reviewer-established
    //    violations; without defense the violation component is silent.
    let reward = calculator.calculate(&response, outcome.as_ref(), learner_violation);

    let experience = Experience {
        id: uuid::Uuid::new_v4().to_string(),
        episode,
        issue,
        response,
        outcome,
        reward,
        strategy,
        is_violation: observed_violation,
        violation_tags: observed_tags,
        blocked,
        created_at: chrono::Utc::now().to_rfc3339(),
    };

    // 9–11. Learn and record. Skipped entirely if the experiment was
    // cancelled while the gateway call was in flight.
    {
        let mut state = shared.lock();
        if state.status != ExperimentStatus::Running && state.status != ExperimentStatus::Paused {
            warn!("[runner] episode {} discarded after cancellation", episode);
            return Ok(());
        }
        if config.enable_evolution {
            // Table success is operational: the decision was delivered.
            // Quality differences reach the table through the reward term.
            let learner_success =
                !blocked && fallback_reason.is_none() && !learner_violation;
            state.strategy_table.record_outcome(
                strategy,
                experience.reward.total,
                learner_success,
                learner_violation,
            );
        }
        state.statistics.record(&experience);
        state.experiences.push(experience.clone());
    }

    if config.enable_memory {
        memory.admit(experience.clone()).await;
    }

    // 12. Publish progress.
    bus.emit(ExperimentEvent::EpisodeCompleted {
        episode,
        reward: experience.reward.total,
        strategy,
        is_violation: experience.is_violation,
    });

    Ok(())
}

// Episode numbers are 1-based; `current_episode` advances only after the
// episode's experience is recorded, so it is monotonically non-decreasing
// for observers while the experiment is running or paused.
