// tests/orchestrator_test.rs — End-to-end cycle scenarios with scripted collaborators

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use ouro::core::orchestrator::{CycleOrchestrator, CycleOutcome};
use ouro::core::resume::HumanFeedback;
use ouro::core::types::{ProgressEvent, RandomSource};
use ouro::infra::config::Config;
use ouro::infra::errors::CycleError;
use ouro::provider::{ApiClient, ChatRequest, LlmReply};
use ouro::storage::{MemoryStorage, Storage};
use ouro::tools::{DynamicTool, ToolDeclaration, ToolRunner};
use ouro::ui::{HitlMode, LogLevel, UiSink};

// ─── Scripted collaborators ────────────────────────────────────────────────

enum Step {
    Reply(String),
    Fail(CycleError),
    /// Block until the cancellation token fires, then report the abort.
    Hang,
}

struct ScriptedApi {
    steps: Mutex<VecDeque<Step>>,
}

impl ScriptedApi {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
        })
    }
}

#[async_trait]
impl ApiClient for ScriptedApi {
    async fn call(
        &self,
        _request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<LlmReply, CycleError> {
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Reply(content)) => Ok(LlmReply::Text {
                content,
                token_count: 100,
            }),
            Some(Step::Fail(e)) => Err(e),
            Some(Step::Hang) => {
                cancel.cancelled().await;
                Err(CycleError::Aborted)
            }
            None => Err(CycleError::Api {
                message: "script exhausted".into(),
                retriable: false,
            }),
        }
    }
}

struct EchoTools;

#[async_trait]
impl ToolRunner for EchoTools {
    async fn run_tool(
        &self,
        _name: &str,
        args: &serde_json::Value,
        _static_tools: &[ToolDeclaration],
        _dynamic_tools: &[DynamicTool],
    ) -> Result<serde_json::Value, CycleError> {
        Ok(json!({"echo": args}))
    }
}

/// Records every intervention/sandbox request so tests can assert on them.
#[derive(Default)]
struct RecordingUi {
    interventions: Mutex<Vec<(HitlMode, String)>>,
    sandboxes: Mutex<Vec<String>>,
    sandbox_pending: AtomicBool,
    intervention_open: AtomicBool,
}

impl UiSink for RecordingUi {
    fn update_status(&self, _message: &str, _busy: bool) {}
    fn log_timeline(&self, _cycle: u64, _message: &str, _level: LogLevel) {}
    fn notify(&self, _message: &str, _level: LogLevel) {}
    fn update_metrics(&self, _state: &ouro::core::types::CycleState) {}

    fn show_intervention(&self, mode: HitlMode, reason: &str, _artifact_hint: Option<&str>) {
        self.interventions
            .lock()
            .unwrap()
            .push((mode, reason.to_string()));
        self.intervention_open.store(true, Ordering::SeqCst);
    }

    fn hide_intervention(&self) {
        self.intervention_open.store(false, Ordering::SeqCst);
    }

    fn show_sandbox(&self, staged_source: &str) {
        self.sandboxes.lock().unwrap().push(staged_source.to_string());
        self.sandbox_pending.store(true, Ordering::SeqCst);
    }

    fn is_sandbox_pending(&self) -> bool {
        self.sandbox_pending.load(Ordering::SeqCst)
    }

    fn is_intervention_hidden(&self) -> bool {
        !self.intervention_open.load(Ordering::SeqCst)
    }
}

/// Replays a fixed random sequence, then stays above every threshold.
struct ScriptedRandom(VecDeque<f64>);

impl ScriptedRandom {
    fn new(values: &[f64]) -> Box<Self> {
        Box::new(Self(values.iter().copied().collect()))
    }
}

impl RandomSource for ScriptedRandom {
    fn next_f64(&mut self) -> f64 {
        self.0.pop_front().unwrap_or(1.0 - f64::EPSILON)
    }
}

// ─── Harness ───────────────────────────────────────────────────────────────

struct Harness {
    orch: CycleOrchestrator,
    ui: Arc<RecordingUi>,
    storage: Arc<MemoryStorage>,
    events: tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>,
}

fn config() -> Config {
    let mut config = Config::default();
    config.api.key = "test-key-0123456789".into();
    // Deterministic unless a test opts back in.
    config.cycle.llm_critique_prob = 0;
    config.cycle.human_review_prob = 0;
    config
}

fn harness(config: Config, steps: Vec<Step>, rng: Box<dyn RandomSource>) -> Harness {
    let ui = Arc::new(RecordingUi::default());
    let storage = Arc::new(MemoryStorage::new());
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let orch = CycleOrchestrator::new(
        config,
        ScriptedApi::new(steps),
        Arc::clone(&storage) as Arc<dyn Storage>,
        Arc::new(EchoTools),
        Vec::new(),
        Arc::clone(&ui) as Arc<dyn UiSink>,
        rng,
        tx,
    )
    .unwrap();
    Harness {
        orch,
        ui,
        storage,
        events: rx,
    }
}

fn proposal(confidence: f64) -> String {
    json!({
        "proposed_changes_description": "adjust layout",
        "agent_confidence_score": confidence,
        "new_artifacts": [
            {"id": "target.style", "type": "CSS", "content": "body { margin: 0 }"}
        ]
    })
    .to_string()
}

// ─── Scenarios ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn retries_exhausted_escalates_without_advancing() {
    let steps = vec![
        Step::Fail(CycleError::Parse("bad json".into())),
        Step::Fail(CycleError::Parse("bad json again".into())),
    ];
    let mut h = harness(config(), steps, ScriptedRandom::new(&[]));

    let outcome = h.orch.execute_cycle(Some("make it blue"), "System").await.unwrap();

    match outcome {
        CycleOutcome::AwaitingHuman { reason } => {
            assert!(reason.contains("Cycle failed after 2 attempts"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(h.orch.state().total_cycles, 0);
    assert_eq!(h.orch.state().fail_count, 1);
    assert!(!h.orch.is_running());
    // The intervention surface opened in prompt mode.
    let interventions = h.ui.interventions.lock().unwrap();
    assert_eq!(interventions.len(), 1);
    assert_eq!(interventions[0].0, HitlMode::Prompt);
}

#[tokio::test]
async fn parse_failure_then_success_completes_cycle() {
    let steps = vec![
        Step::Fail(CycleError::Parse("truncated".into())),
        Step::Reply(proposal(0.9)),
    ];
    let mut h = harness(config(), steps, ScriptedRandom::new(&[]));

    let outcome = h.orch.execute_cycle(Some("make it blue"), "System").await.unwrap();

    match outcome {
        CycleOutcome::Completed {
            next_cycle,
            apply_source,
        } => {
            assert_eq!(next_cycle, 1);
            assert_eq!(apply_source, "Skipped");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(h.orch.state().total_cycles, 1);
    assert_eq!(h.orch.state().agent_iterations, 1);
    assert_eq!(h.orch.state().fail_count, 0);
    assert_eq!(
        h.storage.get_artifact("target.style", 1).unwrap().as_deref(),
        Some("body { margin: 0 }")
    );
    // Checkpoint reflects the completed cycle.
    assert_eq!(h.storage.load_state().unwrap().unwrap().total_cycles, 1);

    let mut saw_completed = false;
    while let Ok(event) = h.events.try_recv() {
        if let ProgressEvent::Completed { cycle } = event {
            saw_completed = true;
            assert_eq!(cycle, 1);
        }
    }
    assert!(saw_completed);
}

#[tokio::test]
async fn create_colliding_id_holds_cycle_and_escalates() {
    // Cycle 1 creates target.style; cycle 2 proposes the same id again.
    let steps = vec![Step::Reply(proposal(0.9)), Step::Reply(proposal(0.9))];
    let mut h = harness(config(), steps, ScriptedRandom::new(&[]));

    h.orch.execute_cycle(Some("make it blue"), "System").await.unwrap();
    let outcome = h.orch.execute_cycle(None, "System").await.unwrap();

    match outcome {
        CycleOutcome::AwaitingHuman { reason } => {
            assert!(reason.contains("ID exists"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(h.orch.state().total_cycles, 1);
    assert_eq!(h.orch.state().fail_count, 1);
}

#[tokio::test]
async fn full_source_proposal_parks_in_sandbox() {
    let reply = json!({
        "proposed_changes_description": "rewrite everything",
        "agent_confidence_score": 0.95,
        "full_source": "<html>v2</html>"
    })
    .to_string();
    let mut h = harness(config(), vec![Step::Reply(reply)], ScriptedRandom::new(&[]));

    let outcome = h.orch.execute_cycle(Some("evolve"), "System").await.unwrap();

    assert!(matches!(outcome, CycleOutcome::AwaitingSandbox));
    assert_eq!(h.orch.state().total_cycles, 0);
    assert_eq!(
        h.orch.state().last_generated_full_source.as_deref(),
        Some("<html>v2</html>")
    );
    assert_eq!(h.ui.sandboxes.lock().unwrap().as_slice(), ["<html>v2</html>"]);
    assert!(h.ui.is_sandbox_pending());
    assert!(h
        .orch
        .state()
        .last_critique_type
        .contains("Sandbox Pending"));
}

#[tokio::test]
async fn sandbox_pending_blocks_next_cycle() {
    let reply = json!({
        "proposed_changes_description": "rewrite",
        "agent_confidence_score": 0.95,
        "full_source": "<html>v2</html>"
    })
    .to_string();
    let mut h = harness(config(), vec![Step::Reply(reply)], ScriptedRandom::new(&[]));

    h.orch.execute_cycle(Some("evolve"), "System").await.unwrap();
    let err = h.orch.execute_cycle(None, "System").await.unwrap_err();
    assert!(matches!(err, CycleError::FatalConfig(_)));
    assert!(format!("{}", err).contains("Sandbox"));
}

#[tokio::test]
async fn auto_pause_fires_on_cycle_multiple() {
    let mut cfg = config();
    cfg.cycle.pause_after_cycles = 5;
    let mut h = harness(cfg, vec![Step::Reply(proposal(0.99))], ScriptedRandom::new(&[]));

    // Park the counter at the pause multiple, as if five cycles already ran.
    h.orch
        .proceed_after_human_intervention(&HumanFeedback::Prompt("warmup".into()), false)
        .unwrap();
    for _ in 0..4 {
        h.orch
            .proceed_after_human_intervention(&HumanFeedback::SandboxDiscarded, false)
            .unwrap();
    }
    assert_eq!(h.orch.state().total_cycles, 5);

    let outcome = h.orch.execute_cycle(Some("goal"), "System").await.unwrap();
    match outcome {
        CycleOutcome::AwaitingHuman { reason } => assert!(reason.contains("Auto Pause")),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(h.orch.state().total_cycles, 5);
}

#[tokio::test]
async fn low_confidence_escalates() {
    let mut h = harness(
        config(),
        vec![Step::Reply(proposal(0.4))],
        ScriptedRandom::new(&[]),
    );

    let outcome = h.orch.execute_cycle(Some("goal"), "System").await.unwrap();
    match outcome {
        CycleOutcome::AwaitingHuman { reason } => assert!(reason.contains("Low Confidence")),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(h.orch.state().last_critique_type, "Human (Low Confidence (0.40 < 0.75))");
}

#[tokio::test]
async fn random_review_uses_code_edit_surface() {
    let mut cfg = config();
    cfg.cycle.human_review_prob = 50;
    // First roll 0.2 < 0.5 triggers the random review.
    let mut h = harness(
        cfg,
        vec![Step::Reply(proposal(0.9))],
        ScriptedRandom::new(&[0.2]),
    );

    let outcome = h.orch.execute_cycle(Some("goal"), "System").await.unwrap();
    assert!(matches!(outcome, CycleOutcome::AwaitingHuman { .. }));
    let interventions = h.ui.interventions.lock().unwrap();
    assert_eq!(interventions[0].0, HitlMode::CodeEdit);
    assert!(interventions[0].1.contains("Random Review"));
}

#[tokio::test]
async fn auto_critique_failure_forces_human() {
    let mut cfg = config();
    cfg.cycle.llm_critique_prob = 100;
    let steps = vec![
        Step::Reply(proposal(0.9)),
        Step::Reply(
            json!({"critique_passed": false, "critique_report": "regression in layout"})
                .to_string(),
        ),
    ];
    let mut h = harness(cfg, steps, ScriptedRandom::new(&[0.9, 0.1]));

    let outcome = h.orch.execute_cycle(Some("goal"), "System").await.unwrap();
    match outcome {
        CycleOutcome::AwaitingHuman { reason } => {
            assert!(reason.contains("Auto Critique Failed"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(h.orch.state().fail_count, 1);
    assert_eq!(h.orch.state().total_cycles, 0);
    assert_eq!(h.orch.state().last_critique_type, "Automated (Fail)");
}

#[tokio::test]
async fn auto_critique_pass_applies() {
    let mut cfg = config();
    cfg.cycle.llm_critique_prob = 100;
    let steps = vec![
        Step::Reply(proposal(0.9)),
        Step::Reply(json!({"critique_passed": true, "critique_report": "fine"}).to_string()),
    ];
    let mut h = harness(cfg, steps, ScriptedRandom::new(&[0.9, 0.1]));

    let outcome = h.orch.execute_cycle(Some("goal"), "System").await.unwrap();
    match outcome {
        CycleOutcome::Completed { apply_source, .. } => {
            assert_eq!(apply_source, "AutoCrit Pass");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(h.orch.state().total_cycles, 1);
}

#[tokio::test]
async fn abort_mid_iteration_returns_to_idle() {
    let mut h = harness(config(), vec![Step::Hang], ScriptedRandom::new(&[]));
    let handle = h.orch.abort_handle();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
    });

    let outcome = h.orch.execute_cycle(Some("goal"), "System").await.unwrap();

    assert!(matches!(outcome, CycleOutcome::Aborted));
    assert!(!h.orch.is_running());
    assert_eq!(h.orch.state().total_cycles, 0);
    assert_eq!(h.orch.state().fail_count, 0);
    // No intervention opened: an abort is not a failure.
    assert!(h.ui.interventions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn abort_during_retry_backoff_cancels_promptly() {
    let steps = vec![Step::Fail(CycleError::Parse("bad".into())), Step::Hang];
    let mut h = harness(config(), steps, ScriptedRandom::new(&[]));
    let handle = h.orch.abort_handle();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();
    });

    let started = std::time::Instant::now();
    let outcome = h.orch.execute_cycle(Some("goal"), "System").await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Aborted));
    // Cancelled inside the 1s backoff, well before it elapsed.
    assert!(started.elapsed() < Duration::from_millis(900));
}

#[tokio::test]
async fn code_edit_resume_advances_artifact_and_cycle() {
    let mut h = harness(config(), vec![], ScriptedRandom::new(&[]));

    // Pretend seven cycles happened before the pause.
    for _ in 0..7 {
        h.orch
            .proceed_after_human_intervention(&HumanFeedback::SandboxDiscarded, false)
            .unwrap();
    }
    assert_eq!(h.orch.state().total_cycles, 7);

    h.orch
        .proceed_after_human_intervention(
            &HumanFeedback::CodeEdit {
                artifact_id: "x".into(),
                success: true,
                content_changed: true,
                validated_content: "Y".into(),
                error: None,
            },
            false,
        )
        .unwrap();

    assert_eq!(h.storage.get_artifact("x", 8).unwrap().as_deref(), Some("Y"));
    assert_eq!(h.orch.state().artifact_metadata["x"].latest_cycle, 8);
    assert_eq!(h.orch.state().total_cycles, 8);
    assert!(h.ui.is_intervention_hidden());
}

#[tokio::test]
async fn goal_refinement_appends_on_later_cycles() {
    let steps = vec![Step::Reply(proposal(0.9)), Step::Reply(
        json!({
            "proposed_changes_description": "noop",
            "agent_confidence_score": 0.9
        })
        .to_string(),
    )];
    let mut h = harness(config(), steps, ScriptedRandom::new(&[]));

    h.orch.execute_cycle(Some("make it blue"), "System").await.unwrap();
    h.orch.execute_cycle(Some("darker"), "User").await.unwrap();

    let goal = h.orch.state().goal.as_ref().unwrap();
    assert_eq!(goal.seed, "make it blue");
    assert!(goal.cumulative.contains("[Cycle 1 Refinement (User)]: darker"));
    assert_eq!(goal.latest_type, "User");
}

#[tokio::test]
async fn summarize_context_compacts_goal() {
    let steps = vec![Step::Reply(json!({"summary": "five cycles of styling"}).to_string())];
    let mut h = harness(config(), steps, ScriptedRandom::new(&[]));

    h.orch
        .proceed_after_human_intervention(&HumanFeedback::Prompt("seed goal".into()), false)
        .unwrap();
    h.orch.summarize_context().await.unwrap();

    assert_eq!(h.orch.state().total_cycles, 2);
    assert_eq!(
        h.storage
            .get_artifact("meta.summary_context", 2)
            .unwrap()
            .as_deref(),
        Some("five cycles of styling")
    );
    assert_eq!(h.orch.state().last_critique_type, "Context Summary");
}

#[tokio::test]
async fn orchestrator_resumes_from_checkpoint() {
    let steps = vec![Step::Reply(proposal(0.9))];
    let storage = Arc::new(MemoryStorage::new());
    let ui = Arc::new(RecordingUi::default());
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

    let mut orch = CycleOrchestrator::new(
        config(),
        ScriptedApi::new(steps),
        Arc::clone(&storage) as Arc<dyn Storage>,
        Arc::new(EchoTools),
        Vec::new(),
        Arc::clone(&ui) as Arc<dyn UiSink>,
        ScriptedRandom::new(&[]),
        tx,
    )
    .unwrap();
    orch.execute_cycle(Some("goal"), "System").await.unwrap();
    drop(orch);

    // A new orchestrator over the same storage picks up where we left off.
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let rebuilt = CycleOrchestrator::new(
        config(),
        ScriptedApi::new(vec![]),
        Arc::clone(&storage) as Arc<dyn Storage>,
        Arc::new(EchoTools),
        Vec::new(),
        ui as Arc<dyn UiSink>,
        ScriptedRandom::new(&[]),
        tx,
    )
    .unwrap();
    assert_eq!(rebuilt.state().total_cycles, 1);
    assert_eq!(rebuilt.state().goal.as_ref().unwrap().seed, "goal");
    assert_eq!(rebuilt.state().artifact_metadata["target.style"].latest_cycle, 1);
}
