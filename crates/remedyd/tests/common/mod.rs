//! Fake collaborators shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use remedy_common::{
    ActionKind, Config, RemedyError, Result, Sample, SessionId, SessionView, Suggestion, Target,
};
use remedyd::store::{HistoryStore, MemoryStore};
use remedyd::{
    Collaborators, CommandRunner, DiagnosisProvider, Engine, IssueContext, MetricsSource,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Metrics source
// ============================================================================

enum Batch {
    Samples(Vec<Sample>),
    /// Stamped with the wall clock when polled
    Live(Vec<(Target, String, f64)>),
    Fail(String),
}

/// Hands out one queued batch per poll; an empty queue yields no samples
#[derive(Default)]
pub struct ScriptedSource {
    batches: Mutex<VecDeque<Batch>>,
}

impl ScriptedSource {
    pub fn push(&self, samples: Vec<Sample>) {
        self.batches.lock().unwrap().push_back(Batch::Samples(samples));
    }

    pub fn push_live(&self, target: &Target, metric: &str, value: f64) {
        self.batches.lock().unwrap().push_back(Batch::Live(vec![(
            target.clone(),
            metric.to_string(),
            value,
        )]));
    }

    pub fn push_failure(&self, message: &str) {
        self.batches
            .lock()
            .unwrap()
            .push_back(Batch::Fail(message.to_string()));
    }
}

#[async_trait]
impl MetricsSource for ScriptedSource {
    async fn poll(&self) -> Result<Vec<Sample>> {
        match self.batches.lock().unwrap().pop_front() {
            None => Ok(Vec::new()),
            Some(Batch::Samples(samples)) => Ok(samples),
            Some(Batch::Live(entries)) => {
                let now = Utc::now();
                Ok(entries
                    .into_iter()
                    .map(|(target, metric, value)| Sample::new(&target, metric, value, now))
                    .collect())
            }
            Some(Batch::Fail(message)) => Err(RemedyError::Unavailable(message)),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ============================================================================
// Diagnosis provider
// ============================================================================

pub enum DiagnosisScript {
    Suggest(Vec<Suggestion>),
    /// Never answers within any sensible timeout
    Hang,
    Fail,
}

pub struct ScriptedDiagnosis {
    script: Mutex<DiagnosisScript>,
    calls: Mutex<Vec<IssueContext>>,
}

impl ScriptedDiagnosis {
    pub fn new(script: DiagnosisScript) -> Self {
        Self {
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set(&self, script: DiagnosisScript) {
        *self.script.lock().unwrap() = script;
    }

    pub fn calls(&self) -> Vec<IssueContext> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DiagnosisProvider for ScriptedDiagnosis {
    async fn diagnose(&self, context: &IssueContext) -> Result<Vec<Suggestion>> {
        self.calls.lock().unwrap().push(context.clone());
        let answer = match &*self.script.lock().unwrap() {
            DiagnosisScript::Suggest(suggestions) => Some(Ok(suggestions.clone())),
            DiagnosisScript::Fail => Some(Err(RemedyError::Unavailable(
                "diagnosis backend offline".to_string(),
            ))),
            DiagnosisScript::Hang => None,
        };
        match answer {
            Some(answer) => answer,
            None => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Vec::new())
            }
        }
    }
}

// ============================================================================
// Command runner
// ============================================================================

#[derive(Debug, Clone)]
pub struct Invocation {
    pub action_type: String,
    pub target: Target,
    pub started: tokio::time::Instant,
    pub finished: Option<tokio::time::Instant>,
}

/// Records every invocation and detects overlapping runs on one target
pub struct RecordingRunner {
    delay: Mutex<Duration>,
    fail: Mutex<bool>,
    invocations: Mutex<Vec<Invocation>>,
    in_flight: Mutex<HashMap<Target, usize>>,
    overlaps: Mutex<usize>,
    /// (running now, highest seen) across all targets
    global: Mutex<(usize, usize)>,
}

impl RecordingRunner {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay: Mutex::new(delay),
            fail: Mutex::new(false),
            invocations: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
            overlaps: Mutex::new(0),
            global: Mutex::new((0, 0)),
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn overlaps(&self) -> usize {
        *self.overlaps.lock().unwrap()
    }

    /// Most runs in flight at once, over every target
    pub fn peak(&self) -> usize {
        self.global.lock().unwrap().1
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, action: &ActionKind, target: &Target, _timeout: Duration) -> Result<String> {
        let index = {
            let mut in_flight = self.in_flight.lock().unwrap();
            let running = in_flight.entry(target.clone()).or_insert(0);
            if *running > 0 {
                *self.overlaps.lock().unwrap() += 1;
            }
            *running += 1;

            let mut global = self.global.lock().unwrap();
            global.0 += 1;
            global.1 = global.1.max(global.0);

            let mut invocations = self.invocations.lock().unwrap();
            invocations.push(Invocation {
                action_type: action.action_type().to_string(),
                target: target.clone(),
                started: tokio::time::Instant::now(),
                finished: None,
            });
            invocations.len() - 1
        };

        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;

        *self.in_flight.lock().unwrap().entry(target.clone()).or_insert(1) -= 1;
        self.global.lock().unwrap().0 -= 1;
        self.invocations.lock().unwrap()[index].finished = Some(tokio::time::Instant::now());

        if *self.fail.lock().unwrap() {
            Err(RemedyError::ExecutionFailure(format!(
                "{} on {} exited with status 1",
                action.action_type(),
                target
            )))
        } else {
            Ok(format!("{} {}", action.action_type(), target.target_id))
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub engine: Arc<Engine>,
    pub source: Arc<ScriptedSource>,
    pub diagnosis: Arc<ScriptedDiagnosis>,
    pub runner: Arc<RecordingRunner>,
    pub store: Arc<MemoryStore>,
}

pub fn harness(script: DiagnosisScript) -> Harness {
    harness_with(Config::default(), script)
}

pub fn harness_with(config: Config, script: DiagnosisScript) -> Harness {
    let source = Arc::new(ScriptedSource::default());
    let diagnosis = Arc::new(ScriptedDiagnosis::new(script));
    let runner = Arc::new(RecordingRunner::new(Duration::from_millis(200)));
    let store = Arc::new(MemoryStore::default());

    let collaborators = Collaborators {
        source: source.clone(),
        diagnosis: diagnosis.clone(),
        runner: runner.clone(),
    };
    let history: Arc<dyn HistoryStore> = store.clone();
    let engine = Arc::new(Engine::new(&config, history, collaborators).unwrap());

    Harness {
        engine,
        source,
        diagnosis,
        runner,
        store,
    }
}

pub const TICK_SECS: i64 = 30;

pub fn at(t0: DateTime<Utc>, tick: i64) -> DateTime<Utc> {
    t0 + chrono::Duration::seconds(tick * TICK_SECS)
}

/// Suggestions from the restart loop playbook
pub fn restart_loop_suggestions() -> Vec<Suggestion> {
    vec![
        Suggestion::new("Restart the container", "restart", 0.85),
        Suggestion::new("Increase the memory limit", "update_memory_limit", 0.70)
            .with_parameter("memory_mb", "1024"),
    ]
}

/// Poll the session until it reaches a terminal state. Meant for paused time.
pub async fn wait_terminal(engine: &Engine, session_id: SessionId) -> SessionView {
    for _ in 0..2000 {
        let view = engine.get_session_state(session_id).await.unwrap();
        if view.state.is_terminal() {
            return view;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("session {} never finished", session_id);
}
