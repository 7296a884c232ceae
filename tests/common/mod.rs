//! Test doubles for the pipeline's collaborators and a context builder.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use hint_forge::collaborators::{
    HintDelivery, HintResult, ProblemQuery, ProgramExecutor, TaskDetails,
};
use hint_forge::config::{AiConfig, TaskPriorities};
use hint_forge::error::{CollaboratorError, LlmError};
use hint_forge::llm::{Choice, GenerationRequest, GenerationResponse, LlmProvider, Message, Usage};
use hint_forge::models::ProgramRun;
use hint_forge::phases::PhaseContext;
use hint_forge::scheduler::{
    Delivery, MemoryTaskQueue, QueueError, QueueStats, TaskDispatcher, TaskMessage, TaskQueue,
};
use hint_forge::storage::MemoryStore;

pub const STUDENT_PROGRAM: &str = "def total(xs):\n    s = 0\n    for i in range(len(xs) - 1):\n        s += xs[i]\n    return s\n";
pub const FIXED_PROGRAM: &str = "def total(xs):\n    s = 0\n    for i in range(len(xs)):\n        s += xs[i]\n    return s\n";
pub const REWRITTEN_PROGRAM: &str = "def total(xs):\n    return sum(xs)\n";
pub const HINT_TEXT: &str = "Which indices does your loop visit?";

/// Executor that answers from a table keyed by program text.
///
/// Unknown programs are incorrect.
#[derive(Default)]
pub struct MockExecutor {
    runs: Mutex<HashMap<String, ProgramRun>>,
    calls: AtomicUsize,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run(self, program: &str, correct: bool, output: &str, elapsed: f64) -> Self {
        self.runs.lock().unwrap().insert(
            program.to_string(),
            ProgramRun {
                correct,
                output: output.to_string(),
                elapsed_seconds: elapsed,
            },
        );
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProgramExecutor for MockExecutor {
    async fn run_program(
        &self,
        _problem_id: &str,
        program: &str,
    ) -> Result<ProgramRun, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;

        Ok(self
            .runs
            .lock()
            .unwrap()
            .get(program)
            .cloned()
            .unwrap_or(ProgramRun {
                correct: false,
                output: "wrong answer".to_string(),
                elapsed_seconds: 0.05,
            }))
    }
}

pub struct MockProblems;

#[async_trait]
impl ProblemQuery for MockProblems {
    async fn task_details(&self, problem_id: &str) -> Result<TaskDetails, CollaboratorError> {
        Ok(TaskDetails {
            description: format!("Problem {}: return the sum of a list.", problem_id),
            template_code: Some("def total(xs):\n    pass".to_string()),
        })
    }
}

/// LLM double: hint prompts get a fixed hint, enhancement prompts get one
/// choice per configured variant.
pub struct MockLlm {
    variants: Vec<String>,
    fail: bool,
    calls: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl MockLlm {
    pub fn new(variants: &[&str]) -> Self {
        Self {
            variants: variants.iter().map(|v| v.to_string()).collect(),
            fail: false,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every call fails with a rate limit.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(&[])
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

fn choice(index: u32, content: String) -> Choice {
    Choice {
        index,
        message: Message::assistant(content),
        finish_reason: Some("stop".to_string()),
    }
}

#[async_trait]
impl LlmProvider for MockLlm {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        if self.fail {
            return Err(LlmError::RateLimited("quota exhausted".to_string()));
        }

        let is_hint = request
            .messages
            .first()
            .is_some_and(|m| m.content.contains("pedagogical hint"));

        let choices = if is_hint {
            vec![choice(
                0,
                serde_json::json!({
                    "explanation": "(1) The loop stops one element early.",
                    "hint": format!("(2) {}", HINT_TEXT),
                })
                .to_string(),
            )]
        } else {
            self.variants
                .iter()
                .enumerate()
                .map(|(i, program)| {
                    choice(
                        i as u32,
                        serde_json::json!({ "fixed_program": program, "optimized_program": program })
                            .to_string(),
                    )
                })
                .collect()
        };

        Ok(GenerationResponse {
            id: "mock".to_string(),
            model: request.model,
            choices,
            usage: Usage::default(),
            latency_seconds: 0.01,
        })
    }
}

/// Records every posted result.
#[derive(Default)]
pub struct MockDelivery {
    results: Mutex<Vec<HintResult>>,
}

impl MockDelivery {
    pub fn results(&self) -> Vec<HintResult> {
        self.results.lock().unwrap().clone()
    }
}

#[async_trait]
impl HintDelivery for MockDelivery {
    async fn post_result(&self, result: &HintResult) -> Result<(), CollaboratorError> {
        self.results.lock().unwrap().push(result.clone());
        Ok(())
    }
}

/// Everything a pipeline test needs, with handles on the doubles.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryTaskQueue>,
    pub executor: Arc<MockExecutor>,
    pub llm: Arc<MockLlm>,
    pub delivery: Arc<MockDelivery>,
    pub ctx: Arc<PhaseContext>,
}

impl Harness {
    pub fn new(executor: MockExecutor, llm: MockLlm, n_programs: u32) -> Self {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryTaskQueue::new(3));
        let executor = Arc::new(executor);
        let llm = Arc::new(llm);
        let delivery = Arc::new(MockDelivery::default());

        let mut ai = AiConfig::default();
        ai.program_generation_model.n_programs = n_programs;

        let ctx = PhaseContext::new(
            store.clone(),
            executor.clone(),
            Arc::new(MockProblems),
            llm.clone(),
            delivery.clone(),
        )
        .with_ai_config(ai)
        .with_priorities(TaskPriorities::default());

        Self {
            store,
            queue,
            executor,
            llm,
            delivery,
            ctx: Arc::new(ctx),
        }
    }

    pub fn dispatcher(&self, max_tries: u32) -> TaskDispatcher {
        TaskDispatcher::new(Arc::clone(&self.ctx), max_tries).with_retry_pause(Duration::ZERO)
    }

    pub fn queue_ref(&self) -> &dyn TaskQueue {
        self.queue.as_ref()
    }
}

/// Queue that refuses the `nth` publish (1-based) of one task type and
/// forwards everything else to an in-memory queue.
///
/// A refused publish is not recorded by the inner queue.
pub struct FlakyPublishQueue {
    inner: Arc<MemoryTaskQueue>,
    task_type: &'static str,
    nth: usize,
    seen: AtomicUsize,
}

impl FlakyPublishQueue {
    pub fn new(inner: Arc<MemoryTaskQueue>, task_type: &'static str, nth: usize) -> Self {
        Self {
            inner,
            task_type,
            nth,
            seen: AtomicUsize::new(0),
        }
    }

    /// Publishes of the watched type attempted so far, refused one included.
    pub fn attempts(&self) -> usize {
        self.seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskQueue for FlakyPublishQueue {
    async fn publish(&self, message: &TaskMessage, priority: u8) -> Result<(), QueueError> {
        if message.task_type == self.task_type
            && self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.nth
        {
            return Err(QueueError::ConnectionFailed(format!(
                "publish of {} refused",
                self.task_type
            )));
        }
        self.inner.publish(message, priority).await
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        self.inner.dequeue(timeout).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.inner.ack(delivery).await
    }

    async fn recover_in_flight(&self) -> Result<usize, QueueError> {
        self.inner.recover_in_flight().await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.inner.stats().await
    }
}
