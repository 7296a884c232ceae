//! End-to-end pipeline tests over the in-memory store and queue.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{
    FlakyPublishQueue, Harness, MockExecutor, MockLlm, FIXED_PROGRAM, HINT_TEXT,
    REWRITTEN_PROGRAM, STUDENT_PROGRAM,
};
use hint_forge::config::TaskPriorities;
use hint_forge::intake::{submit_reflection, submit_request};
use hint_forge::models::{
    HintType, NewEnhancementPhase, NewRequest, ProgramRun, ALREADY_CORRECT_HINT, FAILURE_HINT,
};
use hint_forge::phases;
use hint_forge::scheduler::{
    ConnectionState, DispatchOutcome, ReconnectPolicy, SharedQueue, TaskDispatcher, TaskKind,
    TaskMessage, TaskQueue, WorkerPool, WorkerPoolConfig,
};
use hint_forge::storage::HintStore;

const WRONG_PROGRAM: &str = "def total(xs):\n    return 0\n";

fn executor() -> MockExecutor {
    MockExecutor::new()
        .with_run(FIXED_PROGRAM, true, "6", 0.2)
        .with_run(REWRITTEN_PROGRAM, true, "6", 0.1)
        .with_run(STUDENT_PROGRAM, false, "3", 0.3)
}

/// Dispatches until the queue stays empty, returning every outcome.
async fn drain(h: &Harness, dispatcher: &TaskDispatcher) -> Vec<DispatchOutcome> {
    drain_via(h.queue_ref(), dispatcher).await
}

async fn drain_via(queue: &dyn TaskQueue, dispatcher: &TaskDispatcher) -> Vec<DispatchOutcome> {
    let mut outcomes = Vec::new();
    while let Some(delivery) = queue.dequeue(Duration::from_millis(20)).await.unwrap() {
        outcomes.push(dispatcher.dispatch(queue, &delivery).await.unwrap());
    }
    outcomes
}

fn retried(outcomes: &[DispatchOutcome]) -> usize {
    outcomes
        .iter()
        .filter(|o| matches!(o, DispatchOutcome::Retried { .. }))
        .count()
}

fn new_phase() -> NewEnhancementPhase {
    NewEnhancementPhase {
        prompt: "p".to_string(),
        model_id: "m".to_string(),
        model_temperature: 1.0,
        whole_llm_response: "[]".to_string(),
        llm_waiting_seconds: 0.1,
    }
}

// ============================================================================
// Sequential flows
// ============================================================================

#[tokio::test]
async fn test_debug_request_produces_hint_from_closest_fix() {
    let h = Harness::new(
        executor(),
        MockLlm::new(&[FIXED_PROGRAM, REWRITTEN_PROGRAM, WRONG_PROGRAM]),
        3,
    );
    let dispatcher = h.dispatcher(3);

    submit_request(
        &h.ctx,
        h.queue_ref(),
        NewRequest::new(1, "sum_list", HintType::Debug, STUDENT_PROGRAM),
    )
    .await
    .unwrap();
    submit_reflection(
        &h.ctx,
        h.queue_ref(),
        1,
        "What is wrong?",
        "I think the loop range is off",
    )
    .await
    .unwrap();

    let outcomes = drain(&h, &dispatcher).await;
    assert!(outcomes.iter().all(|o| *o == DispatchOutcome::Succeeded));

    assert_eq!(h.queue.published_of("generate_hint").await.len(), 1);
    assert_eq!(h.queue.published_of("run_enhanced_program").await.len(), 3);

    let results = h.delivery.results();
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.request_id, 1);
    assert!(result.job_finished_successfully);
    assert_eq!(result.hint, HINT_TEXT);

    let trace = &result.other_hint_data;
    assert_eq!(trace.enhanced_programs.len(), 3);
    assert!(trace.reflection.is_some());
    assert!(trace.hint_generation_phase.is_some());
    let phase = trace.program_enhancement_phase.as_ref().unwrap();
    assert_eq!(phase.n_correct_enhancements, Some(2));
    assert_eq!(phase.best_enhanced_program.as_deref(), Some(FIXED_PROGRAM));

    // the hint prompt saw the reflection and the chosen fix
    let requests = h.llm.requests();
    let hint_prompt = &requests.last().unwrap().messages[1].content;
    assert!(hint_prompt.contains("I think the loop range is off"));
    assert!(hint_prompt.contains("range(len(xs))"));
}

#[tokio::test]
async fn test_optimize_request_uses_fastest_variant() {
    let h = Harness::new(
        executor().with_run(STUDENT_PROGRAM, true, "6", 0.9),
        MockLlm::new(&[FIXED_PROGRAM, REWRITTEN_PROGRAM]),
        2,
    );
    let dispatcher = h.dispatcher(3);

    submit_request(
        &h.ctx,
        h.queue_ref(),
        NewRequest::new(2, "sum_list", HintType::Optimize, STUDENT_PROGRAM),
    )
    .await
    .unwrap();
    submit_reflection(&h.ctx, h.queue_ref(), 2, "Why slow?", "no idea")
        .await
        .unwrap();
    drain(&h, &dispatcher).await;

    let request = h.store.load_request(2).await.unwrap();
    assert_eq!(
        request.student_program_output.as_deref(),
        Some(hint_forge::models::CORRECT_OUTPUT_MARKER)
    );

    let results = h.delivery.results();
    assert_eq!(results.len(), 1);
    assert!(results[0].job_finished_successfully);
    let phase = results[0]
        .other_hint_data
        .program_enhancement_phase
        .as_ref()
        .unwrap();
    assert_eq!(phase.best_enhanced_program.as_deref(), Some(REWRITTEN_PROGRAM));
}

#[tokio::test]
async fn test_correct_debug_program_exits_early() {
    let h = Harness::new(
        executor().with_run(STUDENT_PROGRAM, true, "6", 0.3),
        MockLlm::new(&[FIXED_PROGRAM]),
        1,
    );
    let dispatcher = h.dispatcher(3);

    submit_request(
        &h.ctx,
        h.queue_ref(),
        NewRequest::new(3, "sum_list", HintType::Debug, STUDENT_PROGRAM),
    )
    .await
    .unwrap();
    drain(&h, &dispatcher).await;

    let hint = h.store.load_hint(3).await.unwrap().unwrap();
    assert_eq!(hint.hint, ALREADY_CORRECT_HINT);
    assert!(hint.job_finished_successfully);

    let request = h.store.load_request(3).await.unwrap();
    assert!(request.student_program_output.is_none());

    assert_eq!(h.queue.published_of("deliver_hint").await.len(), 1);
    assert!(h.queue.published_of("generate_hint").await.is_empty());
    assert_eq!(h.delivery.results().len(), 1);
    assert_eq!(h.store.hint_generation_count(3).await, 0);
}

#[tokio::test]
async fn test_retries_then_fails_terminally() {
    let h = Harness::new(executor(), MockLlm::failing(), 2);
    let dispatcher = h.dispatcher(3);
    let priorities = TaskPriorities::default();

    h.store
        .add_request(NewRequest::new(4, "sum_list", HintType::Plan, STUDENT_PROGRAM))
        .await
        .unwrap();
    h.queue
        .publish(
            &TaskMessage::new(TaskKind::GenerateEnhancedPrograms, json!({"request_id": 4})),
            priorities.generate_enhanced_programs,
        )
        .await
        .unwrap();

    let outcomes = drain(&h, &dispatcher).await;
    assert_eq!(
        outcomes,
        vec![
            DispatchOutcome::Retried { tries: 2 },
            DispatchOutcome::Retried { tries: 3 },
            DispatchOutcome::Terminal,
        ]
    );
    assert_eq!(h.llm.calls(), 3);

    let published = h.queue.published_of("generate_enhanced_programs").await;
    let tries: Vec<u32> = published.iter().map(|(m, _)| m.tries).collect();
    assert_eq!(tries, vec![1, 2, 3]);
    assert!(published[1..].iter().all(|(_, p)| *p == priorities.retry));

    let hint = h.store.load_hint(4).await.unwrap().unwrap();
    assert_eq!(hint.hint, FAILURE_HINT);
    assert!(!hint.job_finished_successfully);
    assert!(hint
        .generation_error_message
        .as_deref()
        .unwrap()
        .contains("quota exhausted"));

    let results = h.delivery.results();
    assert_eq!(results.len(), 1);
    assert!(!results[0].job_finished_successfully);
    assert_eq!(h.queue.stats().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_unknown_task_type_is_terminal() {
    let h = Harness::new(executor(), MockLlm::new(&[]), 1);
    let dispatcher = h.dispatcher(3);

    h.store
        .add_request(NewRequest::new(5, "sum_list", HintType::Debug, STUDENT_PROGRAM))
        .await
        .unwrap();
    let message = TaskMessage {
        task_type: "return_hint".to_string(),
        tries: 1,
        data: json!({"request_id": 5}),
    };
    h.queue.publish(&message, 1).await.unwrap();

    let outcomes = drain(&h, &dispatcher).await;
    assert_eq!(outcomes, vec![DispatchOutcome::Terminal]);

    let hint = h.store.load_hint(5).await.unwrap().unwrap();
    assert_eq!(hint.hint, FAILURE_HINT);
    assert_eq!(h.delivery.results().len(), 1);
}

#[tokio::test]
async fn test_duplicate_request_is_rejected_without_publishing() {
    let h = Harness::new(executor(), MockLlm::new(&[]), 1);
    let new = || NewRequest::new(6, "sum_list", HintType::Debug, STUDENT_PROGRAM);

    submit_request(&h.ctx, h.queue_ref(), new()).await.unwrap();
    let err = submit_request(&h.ctx, h.queue_ref(), new())
        .await
        .unwrap_err();

    assert!(err.is_duplicate_key());
    assert_eq!(h.queue.published().await.len(), 2);
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_completions_publish_generate_hint_once() {
    let h = Harness::new(executor(), MockLlm::new(&[]), 2);

    for request_id in 100..120 {
        h.store
            .add_request(NewRequest::new(
                request_id,
                "sum_list",
                HintType::Debug,
                STUDENT_PROGRAM,
            ))
            .await
            .unwrap();
        h.store
            .update_request_with_test_results(request_id, "3".to_string(), 0.3)
            .await
            .unwrap();
        let (_, programs) = h
            .store
            .add_enhancement_phase(
                request_id,
                NewEnhancementPhase {
                    prompt: "p".to_string(),
                    model_id: "m".to_string(),
                    model_temperature: 1.0,
                    whole_llm_response: "[]".to_string(),
                    llm_waiting_seconds: 0.1,
                },
                vec![FIXED_PROGRAM.to_string(), REWRITTEN_PROGRAM.to_string()],
            )
            .await
            .unwrap();

        let mut messages: Vec<TaskMessage> = programs
            .iter()
            .map(|p| {
                TaskMessage::new(
                    TaskKind::RunEnhancedProgram,
                    json!({"enhanced_program_id": p.id}),
                )
            })
            .collect();
        messages.push(TaskMessage::new(
            TaskKind::AddReflection,
            json!({
                "request_id": request_id,
                "reflection_question": "q",
                "reflection_answer": "the loop stops early",
            }),
        ));

        let handles: Vec<_> = messages
            .into_iter()
            .map(|message| {
                let ctx = Arc::clone(&h.ctx);
                let queue = Arc::clone(&h.queue);
                tokio::spawn(async move { phases::execute(&ctx, queue.as_ref(), &message).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(h.store.is_ready(request_id).await.unwrap());
    }

    let generate = h.queue.published_of("generate_hint").await;
    assert_eq!(generate.len(), 20);
    let mut ids: Vec<i64> = generate
        .iter()
        .filter_map(|(m, _)| m.request_id())
        .collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 20);
}

#[tokio::test]
async fn test_refilled_program_republishes_until_marked() {
    let h = Harness::new(executor(), MockLlm::new(&[]), 1);

    h.store
        .add_request(NewRequest::new(7, "sum_list", HintType::Debug, STUDENT_PROGRAM))
        .await
        .unwrap();
    h.store
        .update_request_with_test_results(7, "3".to_string(), 0.3)
        .await
        .unwrap();
    h.store
        .add_reflection(7, "q".to_string(), "a b c".to_string())
        .await
        .unwrap();
    let (_, programs) = h
        .store
        .add_enhancement_phase(
            7,
            NewEnhancementPhase {
                prompt: "p".to_string(),
                model_id: "m".to_string(),
                model_temperature: 1.0,
                whole_llm_response: "[]".to_string(),
                llm_waiting_seconds: 0.1,
            },
            vec![FIXED_PROGRAM.to_string()],
        )
        .await
        .unwrap();

    let run = ProgramRun {
        correct: true,
        output: "6".to_string(),
        elapsed_seconds: 0.2,
    };
    let (_, first) = h
        .store
        .update_enhanced_program(programs[0].id, run.clone())
        .await
        .unwrap();
    assert!(first);

    // generate_hint not yet recorded as published: a refill still reports it owed
    let (_, before_mark) = h
        .store
        .update_enhanced_program(programs[0].id, run.clone())
        .await
        .unwrap();
    assert!(before_mark);

    h.store.mark_hint_requested(7).await.unwrap();
    let (_, after_mark) = h
        .store
        .update_enhanced_program(programs[0].id, run)
        .await
        .unwrap();
    assert!(!after_mark);
}

// ============================================================================
// Publish failures after a committed mutation
// ============================================================================

#[tokio::test]
async fn test_failed_generate_hint_publish_is_retried_by_completing_task() {
    let h = Harness::new(executor(), MockLlm::new(&[FIXED_PROGRAM]), 1);
    let dispatcher = h.dispatcher(3);
    let flaky = FlakyPublishQueue::new(h.queue.clone(), "generate_hint", 1);

    submit_request(
        &h.ctx,
        &flaky,
        NewRequest::new(10, "sum_list", HintType::Debug, STUDENT_PROGRAM),
    )
    .await
    .unwrap();
    submit_reflection(&h.ctx, &flaky, 10, "q", "the loop stops early")
        .await
        .unwrap();

    let outcomes = drain_via(&flaky, &dispatcher).await;
    assert_eq!(retried(&outcomes), 1);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, DispatchOutcome::Succeeded | DispatchOutcome::Retried { .. })));

    assert_eq!(flaky.attempts(), 2);
    assert_eq!(h.queue.published_of("generate_hint").await.len(), 1);
    assert!(h.store.is_ready(10).await.unwrap());
    assert!(h
        .store
        .load_request(10)
        .await
        .unwrap()
        .hint_requested_at
        .is_some());
    assert_eq!(h.store.hint_generation_count(10).await, 1);

    let results = h.delivery.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].hint, HINT_TEXT);
}

#[tokio::test]
async fn test_redelivered_reflection_publishes_owed_generate_hint() {
    let h = Harness::new(executor(), MockLlm::new(&[]), 1);
    let dispatcher = h.dispatcher(3);
    let flaky = FlakyPublishQueue::new(h.queue.clone(), "generate_hint", 1);

    h.store
        .add_request(NewRequest::new(11, "sum_list", HintType::Debug, STUDENT_PROGRAM))
        .await
        .unwrap();
    h.store
        .update_request_with_test_results(11, "3".to_string(), 0.3)
        .await
        .unwrap();
    let (_, programs) = h
        .store
        .add_enhancement_phase(11, new_phase(), vec![FIXED_PROGRAM.to_string()])
        .await
        .unwrap();
    h.store
        .update_enhanced_program(
            programs[0].id,
            ProgramRun {
                correct: true,
                output: "6".to_string(),
                elapsed_seconds: 0.2,
            },
        )
        .await
        .unwrap();

    submit_reflection(&h.ctx, &flaky, 11, "q", "off by one")
        .await
        .unwrap();

    let outcomes = drain_via(&flaky, &dispatcher).await;
    assert_eq!(
        outcomes,
        vec![
            DispatchOutcome::Retried { tries: 2 },
            DispatchOutcome::Succeeded,
            DispatchOutcome::Succeeded,
            DispatchOutcome::Succeeded,
        ]
    );
    assert_eq!(h.queue.published_of("generate_hint").await.len(), 1);
    assert_eq!(h.delivery.results().len(), 1);
    assert!(h.delivery.results()[0].job_finished_successfully);
}

#[tokio::test]
async fn test_duplicate_reflection_after_hint_request_is_already_applied() {
    let h = Harness::new(executor(), MockLlm::new(&[FIXED_PROGRAM]), 1);
    let dispatcher = h.dispatcher(3);

    submit_request(
        &h.ctx,
        h.queue_ref(),
        NewRequest::new(12, "sum_list", HintType::Debug, STUDENT_PROGRAM),
    )
    .await
    .unwrap();
    submit_reflection(&h.ctx, h.queue_ref(), 12, "q", "first answer")
        .await
        .unwrap();
    drain(&h, &dispatcher).await;

    submit_reflection(&h.ctx, h.queue_ref(), 12, "q", "second answer")
        .await
        .unwrap();
    let outcomes = drain(&h, &dispatcher).await;

    assert_eq!(outcomes, vec![DispatchOutcome::AlreadyApplied]);
    assert_eq!(h.queue.published_of("generate_hint").await.len(), 1);
    assert_eq!(h.delivery.results().len(), 1);
}

#[tokio::test]
async fn test_failed_fan_out_reuses_recorded_phase() {
    let h = Harness::new(
        executor(),
        MockLlm::new(&[FIXED_PROGRAM, REWRITTEN_PROGRAM, WRONG_PROGRAM]),
        3,
    );
    let dispatcher = h.dispatcher(3);
    let flaky = FlakyPublishQueue::new(h.queue.clone(), "run_enhanced_program", 2);

    submit_request(
        &h.ctx,
        &flaky,
        NewRequest::new(13, "sum_list", HintType::Debug, STUDENT_PROGRAM),
    )
    .await
    .unwrap();
    submit_reflection(&h.ctx, &flaky, 13, "q", "the range is wrong")
        .await
        .unwrap();

    let outcomes = drain_via(&flaky, &dispatcher).await;
    assert_eq!(retried(&outcomes), 1);

    // one enhancement call and one hint call
    assert_eq!(h.llm.calls(), 2);

    let phase = h
        .store
        .load_latest_enhancement_phase(13)
        .await
        .unwrap()
        .unwrap();
    let program_ids: Vec<i64> = h
        .store
        .load_enhanced_programs(phase.id)
        .await
        .unwrap()
        .iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(program_ids.len(), 3);
    for (message, _) in h.queue.published_of("run_enhanced_program").await {
        let id = message.data["enhanced_program_id"].as_i64().unwrap();
        assert!(program_ids.contains(&id));
    }

    assert_eq!(h.queue.published_of("generate_hint").await.len(), 1);
    let results = h.delivery.results();
    assert_eq!(results.len(), 1);
    assert!(results[0].job_finished_successfully);
    assert_eq!(results[0].other_hint_data.enhanced_programs.len(), 3);
}

#[tokio::test]
async fn test_redelivered_generate_enhanced_programs_keeps_request_ready() {
    let h = Harness::new(
        executor(),
        MockLlm::new(&[FIXED_PROGRAM, REWRITTEN_PROGRAM]),
        2,
    );
    let dispatcher = h.dispatcher(3);

    submit_request(
        &h.ctx,
        h.queue_ref(),
        NewRequest::new(14, "sum_list", HintType::Debug, STUDENT_PROGRAM),
    )
    .await
    .unwrap();
    submit_reflection(&h.ctx, h.queue_ref(), 14, "q", "the loop misses one")
        .await
        .unwrap();
    drain(&h, &dispatcher).await;

    let phase_before = h
        .store
        .load_latest_enhancement_phase(14)
        .await
        .unwrap()
        .unwrap();
    let llm_calls = h.llm.calls();
    let runs = h.queue.published_of("run_enhanced_program").await.len();
    assert!(h.store.is_ready(14).await.unwrap());

    h.queue
        .publish(
            &TaskMessage::new(TaskKind::GenerateEnhancedPrograms, json!({"request_id": 14})),
            TaskPriorities::default().generate_enhanced_programs,
        )
        .await
        .unwrap();
    let outcomes = drain(&h, &dispatcher).await;

    assert_eq!(outcomes, vec![DispatchOutcome::Succeeded]);
    assert_eq!(h.llm.calls(), llm_calls);
    assert_eq!(
        h.queue.published_of("run_enhanced_program").await.len(),
        runs
    );
    let phase_after = h
        .store
        .load_latest_enhancement_phase(14)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(phase_after.id, phase_before.id);
    assert!(h.store.is_ready(14).await.unwrap());
    assert_eq!(h.queue.published_of("generate_hint").await.len(), 1);
    assert_eq!(h.delivery.results().len(), 1);
}

// ============================================================================
// Worker pool
// ============================================================================

fn pool_config() -> WorkerPoolConfig {
    WorkerPoolConfig::new(3)
        .with_poll_interval(Duration::from_millis(20))
        .with_shutdown_timeout(Duration::from_secs(5))
        .with_reconnect_policy(ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_attempts: None,
        })
}

async fn wait_for_results(h: &Harness, expected: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while h.delivery.results().len() < expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("hint was not delivered in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_pool_runs_pipeline_to_delivery() {
    let h = Harness::new(
        executor(),
        MockLlm::new(&[FIXED_PROGRAM, REWRITTEN_PROGRAM]),
        2,
    );
    let queue: Arc<dyn TaskQueue> = h.queue.clone();
    let mut pool = WorkerPool::new(
        pool_config(),
        Arc::new(SharedQueue(queue)),
        Arc::new(h.dispatcher(3)),
    );
    pool.start().await.unwrap();

    submit_request(
        &h.ctx,
        h.queue_ref(),
        NewRequest::new(8, "sum_list", HintType::Debug, STUDENT_PROGRAM),
    )
    .await
    .unwrap();
    submit_reflection(&h.ctx, h.queue_ref(), 8, "q", "the loop misses the end")
        .await
        .unwrap();

    wait_for_results(&h, 1).await;
    pool.shutdown().await.unwrap();

    let results = h.delivery.results();
    assert_eq!(results[0].hint, HINT_TEXT);
    assert!(pool.stats().tasks_succeeded >= 6);
    assert_eq!(pool.connection_state(), ConnectionState::Disconnected);
    assert!(!pool.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_pool_recovers_after_queue_outage() {
    let h = Harness::new(executor(), MockLlm::new(&[FIXED_PROGRAM]), 1);
    let queue: Arc<dyn TaskQueue> = h.queue.clone();
    let mut pool = WorkerPool::new(
        pool_config().with_max_consecutive_errors(2),
        Arc::new(SharedQueue(queue)),
        Arc::new(h.dispatcher(3)),
    );
    pool.start().await.unwrap();

    h.queue.set_available(false);
    tokio::time::sleep(Duration::from_millis(200)).await;

    submit_request(
        &h.ctx,
        h.queue_ref(),
        NewRequest::new(9, "sum_list", HintType::Debug, STUDENT_PROGRAM),
    )
    .await
    .unwrap();
    submit_reflection(&h.ctx, h.queue_ref(), 9, "q", "off by one somewhere")
        .await
        .unwrap();
    h.queue.set_available(true);

    wait_for_results(&h, 1).await;
    pool.shutdown().await.unwrap();

    assert!(h.delivery.results()[0].job_finished_successfully);
}
