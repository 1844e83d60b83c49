//! Execution engine behavior: ordering, retry, recovery, isolation.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use pipestep::{
    run_step, BlockingFnStep, ConcurrencyStrategy, EffectiveConfig, ExecutionError, FnStep,
    ManyToMany, ManyToOne, OneToMany, OneToOne, Step, StepConfig, StepError, StepExecutor,
    StepOverride,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

fn config(patch: StepOverride) -> EffectiveConfig {
    StepConfig::default().overlay(&patch)
}

fn fast_retries(limit: u32) -> StepOverride {
    StepOverride::new()
        .retry_limit(limit)
        .retry_wait(Duration::from_millis(1))
}

/// Sleeps per item ("slow" 500ms, anything else 100ms) and records overlap.
struct TimedStep {
    calls: AtomicU32,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
}

impl TimedStep {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
        })
    }
}

struct Timed(Arc<TimedStep>);

#[async_trait]
impl OneToOne for Timed {
    type Input = String;
    type Output = String;

    fn name(&self) -> &'static str {
        "timed"
    }

    async fn apply(&self, input: String) -> Result<String, StepError> {
        let state = &self.0;
        state.calls.fetch_add(1, Ordering::SeqCst);
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = if input == "slow" { 500 } else { 100 };
        tokio::time::sleep(Duration::from_millis(delay)).await;

        state.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(format!("processed:{input}"))
    }
}

/// Fails its first `failures` invocations, then echoes its input.
struct FlakyStep {
    calls: AtomicU32,
    failures: u32,
    recovered: AtomicU32,
}

impl FlakyStep {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            failures,
            recovered: AtomicU32::new(0),
        })
    }
}

struct Flaky(Arc<FlakyStep>);

#[async_trait]
impl OneToOne for Flaky {
    type Input = String;
    type Output = String;

    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn apply(&self, input: String) -> Result<String, StepError> {
        let count = self.0.calls.fetch_add(1, Ordering::SeqCst);
        if count < self.0.failures {
            Err(StepError::msg(format!("transient failure {}", count + 1)))
        } else {
            Ok(input)
        }
    }

    async fn recover(&self, input: String, _cause: &StepError) -> Option<Result<String, StepError>> {
        self.0.recovered.fetch_add(1, Ordering::SeqCst);
        Some(Ok(input))
    }
}

fn inputs(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_sequential_preserves_order_without_overlap() {
    let state = TimedStep::new();
    let step = Step::one_to_one(Timed(state.clone()));

    let results: Vec<_> = run_step(step, EffectiveConfig::default(), stream::iter(inputs(&["item1", "item2", "item3"])))
        .collect()
        .await;

    let outputs: Vec<String> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(outputs, vec!["processed:item1", "processed:item2", "processed:item3"]);
    assert_eq!(state.calls.load(Ordering::SeqCst), 3);
    assert_eq!(state.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concatenate_matches_input_order() {
    let state = TimedStep::new();
    let step = Step::one_to_one(Timed(state.clone()));
    let cfg = config(
        StepOverride::new()
            .parallel(true)
            .concurrency_strategy(ConcurrencyStrategy::Concatenate),
    );

    let started = Instant::now();
    let outputs: Vec<String> = run_step(step, cfg, stream::iter(inputs(&["slow", "fast1", "fast2"])))
        .map(|r| r.unwrap())
        .collect()
        .await;

    assert_eq!(outputs, vec!["processed:slow", "processed:fast1", "processed:fast2"]);
    assert!(state.max_in_flight.load(Ordering::SeqCst) > 1);
    // Concurrent: well under the 700ms a sequential run would take.
    assert!(started.elapsed() < Duration::from_millis(690));
}

#[tokio::test]
async fn test_merge_processes_each_item_once() {
    let state = TimedStep::new();
    let step = Step::one_to_one(Timed(state.clone()));
    let cfg = config(StepOverride::new().parallel(true));

    let outputs: Vec<String> = run_step(step, cfg, stream::iter(inputs(&["slow", "fast1", "fast2"])))
        .map(|r| r.unwrap())
        .collect()
        .await;

    let expected: HashSet<String> = ["processed:slow", "processed:fast1", "processed:fast2"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(outputs.len(), 3);
    assert_eq!(outputs.iter().cloned().collect::<HashSet<_>>(), expected);
    assert_eq!(state.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_max_concurrency_bounds_parallel_mode() {
    let state = TimedStep::new();
    let step = Step::one_to_one(Timed(state.clone()));
    let cfg = config(StepOverride::new().parallel(true).max_concurrency(2));

    let items: Vec<String> = (0..6).map(|i| format!("item{i}")).collect();
    let results: Vec<_> = run_step(step, cfg, stream::iter(items)).collect().await;

    assert_eq!(results.len(), 6);
    assert_eq!(state.max_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retry_bound_is_limit_plus_one() {
    let flaky = FlakyStep::new(u32::MAX);
    let executor = StepExecutor::new(Step::one_to_one(Flaky(flaky.clone())), config(fast_retries(3)));

    let err = executor.execute("item".to_string()).await.unwrap_err();

    assert_eq!(flaky.calls.load(Ordering::SeqCst), 4);
    match err {
        ExecutionError::Exhausted { step, attempts, transient, .. } => {
            assert_eq!(step, "flaky");
            assert_eq!(attempts, 4);
            assert_eq!(transient, None);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_no_retry_by_default() {
    let flaky = FlakyStep::new(1);
    let executor = StepExecutor::new(Step::one_to_one(Flaky(flaky.clone())), EffectiveConfig::default());

    assert!(executor.execute("item".to_string()).await.is_err());
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retry_then_succeed() {
    let flaky = FlakyStep::new(2);
    let executor = StepExecutor::new(Step::one_to_one(Flaky(flaky.clone())), config(fast_retries(2)));

    let output = executor.execute("item".to_string()).await.unwrap();

    assert_eq!(output, "item");
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    assert_eq!(flaky.recovered.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_backoff_doubles_between_attempts() {
    let flaky = FlakyStep::new(2);
    let cfg = config(
        StepOverride::new()
            .retry_limit(2)
            .retry_wait(Duration::from_millis(50)),
    );
    let executor = StepExecutor::new(Step::one_to_one(Flaky(flaky)), cfg);

    let started = Instant::now();
    executor.execute("item".to_string()).await.unwrap();

    // 50ms + 100ms
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn test_recovery_substitutes_original_input() {
    let flaky = FlakyStep::new(u32::MAX);
    let cfg = config(fast_retries(1).recover_on_failure(true));
    let executor = StepExecutor::new(Step::one_to_one(Flaky(flaky.clone())), cfg);

    let output = executor.execute("original".to_string()).await.unwrap();

    assert_eq!(output, "original");
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    assert_eq!(flaky.recovered.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_recovery_gate_closed() {
    let flaky = FlakyStep::new(u32::MAX);
    let cfg = config(fast_retries(1).recover_on_failure(false));
    let executor = StepExecutor::new(Step::one_to_one(Flaky(flaky.clone())), cfg);

    let err = executor.execute("original".to_string()).await.unwrap_err();

    assert!(matches!(err, ExecutionError::Exhausted { attempts: 2, .. }));
    assert_eq!(flaky.recovered.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_recovery_failure_is_terminal() {
    let step = FnStep::new("broken", |_: u32| async { Err::<u32, _>(StepError::msg("boom")) })
        .with_recovery(|_, _| Err(StepError::msg("dead letter unavailable")))
        .into_step();
    let executor = StepExecutor::new(step, config(StepOverride::new().recover_on_failure(true)));

    let err = executor.execute(1).await.unwrap_err();

    match err {
        ExecutionError::RecoveryFailed { step, cause, source } => {
            assert_eq!(step, "broken");
            assert_eq!(cause.to_string(), "boom");
            assert_eq!(source.to_string(), "dead letter unavailable");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_step_without_hook_reports_exhaustion() {
    let step = FnStep::new("no_hook", |_: u32| async { Err::<u32, _>(StepError::msg("boom")) }).into_step();
    let executor = StepExecutor::new(step, config(StepOverride::new().recover_on_failure(true)));

    let err = executor.execute(1).await.unwrap_err();
    assert!(err.to_string().contains("failed after 1 attempt"));
}

#[tokio::test]
async fn test_failure_is_isolated_in_parallel_mode() {
    let step = FnStep::new("picky", |n: u32| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if n == 3 {
            Err(StepError::msg("three is rejected"))
        } else {
            Ok(n * 10)
        }
    })
    .into_step();
    let cfg = config(
        StepOverride::new()
            .parallel(true)
            .concurrency_strategy(ConcurrencyStrategy::Concatenate),
    );

    let results: Vec<_> = run_step(step, cfg, stream::iter(1..=5u32)).collect().await;

    assert_eq!(results.len(), 5);
    assert!(results[2].is_err());
    let ok: Vec<u32> = results.into_iter().filter_map(Result::ok).collect();
    assert_eq!(ok, vec![10, 20, 40, 50]);
}

#[tokio::test]
async fn test_classifier_stops_non_transient_retries() {
    let flaky = FlakyStep::new(u32::MAX);
    let executor = StepExecutor::new(Step::one_to_one(Flaky(flaky.clone())), config(fast_retries(5)))
        .with_classifier(Arc::new(|_: &StepError| false));

    let err = executor.execute("item".to_string()).await.unwrap_err();

    assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    assert_eq!(err.is_transient(), Some(false));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_step_runs_off_the_scheduler() {
    let step = BlockingFnStep::new("checksum", |n: u64| {
        std::thread::sleep(Duration::from_millis(100));
        Ok(n * 2)
    })
    .into_step();
    let cfg = config(StepOverride::new().parallel(true));

    let started = Instant::now();
    let mut outputs: Vec<u64> = run_step(step, cfg, stream::iter(1..=6u64))
        .map(|r| r.unwrap())
        .collect()
        .await;
    outputs.sort();

    assert_eq!(outputs, vec![2, 4, 6, 8, 10, 12]);
    // Six 100ms blocking calls on two workers would take 300ms if they
    // occupied the async threads.
    assert!(started.elapsed() < Duration::from_millis(290));
}

#[tokio::test]
async fn test_blocking_step_recovers() {
    let step = BlockingFnStep::new("strict", |n: u32| {
        if n % 2 == 0 {
            Ok(n)
        } else {
            Err(StepError::msg("odd"))
        }
    })
    .with_recovery(|n, _| Ok(n + 1))
    .into_step();
    let executor = StepExecutor::new(step, config(StepOverride::new().recover_on_failure(true)));

    assert_eq!(executor.execute(3).await.unwrap(), 4);
    assert_eq!(executor.execute(8).await.unwrap(), 8);
}

#[tokio::test]
async fn test_cancellation_interrupts_backoff() {
    let flaky = FlakyStep::new(u32::MAX);
    let cfg = config(
        StepOverride::new()
            .retry_limit(5)
            .retry_wait(Duration::from_secs(10)),
    );
    let token = CancellationToken::new();
    let executor = StepExecutor::new(Step::one_to_one(Flaky(flaky.clone())), cfg).with_cancellation(token.clone());

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let err = executor.execute("item".to_string()).await.unwrap_err();

    assert!(matches!(err, ExecutionError::Cancelled { step: "flaky" }));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
}

struct Words;

#[async_trait]
impl OneToMany for Words {
    type Input = String;
    type Output = String;

    fn name(&self) -> &'static str {
        "words"
    }

    async fn apply(
        &self,
        input: String,
    ) -> Result<BoxStream<'static, Result<String, StepError>>, StepError> {
        let words: Vec<Result<String, StepError>> = input
            .split_whitespace()
            .map(|w| {
                if w == "bad" {
                    Err(StepError::msg("bad word"))
                } else {
                    Ok(w.to_string())
                }
            })
            .collect();
        Ok(stream::iter(words).boxed())
    }
}

#[tokio::test]
async fn test_one_to_many_flattens_in_order() {
    let outputs: Vec<_> = run_step(
        Step::one_to_many(Words),
        EffectiveConfig::default(),
        stream::iter(inputs(&["a b", "c bad d"])),
    )
    .collect()
    .await;

    assert_eq!(outputs.len(), 5);
    assert_eq!(outputs[0].as_ref().unwrap(), "a");
    assert_eq!(outputs[2].as_ref().unwrap(), "c");
    assert!(matches!(outputs[3], Err(ExecutionError::ElementFailed { step: "words", .. })));
    assert_eq!(outputs[4].as_ref().unwrap(), "d");
}

#[tokio::test]
async fn test_single_item_call_rejects_streaming_shapes() {
    let executor = StepExecutor::new(Step::one_to_many(Words), EffectiveConfig::default());
    let err = executor.execute("a b".to_string()).await.unwrap_err();
    assert!(matches!(err, ExecutionError::Unsupported { step: "words", .. }));
}

/// Sums its whole input; fails while `failures` remain.
struct Sum {
    calls: Arc<AtomicU32>,
    failures: u32,
    seen: Arc<Mutex<Vec<Vec<u32>>>>,
}

#[async_trait]
impl ManyToOne for Sum {
    type Input = u32;
    type Output = u32;

    fn name(&self) -> &'static str {
        "sum"
    }

    async fn apply(&self, inputs: BoxStream<'static, u32>) -> Result<u32, StepError> {
        let batch: Vec<u32> = inputs.collect().await;
        self.seen.lock().await.push(batch.clone());
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(StepError::msg("ledger busy"));
        }
        Ok(batch.iter().sum())
    }
}

#[tokio::test]
async fn test_many_to_one_replays_the_batch_on_retry() {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let step = Step::many_to_one(Sum {
        calls: calls.clone(),
        failures: 1,
        seen: seen.clone(),
    });

    let results: Vec<_> = run_step(step, config(fast_retries(1)), stream::iter(vec![1u32, 2, 3]))
        .collect()
        .await;

    assert_eq!(results.len(), 1);
    assert_eq!(*results[0].as_ref().unwrap(), 6);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(*seen.lock().await, vec![vec![1, 2, 3], vec![1, 2, 3]]);
}

#[tokio::test]
async fn test_batch_size_reduces_each_window() {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let step = Step::many_to_one(Sum {
        calls: calls.clone(),
        failures: 0,
        seen: seen.clone(),
    });

    let results: Vec<u32> = run_step(
        step,
        config(StepOverride::new().batch_size(2)),
        stream::iter(vec![1u32, 2, 3, 4, 5]),
    )
    .map(|r| r.unwrap())
    .collect()
    .await;

    assert_eq!(results, vec![3, 7, 5]);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(*seen.lock().await, vec![vec![1, 2], vec![3, 4], vec![5]]);
}

#[tokio::test]
async fn test_batch_timeout_closes_a_partial_window() {
    let calls = Arc::new(AtomicU32::new(0));
    let step = Step::many_to_one(Sum {
        calls: calls.clone(),
        failures: 0,
        seen: Arc::new(Mutex::new(Vec::new())),
    });
    let upstream = stream::iter(vec![1u32, 2]).chain(stream::once(async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        3u32
    }));

    let results: Vec<u32> = run_step(
        step,
        config(
            StepOverride::new()
                .batch_size(10)
                .batch_timeout(Duration::from_millis(50)),
        ),
        upstream,
    )
    .map(|r| r.unwrap())
    .collect()
    .await;

    assert_eq!(results, vec![3, 3]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

struct Halve;

#[async_trait]
impl ManyToMany for Halve {
    type Input = u32;
    type Output = u32;

    fn name(&self) -> &'static str {
        "halve"
    }

    fn apply(&self, inputs: BoxStream<'static, u32>) -> BoxStream<'static, Result<u32, StepError>> {
        inputs
            .map(|n| {
                if n % 2 == 0 {
                    Ok(n / 2)
                } else {
                    Err(StepError::msg(format!("{n} is odd")))
                }
            })
            .boxed()
    }

    async fn recover(&self, _cause: &StepError) -> Option<Result<u32, StepError>> {
        Some(Ok(0))
    }
}

#[tokio::test]
async fn test_many_to_many_recovers_failed_elements() {
    let recovering = config(StepOverride::new().recover_on_failure(true));
    let outputs: Vec<u32> = run_step(Step::many_to_many(Halve), recovering, stream::iter(vec![4u32, 5, 8]))
        .map(|r| r.unwrap())
        .collect()
        .await;
    assert_eq!(outputs, vec![2, 0, 4]);

    let strict: Vec<_> = run_step(Step::many_to_many(Halve), EffectiveConfig::default(), stream::iter(vec![4u32, 5, 8]))
        .collect()
        .await;
    assert_eq!(strict.len(), 3);
    assert!(matches!(strict[1], Err(ExecutionError::ElementFailed { step: "halve", .. })));
}
