//! Basic usage of the pipeline runner.
//!
//! This example demonstrates:
//! - Implementing a one-to-one step and a many-to-one step
//! - Chaining steps with `.start_with` / `.then`
//! - Per-step overrides for retry and parallelism
//! - Dead-letter recovery for inputs that cannot be parsed

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use pipestep::{
    ConcurrencyStrategy, FnStep, ManyToOne, OneToOne, Pipeline, Step, StepError, StepOverride,
};

/// Parse a string into a number.
struct ParseStep;

#[async_trait]
impl OneToOne for ParseStep {
    type Input = String;
    type Output = i64;

    fn name(&self) -> &'static str {
        "parse"
    }

    async fn apply(&self, input: String) -> Result<i64, StepError> {
        println!("[{}] Parsing {:?}", self.name(), input);
        input
            .trim()
            .parse::<i64>()
            .map_err(|e| StepError::msg(format!("failed to parse '{input}': {e}")))
    }

    // Unparseable input counts as zero.
    async fn recover(&self, input: String, cause: &StepError) -> Option<Result<i64, StepError>> {
        println!("[{}] Recovering {:?}: {}", self.name(), input, cause);
        Some(Ok(0))
    }
}

/// Sum every parsed number.
struct SumStep;

#[async_trait]
impl ManyToOne for SumStep {
    type Input = i64;
    type Output = i64;

    fn name(&self) -> &'static str {
        "sum"
    }

    async fn apply(&self, inputs: BoxStream<'static, i64>) -> Result<i64, StepError> {
        Ok(inputs.fold(0, |acc, n| async move { acc + n }).await)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("=== Pipestep - Basic Example ===\n");

    let double = FnStep::new("double", |n: i64| async move {
        println!("[double] {} -> {}", n, n * 2);
        Ok::<_, StepError>(n * 2)
    });

    // 1. Parse each string, recovering bad ones as zero
    // 2. Double in parallel, keeping input order
    // 3. Sum the lot
    let pipeline = Pipeline::new("basic_example")
        .start_with(Step::one_to_one(ParseStep))
        .with_override(StepOverride::new().recover_on_failure(true))
        .then(double.into_step())
        .with_override(
            StepOverride::new()
                .parallel(true)
                .concurrency_strategy(ConcurrencyStrategy::Concatenate)
                .retry_limit(2),
        )
        .then(Step::many_to_one(SumStep))
        .build()?;

    let inputs = ["1", "2", "not a number", "4"]
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>();

    println!("--- Running {} inputs ---", inputs.len());
    let results = pipeline.run_all(inputs).await;
    for result in results {
        match result {
            Ok(total) => println!("\nTotal: {total}"),
            Err(e) => eprintln!("\nPipeline failed: {e}"),
        }
    }

    println!("\n--- Graph ---");
    println!("{}", serde_json::to_string_pretty(&pipeline.to_graph())?);

    println!("\n=== Example complete ===");
    Ok(())
}
