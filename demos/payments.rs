//! Payment batches through a simulated remote ledger.
//!
//! Each batch file is split into payment records, every record is sent,
//! acknowledged and confirmed against a flaky in-memory "ledger", and the
//! confirmed amounts are totalled per batch.
//!
//! Run with `RUST_LOG=pipestep=debug` to watch retries, and tune the
//! orchestrator through `PIPESTEP_CONCURRENCY_LIMIT_RECORDS`,
//! `PIPESTEP_MAX_RETRIES` and `PIPESTEP_INITIAL_RETRY_DELAY_MS`.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use pipestep::{
    ManyToOne, OneToMany, OrchestratorConfig, RemoteError, RemoteStep, StatusCode, Step,
    StepError, UnitOrchestrator,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone)]
struct Payment {
    id: u64,
    cents: u64,
}

/// Splits "batch-<count>" into `count` payments.
struct ReadBatch;

#[async_trait]
impl OneToMany for ReadBatch {
    type Input = String;
    type Output = Payment;

    fn name(&self) -> &'static str {
        "read_batch"
    }

    async fn apply(
        &self,
        batch: String,
    ) -> Result<BoxStream<'static, Result<Payment, StepError>>, StepError> {
        let count = batch
            .strip_prefix("batch-")
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| StepError::msg(format!("cannot read {batch}")))?;
        let payments = (1..=count).map(|id| {
            Ok(Payment {
                id,
                cents: id * 125,
            })
        });
        Ok(stream::iter(payments).boxed())
    }
}

struct Settle;

#[async_trait]
impl ManyToOne for Settle {
    type Input = Payment;
    type Output = u64;

    fn name(&self) -> &'static str {
        "settle"
    }

    async fn apply(&self, confirmed: BoxStream<'static, Payment>) -> Result<u64, StepError> {
        Ok(confirmed.fold(0, |acc, p| async move { acc + p.cents }).await)
    }
}

/// Ledger call that is throttled on every `every`-th request.
fn ledger(name: &'static str, every: u64) -> Step<Payment, Payment> {
    let requests = Arc::new(AtomicU64::new(0));
    RemoteStep::new(name, move |payment: Payment| {
        let requests = requests.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if requests.fetch_add(1, Ordering::SeqCst) % every == every - 1 {
                return Err(RemoteError::new(StatusCode::ResourceExhausted, "ledger busy"));
            }
            Ok(payment)
        }
    })
    .into_step()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pipestep=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = OrchestratorConfig::from_env()?;
    tracing::info!(?config, "Starting payment run");

    let orchestrator = UnitOrchestrator::builder(config).build(
        Step::one_to_many(ReadBatch),
        ledger("send", 7),
        ledger("acknowledge", 11),
        RemoteStep::<Payment, Payment>::new("status", |payment: Payment| async move {
            if payment.id == 13 {
                Err(RemoteError::new(StatusCode::FailedPrecondition, "payment voided"))
            } else {
                Ok(payment)
            }
        })
        .into_step(),
        Step::many_to_one(Settle),
    )?;

    let batches = ["batch-5", "batch-12", "batch-20", "batch-x"].map(String::from);
    for outcome in orchestrator.process_all(batches).await {
        match outcome.result {
            Ok(cents) => println!("{}: settled {}.{:02}", outcome.unit_id, cents / 100, cents % 100),
            Err(e) => println!("{}: {e}", outcome.unit_id),
        }
    }

    Ok(())
}
