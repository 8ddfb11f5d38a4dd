//! Stability sweep - drive many messages through the in-memory topology.
//!
//! Every message carries the same stability instruction and is redelivered
//! immediately (no backoff delay) up to `--max-attempts` times. The sweep
//! prints how many messages were consumed, how many faulted, the observed
//! per-attempt failure rate and the total number of deliveries.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin stability_sweep -- --messages 1000 --instruction flaky --seed 42
//! ```
//!
//! With retry bounds taken from a harness configuration file:
//! ```bash
//! cargo run --bin stability_sweep -- --config shakedown.toml --instruction failing
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures::future::join_all;
use shakedown::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "stability_sweep")]
#[command(about = "Measure observed outcomes of the fault-injecting consumer", long_about = None)]
struct Args {
    /// Number of messages to publish
    #[arg(long, default_value = "1000")]
    messages: usize,

    /// Stability instruction carried by every message (functional, flaky, failing)
    #[arg(long, default_value = "flaky", value_parser = parse_instruction)]
    instruction: StabilityInstruction,

    /// Seed for the consumer's entropy; the same seed reproduces the same counts
    /// (uses thread entropy if not provided)
    #[arg(long)]
    seed: Option<u64>,

    /// Delivery attempts per message (overrides the configuration file)
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Harness configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

fn parse_instruction(raw: &str) -> std::result::Result<StabilityInstruction, String> {
    StabilityInstruction::ALL
        .into_iter()
        .find(|i| i.as_header_value().eq_ignore_ascii_case(raw.trim()))
        .ok_or_else(|| format!("unknown instruction '{raw}', expected functional, flaky or failing"))
}

#[derive(Debug, Default)]
struct Tally {
    consumed: usize,
    faulted: usize,
    deliveries: u32,
}

async fn sweep<R: RandomProvider>(
    random: R,
    policy: RetryPolicy,
    args: &Args,
) -> (Tally, SignalLog) {
    let log = SignalLog::new();
    let consumer = FaultInjectingConsumer::new(random.clone(), Arc::new(log.clone()));
    let bus = InMemoryBus::new(consumer, policy, TokioTimeProvider::new());

    let handles: Vec<_> = (0..args.messages)
        .map(|_| {
            let message =
                Message::new(Payment::generate(&random)).with_instruction(args.instruction);
            bus.publish(message)
        })
        .collect();

    let mut tally = Tally::default();
    for report in join_all(handles).await {
        match report {
            Ok(report) => {
                tally.deliveries += report.attempts();
                if report.consumed() {
                    tally.consumed += 1;
                } else {
                    tally.faulted += 1;
                }
            }
            Err(err) => tracing::error!(error = %err, "delivery task failed"),
        }
    }
    bus.wait_idle().await;
    (tally, log)
}

// Deliveries draw from one shared entropy stream, so they must be polled in a
// fixed order for a seed to reproduce a run.
#[tokio::main(flavor = "current_thread")]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,stability_sweep=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let config = match &args.config {
        Some(path) => HarnessConfig::load(path)?,
        None => HarnessConfig::default(),
    };
    let mut policy = config.retry.policy()?.immediate();
    if let Some(max_attempts) = args.max_attempts {
        if max_attempts == 0 {
            return Err("--max-attempts must be at least 1".into());
        }
        policy = policy.with_max_attempts(max_attempts);
    }

    tracing::info!(
        messages = args.messages,
        instruction = %args.instruction,
        seed = ?args.seed,
        max_attempts = policy.max_attempts(),
        "starting stability sweep"
    );

    let (tally, log) = match args.seed {
        Some(seed) => sweep(SeededRandomProvider::new(seed), policy, &args).await,
        None => sweep(ThreadRandomProvider::new(), policy, &args).await,
    };

    let failed_attempts = log.count(ObservedOutcome::Failed);
    let failure_rate = if tally.deliveries == 0 {
        0.0
    } else {
        failed_attempts as f64 / f64::from(tally.deliveries)
    };

    println!("instruction:      {}", args.instruction);
    println!("messages:         {}", args.messages);
    println!("max attempts:     {}", policy.max_attempts());
    println!("consumed:         {}", tally.consumed);
    println!("faulted:          {}", tally.faulted);
    println!("deliveries:       {}", tally.deliveries);
    println!("failed attempts:  {failed_attempts}");
    println!("failure rate:     {failure_rate:.3}");

    Ok(())
}
