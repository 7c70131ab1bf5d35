use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use throttler::config::ThrottlerConfig;
use throttler::ratelimit::{KeyBuilder, LimiterIdentity, Quota, QuotaRegistry, RateLimiter, Verdict};
use throttler::store;

/// Inspect and operate job rate limits.
#[derive(Debug, Parser)]
#[command(name = "throttler", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count one call against a worker's quota and print the verdict
    Check(Target),
    /// Clear the counter a call would be counted under
    Reset(Target),
    /// Print the counter key a call would be counted under
    Key(Target),
    /// Load the configuration and quota rules, then list the quotas
    Validate,
}

#[derive(Debug, Args)]
struct Target {
    /// Worker type name
    #[arg(short, long)]
    worker: String,

    /// Queue name
    #[arg(short, long, default_value = "default")]
    queue: String,

    /// Job arguments as a JSON array
    #[arg(short, long, default_value = "[]")]
    args: String,
}

impl Target {
    fn identity(&self) -> anyhow::Result<LimiterIdentity> {
        let args: Vec<Value> = serde_json::from_str(&self.args)
            .with_context(|| format!("--args must be a JSON array, got {}", self.args))?;
        Ok(LimiterIdentity::new(self.worker.clone(), args, self.queue.clone()))
    }

    fn quota<'a>(&self, quotas: &'a QuotaRegistry) -> anyhow::Result<&'a Quota> {
        quotas
            .get(&self.worker)
            .ok_or_else(|| anyhow!("no quota configured for worker {}", self.worker))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = ThrottlerConfig::load(cli.config.as_deref())?;
    let quotas = config.load_quotas()?;
    info!(quotas = quotas.len(), "Quota rules loaded");

    let keys = KeyBuilder::new(config.key_prefix.clone());

    match &cli.command {
        Command::Validate => {
            for (worker, quota) in quotas.iter() {
                print_quota(worker, quota, cli.json);
            }
        }
        Command::Key(target) => {
            let key = keys.build(&target.identity()?, target.quota(&quotas)?);
            if cli.json {
                println!("{}", json!({ "key": key.as_str() }));
            } else {
                println!("{}", key);
            }
        }
        Command::Check(target) => {
            let identity = target.identity()?;
            let quota = target.quota(&quotas)?;
            let limiter = RateLimiter::with_key_builder(store::connect(&config.storage).await?, keys);

            let verdict = limiter.check(&identity, quota).await?;
            print_verdict(&verdict, quota, cli.json);
        }
        Command::Reset(target) => {
            let identity = target.identity()?;
            let quota = target.quota(&quotas)?;
            let limiter = RateLimiter::with_key_builder(store::connect(&config.storage).await?, keys);

            limiter.reset(&identity, quota).await?;
            info!(worker = %identity.worker, queue = %identity.queue, "Counter reset");
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_quota(worker: &str, quota: &Quota, as_json: bool) {
    if as_json {
        println!(
            "{}",
            json!({
                "worker": worker,
                "limit": quota.limit(),
                "period_secs": quota.period().as_secs_f64(),
                "per": quota.scope().as_str(),
                "cost": quota.cost(),
                "key": quota.key(),
                "name": quota.name(),
            })
        );
    } else {
        println!(
            "{}: {} per {:?} (per {}, cost {})",
            worker,
            quota.limit(),
            quota.period(),
            quota.scope().as_str(),
            quota.cost()
        );
    }
}

fn print_verdict(verdict: &Verdict, quota: &Quota, as_json: bool) {
    let delay = verdict.delay().unwrap_or(Duration::ZERO);

    if as_json {
        println!(
            "{}",
            json!({
                "within_bounds": verdict.is_within_bounds(),
                "count": verdict.count(),
                "limit": quota.limit(),
                "delay_secs": delay.as_secs_f64(),
            })
        );
    } else if verdict.is_within_bounds() {
        println!("within bounds ({}/{})", verdict.count(), quota.limit());
    } else {
        println!(
            "exceeded ({}/{}), retry in {:.3}s",
            verdict.count(),
            quota.limit(),
            delay.as_secs_f64()
        );
    }
}
