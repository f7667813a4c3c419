use clap::{Parser, Subcommand};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{GatekeeperConfig, LoggingConfig};
use gatekeeper::ratelimit::{DecisionCounters, RateLimitDecision, RateLimiter, RequestIdentity};

#[derive(Parser, Debug)]
#[command(name = "gatekeeper", version, about = "Distributed admission control")]
struct Cli {
    /// YAML configuration file; GATEKEEPER__* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the resolved route table
    Routes,

    /// Run admission decisions and print them as JSON
    Check {
        /// Route class to charge
        #[arg(short, long)]
        route: String,

        /// Authenticated user id
        #[arg(short, long, conflicts_with_all = ["ip", "user_agent"])]
        user: Option<String>,

        /// Client IP address for anonymous requests
        #[arg(long)]
        ip: Option<IpAddr>,

        /// Client User-Agent for anonymous requests
        #[arg(long)]
        user_agent: Option<String>,

        /// Number of requests to make
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },
}

#[derive(Serialize)]
struct RouteRow<'a> {
    route: &'a str,
    window_ms: u64,
    max_requests: u64,
    skip_successful_requests: bool,
    skip_failed_requests: bool,
}

#[derive(Serialize)]
struct CheckReport<'a> {
    decisions: &'a [RateLimitDecision],
    health: gatekeeper::ratelimit::HealthState,
    counters: std::collections::BTreeMap<String, gatekeeper::ratelimit::RouteCounts>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match GatekeeperConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(&LoggingConfig::default());
            error!(error = %e, "Failed to load configuration");
            return Err(e.into());
        }
    };
    init_tracing(&config.logging);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Routes => print_routes(&config),
        Command::Check {
            route,
            user,
            ip,
            user_agent,
            count,
        } => {
            let identity = match user {
                Some(user) => RequestIdentity::authenticated(user),
                None => RequestIdentity::anonymous(ip, user_agent.as_deref()),
            };
            run_checks(&config, &identity, &route, count).await
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    // Logs go to stderr so stdout stays clean JSON.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.with_thread_ids(true).init();
    }
}

fn print_routes(config: &GatekeeperConfig) -> anyhow::Result<()> {
    let registry = match config.build_registry() {
        Ok(registry) => registry,
        Err(e) => {
            error!(error = %e, "Invalid route configuration");
            return Err(e.into());
        }
    };

    let rows: Vec<RouteRow<'_>> = registry
        .routes()
        .into_iter()
        .map(|(route, rule)| RouteRow {
            route,
            window_ms: rule.window_ms,
            max_requests: rule.max_requests,
            skip_successful_requests: rule.skip_successful_requests,
            skip_failed_requests: rule.skip_failed_requests,
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

async fn run_checks(
    config: &GatekeeperConfig,
    identity: &RequestIdentity,
    route: &str,
    count: u32,
) -> anyhow::Result<()> {
    let counters = Arc::new(DecisionCounters::new());

    let limiter = match RateLimiter::builder_from_config(config) {
        Ok(builder) => builder.metrics(counters.clone()).start(),
        Err(e) => {
            error!(error = %e, "Failed to initialize rate limiter");
            return Err(e.into());
        }
    };

    let mut decisions = Vec::with_capacity(count as usize);
    for _ in 0..count {
        decisions.push(limiter.check_and_consume(identity, route).await?);
    }

    let report = CheckReport {
        decisions: &decisions,
        health: limiter.health(),
        counters: counters.snapshot(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
