use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use rmp_messaging::ManagerConfig;
use rmp_sim::{LinkSimulation, LossScenario, PRACTICAL_BASELINE};
use tracing::{error, info};

#[derive(Parser)]
#[command(author, version, about = "Run the reliable messaging engine over a lossy link", long_about = None)]
struct Cli {
    /// Path to a TOML manager configuration
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Percentage of packets dropped in each direction
    #[arg(long, default_value_t = PRACTICAL_BASELINE.loss_rate_percent)]
    loss: u8,
    /// Seed for the loss pattern
    #[arg(long, env = "RMP_SIM_SEED", default_value_t = PRACTICAL_BASELINE.seed)]
    seed: u64,
    /// Number of ack-requested messages to send
    #[arg(long, default_value_t = 100)]
    messages: usize,
    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    let filter = std::env::var("RMP_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match ManagerConfig::from_file(path) {
            Ok(config) => config,
            Err(err) => {
                error!("Failed to load config: {err}");
                return ExitCode::FAILURE;
            }
        },
        None => ManagerConfig::default(),
    };
    let scenario = LossScenario {
        loss_rate_percent: cli.loss,
        seed: cli.seed,
    };
    info!(
        loss = scenario.loss_rate_percent,
        seed = scenario.seed,
        messages = cli.messages,
        "starting simulation"
    );

    let report = match LinkSimulation::new(&config, scenario).and_then(|sim| sim.run(cli.messages)) {
        Ok(report) => report,
        Err(err) => {
            error!("Simulation failed: {err}");
            return ExitCode::FAILURE;
        }
    };

    if cli.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                error!("Failed to encode report: {err}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        println!(
            "messages={} delivered={} acked={} exhausted={} retransmissions={} standalone_acks={} piggybacked_acks={} duplicates={} dropped={} elapsed_ms={}",
            report.messages,
            report.delivered,
            report.acked,
            report.exhausted,
            report.retransmissions,
            report.standalone_acks,
            report.piggybacked_acks,
            report.duplicates,
            report.dropped,
            report.elapsed_ms,
        );
    }

    if report.is_settled() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
