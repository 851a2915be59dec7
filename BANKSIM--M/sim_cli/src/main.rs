use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use banksim_simulationengine::{ReportFormat, ScenarioManager, SimulationConfig};
use clap::{Parser, Subcommand};
use serde_json::json;

#[derive(Parser, Debug)]
#[command(name = "banksim", version, about = "Bank client simulation scenario runner")]
struct Cli {
    /// Simulation config; built-in defaults apply when the file is absent.
    #[arg(long, global = true, default_value = "configs/simulation.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs a scenario template end to end.
    Run {
        /// Template path relative to the template directory.
        scenario: PathBuf,
        /// Also writes a report in this format (json or markdown).
        #[arg(long)]
        report: Option<ReportFormat>,
    },
    /// Checks a scenario template without running it.
    Validate {
        /// Template path relative to the template directory.
        scenario: PathBuf,
        /// Exits with an error when issues are found.
        #[arg(long)]
        strict: bool,
    },
    /// Lists templates under the template directory.
    List,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let mut manager = ScenarioManager::from_config(&config)?;
    match cli.command {
        Commands::Run { scenario, report } => {
            let scenario = manager.load_scenario(&scenario)?;
            let results = manager.run_full_simulation(&scenario)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "scenario_name": results.scenario_name,
                    "steps_completed": results.steps_completed,
                    "events_injected": results.events_injected,
                    "events_processed": results.events_processed,
                    "events_failed": results.events_failed,
                    "handler_failures": results.handler_failures,
                    "results_file": results.results_file,
                }))?
            );
            if let Some(format) = report {
                let path = manager.generate_report(scenario.name(), format)?;
                println!("report written to {}", path.display());
            }
            Ok(())
        }
        Commands::Validate { scenario, strict } => {
            let scenario = manager.load_scenario(&scenario)?;
            let validation = if strict {
                manager.validate_scenario_strict(&scenario)?
            } else {
                manager.validate_scenario(&scenario)
            };
            println!("{}", serde_json::to_string_pretty(&validation)?);
            Ok(())
        }
        Commands::List => {
            let listings = manager.list_available_scenarios();
            if listings.is_empty() {
                println!("no scenarios under {}", manager.template_directory().display());
            }
            for listing in listings {
                println!(
                    "{} | {:?} | {} steps | {} events | {}",
                    listing.name,
                    listing.difficulty_level,
                    listing.duration_steps,
                    listing.event_count,
                    listing.path.display()
                );
            }
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<SimulationConfig> {
    if path.exists() {
        SimulationConfig::load(path).with_context(|| format!("loading {}", path.display()))
    } else {
        Ok(SimulationConfig::default())
    }
}
