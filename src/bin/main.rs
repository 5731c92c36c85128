use std::{error::Error, process::ExitCode};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use keypath_lifecycle::{
    cli::{Cli, Commands, parse_args},
    config::{default_config_path, load_config},
    engine::LifecycleEngine,
    status::{OverallHealth, ServiceHealthSnapshot},
};

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    let config = load_config(args.config.as_deref())?;
    let config_file = args.config.clone().unwrap_or_else(default_config_path);
    debug!("Using settings file {}", config_file.display());
    let engine = LifecycleEngine::from_config(config, Some(config_file));

    let code = match args.command {
        Commands::Detect { json } => {
            let result = engine.detect_conflicts().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{}", result.summary);
                for conflict in &result.conflicts {
                    println!("  - {conflict}");
                }
                if !result.is_clear() {
                    println!(
                        "Auto-resolvable: {}",
                        if result.can_auto_resolve { "yes" } else { "no" }
                    );
                }
            }
            exit_code(result.is_clear())
        }
        Commands::Status { json } => {
            let snapshot = engine.get_service_status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_status(&snapshot);
            }
            exit_code(snapshot.overall_health != OverallHealth::Failing)
        }
        Commands::CanFix { action } => {
            let applicable = engine.can_auto_fix(action);
            println!("{action}: {}", if applicable { "yes" } else { "no" });
            exit_code(applicable)
        }
        Commands::Fix { action, json } => {
            let outcome = engine.perform_auto_fix_detailed(action).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!(
                    "{action}: {} ({})",
                    if outcome.resolved {
                        "resolved"
                    } else if outcome.attempted {
                        "attempted"
                    } else {
                        "failed"
                    },
                    outcome.detail
                );
                for diagnosis in &outcome.diagnoses {
                    println!(
                        "  - {} [{}]: {}",
                        diagnosis.service, diagnosis.kind, diagnosis.remediation
                    );
                }
            }
            exit_code(outcome.attempted)
        }
        Commands::Diagnose { service } => {
            for diagnosis in engine.diagnose(service).await {
                println!("{} [{}]", diagnosis.service, diagnosis.kind);
                if let Some(evidence) = &diagnosis.evidence {
                    println!("  evidence: {evidence}");
                }
                println!("  {}", diagnosis.remediation);
            }
            ExitCode::SUCCESS
        }
        Commands::Render { service } => {
            info!("Rendering unit for {}", service.label());
            print!("{}", engine.render_unit(service)?);
            ExitCode::SUCCESS
        }
    };

    Ok(code)
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.directive())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_status(snapshot: &ServiceHealthSnapshot) {
    println!(
        "{:<14} {:<8} {:<8} {:<10} {:<8} {:<6}",
        "SERVICE", "LOADED", "HEALTHY", "PHASE", "PID", "EXIT"
    );
    for status in &snapshot.services {
        println!(
            "{:<14} {:<8} {:<8} {:<10} {:<8} {:<6}",
            status.id.to_string(),
            status.loaded,
            status.healthy,
            format!("{:?}", status.phase).to_lowercase(),
            status.pid.map_or_else(|| "-".to_string(), |pid| pid.to_string()),
            status
                .last_exit_code
                .map_or_else(|| "-".to_string(), |code| code.to_string()),
        );
    }
    println!("Overall: {:?}", snapshot.overall_health);
}
