/*!
Posture auditor command line
*/

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Arg, ArgAction, ArgMatches, Command, crate_version};
use tracing::{error, info, warn};

use posture_auditor::core::{
    auditor::Auditor,
    config::AuditorConfig,
    logging::{LogConfig, init_logging},
    registry,
};

const EXIT_FAILURES: u8 = 1;
const EXIT_STARTUP: u8 = 2;

fn command() -> Command {
    Command::new("posture-auditor")
        .version(crate_version!())
        .about("Audits a cloud account against registered security checks and delivers the findings")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Path to the auditor configuration file")
                .value_name("PATH"),
        )
        .arg(
            Arg::new("groups")
                .short('g')
                .long("groups")
                .help("Comma-separated check groups to run instead of the configured ones")
                .value_name("GROUPS")
                .value_delimiter(','),
        )
        .arg(
            Arg::new("outputs")
                .short('o')
                .long("outputs")
                .help("Comma-separated output providers to use instead of the configured ones")
                .value_name("PROVIDERS")
                .value_delimiter(','),
        )
        .arg(
            Arg::new("list-checks")
                .long("list-checks")
                .help("Print the check catalog and exit")
                .action(ArgAction::SetTrue),
        )
}

fn list_checks() -> ExitCode {
    match registry::global() {
        Ok(registry) => {
            for (group, check) in registry.describe() {
                println!("{group}\t{check}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Check catalog error: {e}");
            ExitCode::from(EXIT_STARTUP)
        }
    }
}

async fn load_config(matches: &ArgMatches) -> Result<AuditorConfig, String> {
    let path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .or_else(AuditorConfig::default_path)
        .ok_or("no --config given and no default config directory on this platform")?;

    let mut config = AuditorConfig::from_file(&path)
        .await
        .map_err(|e| e.to_string())?;
    config.merge_env();

    if let Some(groups) = list_arg(matches, "groups") {
        config.run.groups = groups;
    }
    if let Some(outputs) = list_arg(matches, "outputs") {
        config.outputs.providers = outputs;
    }
    Ok(config)
}

/// Comma-separated values with surrounding whitespace and empty entries removed
fn list_arg(matches: &ArgMatches, id: &str) -> Option<Vec<String>> {
    matches.get_many::<String>(id).map(|values| {
        values
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(String::from)
            .collect()
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = command().get_matches();

    if matches.get_flag("list-checks") {
        return list_checks();
    }

    let config = match load_config(&matches).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    if let Err(e) = init_logging(&LogConfig::from(&config.logging)) {
        eprintln!("Failed to initialise logging: {e}");
    }

    let mut auditor = match Auditor::new(config).await {
        Ok(auditor) => auditor,
        Err(e) => {
            error!("Startup failed: {}", e);
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    tokio::select! {
        result = auditor.run() => match result {
            Ok(summary) if summary.has_failures() => ExitCode::from(EXIT_FAILURES),
            Ok(summary) => {
                info!(
                    "{} findings delivered to {} outputs",
                    summary.report.findings.len(),
                    summary.dispatch.delivered.len()
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Audit failed: {}", e);
                ExitCode::from(if e.is_startup() { EXIT_STARTUP } else { EXIT_FAILURES })
            }
        },
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted before the audit finished");
            ExitCode::from(EXIT_FAILURES)
        }
    }
}
