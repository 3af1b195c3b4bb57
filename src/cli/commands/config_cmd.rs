//! Configuration management commands.

use console::style;

use crate::cli::icons::{dim_arrow, error, success, warn};
use queue_worker::classify::OutcomeClassifier;
use queue_worker::config::{Config, Settings};

/// Print the resolved settings as JSON.
pub fn cmd_config_show(settings: &Settings, config: &Config) -> anyhow::Result<()> {
    match config.source_path {
        Some(ref path) => eprintln!("{} Config file: {}", dim_arrow(), path.display()),
        None => eprintln!("{} No config file found, using defaults", warn()),
    }
    println!("{}", serde_json::to_string_pretty(settings)?);
    Ok(())
}

/// Check that every configured command resolves and the fault signature compiles.
pub fn cmd_config_check(settings: &Settings) -> anyhow::Result<()> {
    let mut problems = 0;

    for (label, command) in settings.commands() {
        if command.is_available() {
            println!(
                "{} {:<8} {}",
                success(),
                label,
                style(command.display_with(&[])).dim()
            );
        } else {
            problems += 1;
            println!(
                "{} {:<8} '{}' not found",
                error(),
                label,
                command.command
            );
        }
    }

    match OutcomeClassifier::new(&settings.fault_signature) {
        Ok(classifier) => println!(
            "{} {:<8} {}",
            success(),
            "signature",
            style(classifier.signature()).dim()
        ),
        Err(e) => {
            problems += 1;
            println!("{} {:<8} {}", error(), "signature", e);
        }
    }

    if settings.broker_url.is_none() {
        println!(
            "{} No broker configured; only `exec` will work",
            warn()
        );
    }

    if problems > 0 {
        anyhow::bail!("{} configuration problem(s) found", problems);
    }
    Ok(())
}
