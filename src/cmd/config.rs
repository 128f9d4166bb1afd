//! Configuration view and validation commands (`treq config`).

use anyhow::Result;
use std::path::Path;

use treq::config::{TreqToml, project_config_path};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("treq Configuration");
            println!("==================");
            println!();

            let (mut toml, source) = TreqToml::discover(project_dir)?;
            match &source {
                Some(path) => println!("Config file: {}", path.display()),
                None => println!("No treq.toml found, using defaults"),
            }
            let env_warnings = toml.apply_env();
            println!();

            println!("[server]");
            println!("  host = \"{}\"", toml.server.host);
            println!("  port = {}", toml.server.port);
            println!("  dev_mode = {}", toml.server.dev_mode);
            println!();

            println!("[flows]");
            println!("  finished_ttl_secs = {}", toml.flows.finished_ttl_secs);
            println!("  idle_ttl_secs = {}", toml.flows.idle_ttl_secs);
            println!("  sweep_interval_secs = {}", toml.flows.sweep_interval_secs);
            println!();

            println!("[events]");
            println!("  heartbeat_secs = {}", toml.events.heartbeat_secs);
            println!("  subscriber_buffer = {}", toml.events.subscriber_buffer);
            println!("  replay_window = {}", toml.events.replay_window);
            println!();

            if !toml.runners.preferred.is_empty() {
                println!("[runners.preferred]");
                let mut preferred: Vec<_> = toml.runners.preferred.iter().collect();
                preferred.sort();
                for (ext, runner) in preferred {
                    println!("  {} = \"{}\"", ext, runner);
                }
                println!();
            }

            for warning in env_warnings {
                println!("warning: {}", warning);
            }
            if source.is_none() {
                println!("Run 'treq config init' to create a treq.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let (toml, source) = TreqToml::discover(project_dir)?;
            if source.is_none() {
                println!("No treq.toml found. Using defaults (valid).");
                return Ok(());
            }

            let warnings = toml.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            let config_path = project_config_path(project_dir);
            if config_path.exists() {
                println!("treq.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            TreqToml::default().save(&config_path)?;

            println!("Created treq.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, dev_mode");
            println!("  - [flows] retention and sweep interval");
            println!("  - [runners.preferred] runner per file extension");
            println!();
        }
    }

    Ok(())
}
