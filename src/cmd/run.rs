//! Script and test run command (`treq run`).

use anyhow::{Context, Result, bail};
use console::style;
use dialoguer::{Select, theme::ColorfulTheme};
use std::io::Write;
use std::sync::Arc;

use treq::client::{HttpRunnerApi, RunOutcome, RunnerClient, SubscriptionStatus};
use treq::flow::{EventEnvelope, FlowEvent, OutputStream};
use treq::runner::{RunKind, RunnerOption};

use crate::RemoteArgs;

pub async fn cmd_run(
    path: &str,
    test: bool,
    runner: Option<&str>,
    remote: &RemoteArgs,
) -> Result<()> {
    let kind = if test { RunKind::Test } else { RunKind::Script };
    let api = HttpRunnerApi::connect(&remote.server, remote.token.clone())
        .await
        .with_context(|| format!("treq server is not reachable at {}", remote.server))?;
    let (client, mut events) = RunnerClient::new(Arc::new(api), kind);

    let mut outcome = match runner {
        Some(runner_id) => client.run_with(path, runner_id).await,
        None => client.run(path).await,
    };
    while let RunOutcome::AwaitingSelection(options) = &outcome {
        match choose_runner(path, options)? {
            Some(id) => outcome = client.select_runner(&id).await,
            None => {
                client.close_selection();
                println!("No runner selected.");
                return Ok(());
            }
        }
    }

    match outcome {
        RunOutcome::Started { run_id } => {
            tracing::debug!(run_id = %run_id, flow_id = ?client.flow_id(), "run started");
        }
        RunOutcome::NoRunner => bail!("No installed {} runner can run {}", kind, path),
        RunOutcome::Disconnected => bail!("Lost connection to the treq server"),
        RunOutcome::Cancelled => return Ok(()),
        RunOutcome::Failed(message) => bail!("Failed to start {}: {}", path, message),
        RunOutcome::Ignored | RunOutcome::AwaitingSelection(_) => {
            bail!("Another run is already in progress")
        }
    }

    enum Next {
        Event(Option<EventEnvelope>),
        Status(SubscriptionStatus),
        Interrupt,
    }

    let mut status = client.watch_status();
    // The run may already be closed; observe the current value first.
    status.mark_changed();
    let mut result = None;
    loop {
        let next = tokio::select! {
            envelope = events.recv() => Next::Event(envelope),
            changed = status.changed() => match changed {
                Ok(()) => Next::Status(*status.borrow()),
                Err(_) => Next::Status(SubscriptionStatus::Idle),
            },
            _ = tokio::signal::ctrl_c() => Next::Interrupt,
        };
        match next {
            Next::Event(Some(envelope)) => {
                if let Some(done) = print_event(&envelope) {
                    result = Some(done);
                }
            }
            Next::Event(None) => break,
            Next::Status(SubscriptionStatus::Open | SubscriptionStatus::Connecting) => {}
            Next::Status(final_status) => {
                while let Ok(envelope) = events.try_recv() {
                    if let Some(done) = print_event(&envelope) {
                        result = Some(done);
                    }
                }
                if final_status == SubscriptionStatus::Error && result.is_none() {
                    bail!("Event stream broke before the run finished");
                }
                break;
            }
            Next::Interrupt => {
                client.cancel().await;
                println!("\n{}", style("Run cancelled.").yellow());
                return Ok(());
            }
        }
    }

    match result {
        Some(Ok(())) | None => Ok(()),
        Some(Err(message)) => bail!(message),
    }
}

fn choose_runner(path: &str, options: &[RunnerOption]) -> Result<Option<String>> {
    let labels: Vec<String> = options
        .iter()
        .map(|o| format!("{} ({})", o.label, o.id))
        .collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Several runners can run {}", path))
        .items(&labels)
        .default(0)
        .interact_opt()?;
    Ok(selection.map(|i| options[i].id.clone()))
}

/// Print one envelope. Returns the outcome when it ends the execution.
pub fn print_event(envelope: &EventEnvelope) -> Option<std::result::Result<(), String>> {
    let Some(event) = envelope.event() else {
        if !envelope.is_transport_frame() {
            println!("{}", style(&envelope.event_type).dim());
        }
        return None;
    };

    match event {
        FlowEvent::ScriptOutput { stream, data } | FlowEvent::TestOutput { stream, data } => {
            match stream {
                OutputStream::Stdout => {
                    print!("{}", data);
                    let _ = std::io::stdout().flush();
                }
                OutputStream::Stderr => eprint!("{}", data),
            }
        }
        FlowEvent::ScriptStarted { file_path, runner } => {
            println!("{} {} {}", style("▶").cyan(), style(runner).yellow(), file_path);
        }
        FlowEvent::TestStarted {
            file_path,
            framework,
        } => {
            println!("{} {} {}", style("▶").cyan(), style(framework).yellow(), file_path);
        }
        FlowEvent::ScriptFinished { exit_code } | FlowEvent::TestFinished { exit_code } => {
            let code = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());
            println!("{}", style(format!("exited ({})", code)).dim());
        }
        FlowEvent::FetchStarted { url, method } => {
            println!("{} {} {}", style("→").cyan(), method, url);
        }
        FlowEvent::FetchFinished { status, .. } => {
            println!("{} {}", style("←").cyan(), status);
        }
        FlowEvent::ExecutionSucceeded { duration_ms, .. } => {
            println!("{} finished in {}ms", style("✓").green().bold(), duration_ms);
            return Some(Ok(()));
        }
        FlowEvent::ExecutionFailed { stage, message } => {
            println!("{} {}: {}", style("✗").red().bold(), stage, message);
            return Some(Err(message));
        }
        FlowEvent::FlowFinished { summary } => {
            println!(
                "{} {} executions, {} succeeded, {} failed in {}ms",
                style("■").cyan(),
                summary.total,
                summary.succeeded,
                summary.failed,
                summary.duration_ms
            );
        }
        other => {
            println!("{}", style(other.event_type()).dim());
        }
    }
    None
}
