//! Flow event follower (`treq watch`).

use anyhow::{Context, Result, bail};
use console::style;

use treq::client::{HttpRunnerApi, RunnerApi, StreamMessage};
use treq::flow::models::CONNECTED_EVENT;

use super::run::print_event;
use crate::RemoteArgs;

const FLOW_FINISHED: &str = "flowFinished";

pub async fn cmd_watch(flow_id: &str, remote: &RemoteArgs) -> Result<()> {
    let api = HttpRunnerApi::connect(&remote.server, remote.token.clone())
        .await
        .with_context(|| format!("treq server is not reachable at {}", remote.server))?;
    let mut subscription = api
        .subscribe(flow_id)
        .await
        .with_context(|| format!("Failed to subscribe to flow {}", flow_id))?;

    loop {
        let message = tokio::select! {
            message = subscription.events.recv() => message,
            _ = tokio::signal::ctrl_c() => None,
        };
        match message {
            Some(StreamMessage::Event(envelope)) => {
                if envelope.event_type == CONNECTED_EVENT {
                    println!("{} watching flow {}", style("●").green(), flow_id);
                    continue;
                }
                if envelope.is_transport_frame() {
                    continue;
                }
                print!(
                    "{} {} ",
                    style(format!("#{}", envelope.seq)).dim(),
                    style(&envelope.run_id).cyan()
                );
                if let Some(id) = &envelope.req_exec_id {
                    print!("{} ", style(id).dim());
                }
                print_event(&envelope);
                if envelope.event_type == FLOW_FINISHED {
                    break;
                }
            }
            Some(StreamMessage::Broken(reason)) => {
                bail!("Event stream for flow {} broke: {}", flow_id, reason)
            }
            None => break,
        }
    }

    subscription.abort.cancel();
    Ok(())
}
