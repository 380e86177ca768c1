//! Command-line front end for the volley dispatch engine.

pub mod cli;
pub mod config;
pub mod console;

use std::{path::Path, process::ExitCode, sync::Arc};

use anyhow::Context;
use tokio::sync::broadcast::{self, error::RecvError};
use volley_common::{address::parse_recipient_list, internal};
use volley_dispatch::{
    BroadcastSink, DispatchError, Dispatcher, EventSink, JobEvent, JobId, JobSnapshot, JobState,
    TracingSink,
};

use crate::{
    cli::{Cli, Commands, Output},
    config::{JobOverrides, load_config, load_job},
};

/// Runs one command line invocation.
///
/// # Errors
///
/// Anything that keeps the command from running: unreadable or invalid
/// files, a rejected job, or a failure to set up TLS.
pub async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Send {
            job,
            recipients,
            relays,
            workers,
            output,
        } => {
            let overrides = JobOverrides {
                recipients: recipients.as_deref(),
                relays: relays.as_deref(),
                workers,
            };
            send(cli.config.as_deref(), &job, &overrides, output).await
        }
        Commands::Check { list } => check(&list),
    }
}

async fn send(
    config: Option<&Path>,
    job: &Path,
    overrides: &JobOverrides<'_>,
    output: Output,
) -> anyhow::Result<ExitCode> {
    let config = load_config(config)?;
    let request = load_job(job, overrides)?;

    let (sink, events) = match output {
        Output::Console => {
            let broadcast = BroadcastSink::new(config.event_capacity);
            let events = broadcast.subscribe();
            let sink: Arc<dyn EventSink> = Arc::new(broadcast);
            (sink, Some(events))
        }
        Output::Log => {
            let sink: Arc<dyn EventSink> = Arc::new(TracingSink);
            (sink, None)
        }
    };

    let dispatcher =
        Dispatcher::smtp(config, sink).context("Failed to set up the SMTP transport")?;
    let id = dispatcher.submit(request).context("Job rejected")?;
    println!("Submitted job {id}");

    let snapshot = follow(&dispatcher, id, events).await?;
    println!("{}", console::format_summary(&snapshot));

    Ok(match snapshot.state {
        JobState::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

/// Prints events until the job is terminal. The first Ctrl-C cancels the
/// job; the workers are then left to wind down.
async fn follow(
    dispatcher: &Dispatcher,
    id: JobId,
    mut events: Option<broadcast::Receiver<JobEvent>>,
) -> anyhow::Result<JobSnapshot> {
    let wait = dispatcher.wait(id);
    tokio::pin!(wait);

    let mut stopping = false;
    let mut listening = events.is_some();
    let snapshot = loop {
        tokio::select! {
            snapshot = &mut wait => break snapshot?,

            event = next_event(events.as_mut()), if listening => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => eprintln!("({skipped} events skipped)"),
                Err(RecvError::Closed) => listening = false,
            },

            signal = tokio::signal::ctrl_c(), if !stopping => {
                signal.context("Failed to listen for Ctrl-C")?;
                stopping = true;
                eprintln!("Stopping, waiting for workers to wind down");

                match dispatcher.cancel(id) {
                    Ok(()) | Err(DispatchError::AlreadyFinished(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
    };

    if let Some(events) = events.as_mut() {
        while let Ok(event) = events.try_recv() {
            print_event(&event);
        }
    }

    internal!(level = DEBUG, "Job {id} finished");
    Ok(snapshot)
}

async fn next_event(
    events: Option<&mut broadcast::Receiver<JobEvent>>,
) -> Result<JobEvent, RecvError> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

fn print_event(event: &JobEvent) {
    if let Some(line) = console::format_event(&event.event) {
        println!("{line}");
    }
}

fn check(list: &Path) -> anyhow::Result<ExitCode> {
    let text = std::fs::read_to_string(list)
        .with_context(|| format!("Failed to read {}", list.display()))?;
    let parsed = parse_recipient_list(&text);

    for line in &parsed.invalid {
        println!("invalid: {line}");
    }
    println!(
        "{} valid, {} invalid",
        parsed.valid.len(),
        parsed.invalid.len()
    );
    tracing::debug!("Checked {}", list.display());

    Ok(if parsed.invalid.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
