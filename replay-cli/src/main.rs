//! Instant replay recorder.
//!
//! Keeps the last few seconds of screen capture in a rolling buffer and
//! saves them to a file on request. Commands are read from stdin, one per
//! line; type `help` for the list.

mod cli;
mod panic_hook;

use std::future::Future;
use std::io::BufRead;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use replay_engine::{create_recorder, Recorder};
use replay_ipc::{command_channel, Notification, RecorderCommand, RecorderEvent};

use crate::cli::{CliCommand, HELP};

/// Initialize logging.
fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "instant_replay=info,replay_engine=debug,replay_pipeline=info,replay_buffer=info,replay_audio=info,replay_extract=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    panic_hook::install();
    info!("Instant replay starting");

    let recorder = Arc::new(create_recorder().context("Failed to create recorder")?);
    let (command_tx, command_rx) = command_channel();

    let events = recorder.subscribe();
    thread::Builder::new()
        .name("event-printer".to_string())
        .spawn(move || print_events(events))
        .context("Failed to start event thread")?;

    let engine = {
        let recorder = Arc::clone(&recorder);
        thread::Builder::new()
            .name("recorder".to_string())
            .spawn(move || recorder.run(command_rx))
            .context("Failed to start recorder thread")?
    };

    if recorder.should_start_on_launch() {
        info!("Starting recording on launch");
        send(&command_tx, RecorderCommand::Start);
    }

    println!("{HELP}");
    let mut lines = spawn_line_reader(std::io::BufReader::new(std::io::stdin()))?;
    control_loop(&recorder, &command_tx, &mut lines, interrupted()).await?;

    info!("Shutting down");
    send(&command_tx, RecorderCommand::Shutdown);
    tokio::task::spawn_blocking(move || engine.join())
        .await
        .context("Failed to wait for recorder")?
        .map_err(|_| anyhow::anyhow!("Recorder thread panicked"))?;

    info!("Instant replay stopped");
    Ok(())
}

/// Read lines on a plain thread.
///
/// A read blocked on an open terminal cannot be cancelled, so it must not
/// live on the runtime or the runtime would wait for it on exit. The
/// channel closes at end of input.
fn spawn_line_reader<R>(reader: R) -> Result<mpsc::UnboundedReceiver<String>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            }
        })
        .context("Failed to start stdin thread")?;
    Ok(rx)
}

/// Resolves on Ctrl-C. Never resolves if the handler cannot be installed.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Interrupted");
}

/// Handle commands until `quit`, end of input, or `interrupt` resolves.
async fn control_loop<F>(
    recorder: &Recorder,
    command_tx: &Sender<RecorderCommand>,
    lines: &mut mpsc::UnboundedReceiver<String>,
    interrupt: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else {
                    debug!("Stdin closed");
                    return Ok(());
                };
                match CliCommand::parse(&line) {
                    Ok(Some(CliCommand::Quit)) => return Ok(()),
                    Ok(Some(CliCommand::Help)) => println!("{HELP}"),
                    Ok(Some(CliCommand::Status)) => print_status(recorder),
                    Ok(Some(command)) => {
                        if let Some(command) = command.to_recorder_command() {
                            send(command_tx, command);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("{e}"),
                }
            }
            () = &mut interrupt => return Ok(()),
        }
    }
}

fn send(command_tx: &Sender<RecorderCommand>, command: RecorderCommand) {
    if let Err(e) = command_tx.try_send(command) {
        warn!("Failed to send command: {}", e);
    }
}

fn print_status(recorder: &Recorder) {
    let state = recorder.state();
    println!("state: {}", state.name());
    if let Some(status) = recorder.buffer_status() {
        println!(
            "buffer: {} entries, {:.1} MiB, {:.1}s",
            status.entries,
            status.bytes as f64 / (1024.0 * 1024.0),
            status.span_seconds
        );
    }
    if recorder.is_extracting() {
        println!("saving replay...");
    }
}

fn print_events(events: Receiver<RecorderEvent>) {
    for event in events.iter() {
        match event {
            RecorderEvent::RecordingChanged(true) => println!("recording"),
            RecorderEvent::RecordingChanged(false) => println!("not recording"),
            RecorderEvent::Notification(Notification::ReplaySaved { path, folder }) => {
                println!("replay saved: {} (folder: {})", path.display(), folder.display());
            }
            RecorderEvent::Notification(Notification::ReplayFailed { reason, message }) => {
                println!("{}: {}", reason.title(), message);
            }
            RecorderEvent::AudioDevices(devices) => {
                if devices.is_empty() {
                    println!("no audio devices published");
                }
                for device in devices {
                    let default = if device.is_default { " (default)" } else { "" };
                    println!("{:?} {} [{}]{}", device.device_type, device.name, device.id, default);
                }
            }
            RecorderEvent::Shutdown => break,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    use replay_engine::ConfigStore;
    use replay_ipc::RecorderConfig;

    fn recorder() -> Recorder {
        Recorder::new(ConfigStore::in_memory(RecorderConfig::default())).unwrap()
    }

    #[tokio::test]
    async fn test_line_reader_closes_at_end_of_input() {
        let mut lines = spawn_line_reader(Cursor::new("save\nstatus\n")).unwrap();
        assert_eq!(lines.recv().await.as_deref(), Some("save"));
        assert_eq!(lines.recv().await.as_deref(), Some("status"));
        assert_eq!(lines.recv().await, None);
    }

    #[tokio::test]
    async fn test_interrupt_ends_loop_while_input_open() {
        let recorder = recorder();
        let (command_tx, _command_rx) = command_channel();
        // Sender kept alive: input is still open.
        let (_line_tx, mut lines) = mpsc::unbounded_channel::<String>();

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            control_loop(&recorder, &command_tx, &mut lines, std::future::ready(())),
        )
        .await;
        assert!(matches!(result, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_commands_forwarded_until_quit() {
        let recorder = recorder();
        let (command_tx, command_rx) = command_channel();
        let (line_tx, mut lines) = mpsc::unbounded_channel();
        for line in ["save", "rewind", "", "quit", "stop"] {
            line_tx.send(line.to_string()).unwrap();
        }

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            control_loop(&recorder, &command_tx, &mut lines, std::future::pending()),
        )
        .await;
        assert!(matches!(result, Ok(Ok(()))));

        assert!(matches!(command_rx.try_recv(), Ok(RecorderCommand::SaveReplay)));
        assert!(command_rx.try_recv().is_err());
    }
}
