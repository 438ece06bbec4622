mod cli;

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use clap::Parser;
use ptyhost_pty::WindowSize;
use ptyhost_session::{Emulation, Session, SessionEvent, TransferRequest};
use tokio::sync::mpsc;

use cli::Cli;

/// Copies the program's output to our stdout unchanged; the surrounding
/// terminal does the emulating.
#[derive(Default)]
struct PassthroughEmulation {
    size: WindowSize,
}

impl Emulation for PassthroughEmulation {
    fn receive_data(&mut self, data: &[u8]) {
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = stdout.write_all(data).and_then(|()| stdout.flush()) {
            log::warn!("failed to write output: {e}");
        }
    }

    fn set_image_size(&mut self, size: WindowSize) {
        self.size = size;
    }

    fn image_size(&self) -> WindowSize {
        self.size
    }
}

/// Read stdin line by line on a blocking thread.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(64);
    let spawned = std::thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        log::warn!("failed to start stdin reader: {e}");
    }
    rx
}

enum Step {
    Events(bool),
    Input(Option<String>),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let config = cli.session_config()?;

    let mut session = Session::new(PassthroughEmulation::default());
    session.apply_config(&config)?;
    let mut events = session.subscribe();
    session
        .run()
        .with_context(|| format!("failed to start {}", config.program.as_deref().unwrap_or("shell")))?;
    log::info!("session {} running (pid {:?})", session.id(), session.process_id());

    let mut input = spawn_stdin_reader();
    let mut stdin_open = true;
    let mut exit_code = 0;

    loop {
        let step = tokio::select! {
            alive = session.process_events() => Step::Events(alive),
            line = input.recv(), if stdin_open => Step::Input(line),
        };

        match step {
            Step::Input(Some(line)) => session.send_text(&format!("{line}\r")),
            Step::Input(None) => {
                // End of input: hand the program an EOF of its own.
                stdin_open = false;
                session.send_data(b"\x04");
            }
            Step::Events(_) => {}
        }

        while let Ok(event) = events.try_recv() {
            match event {
                SessionEvent::ZmodemDetected => match &cli.zmodem_dir {
                    Some(dir) => {
                        let request = TransferRequest {
                            command: cli.zmodem_command.clone(),
                            directory: dir.clone(),
                            files: Vec::new(),
                        };
                        if let Err(e) = session.start_zmodem(&request) {
                            log::warn!("{e}");
                            session.dismiss_zmodem();
                        }
                    }
                    None => {
                        log::info!("ignoring ZMODEM upload (no --zmodem-dir)");
                        session.dismiss_zmodem();
                    }
                },
                SessionEvent::TransferStatus(line) => log::info!("zmodem: {line}"),
                SessionEvent::TransferFinished => {
                    let (received, sent) = session.transfer_progress();
                    log::info!("zmodem transfer done ({received} bytes in, {sent} bytes out)");
                }
                SessionEvent::StateChanged(state) => log::info!("session state: {state:?}"),
                SessionEvent::TitleChanged => {
                    log::debug!("title: {}", session.displayed_title());
                }
                SessionEvent::Finished(report) => {
                    if report.unexpected {
                        log::warn!("program finished unexpectedly: {:?}", report.reason);
                    }
                    exit_code = report.exit_code().map_or(1, |code| code as i32);
                }
                SessionEvent::Output(_) => {}
                other => log::debug!("{other:?}"),
            }
        }

        if session.exit_report().is_some() {
            break;
        }
    }

    std::process::exit(exit_code);
}
