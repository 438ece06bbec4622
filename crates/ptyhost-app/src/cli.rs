use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use ptyhost_session::SessionConfig;

/// CLI arguments for ptyhost
#[derive(Parser, Debug)]
#[command(name = "ptyhost")]
#[command(about = "Run a program in a terminal session on a pseudo-terminal")]
#[command(version)]
pub struct Cli {
    /// Session profile (JSON). Flags given on the command line override it.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Value of TERM for the program
    #[arg(long, value_name = "TERM")]
    pub term: Option<String>,

    #[arg(long)]
    pub rows: Option<u16>,

    #[arg(long)]
    pub cols: Option<u16>,

    /// Initial working directory
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Report the first output after a quiet period
    #[arg(long)]
    pub monitor_activity: bool,

    /// Report when the program has been silent this long
    #[arg(long, value_name = "SECONDS")]
    pub monitor_silence: Option<u64>,

    /// Accept ZMODEM uploads into this directory
    #[arg(long, value_name = "DIR")]
    pub zmodem_dir: Option<PathBuf>,

    /// ZMODEM receiver program
    #[arg(long, value_name = "PROGRAM", default_value = "rz")]
    pub zmodem_command: String,

    /// Program to run and its arguments (default: $SHELL)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl Cli {
    /// The profile from `--config` (or the defaults) with command line
    /// flags applied on top.
    pub fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::load(path)
                .with_context(|| format!("failed to load profile {}", path.display()))?,
            None => SessionConfig::default(),
        };

        if let Some((program, args)) = self.command.split_first() {
            config.program = Some(program.clone());
            config.arguments = args.to_vec();
        }
        if let Some(term) = &self.term {
            config.terminal_type = term.clone();
        }
        if let Some(rows) = self.rows {
            config.rows = rows;
        }
        if let Some(cols) = self.cols {
            config.cols = cols;
        }
        if let Some(cwd) = &self.cwd {
            config.working_directory = Some(cwd.clone());
        }
        if self.monitor_activity {
            config.monitor_activity = true;
        }
        if let Some(seconds) = self.monitor_silence {
            config.monitor_silence = true;
            config.silence_seconds = seconds;
        }
        Ok(config)
    }
}
