//! procpipe: run and attach to managed child processes.
//!
//! `run` executes a command to completion and mirrors its output and exit
//! code. `attach` keeps the process alive, relays stdin and streams its
//! output until it exits or is stopped.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use procpipe::{LaunchSpec, SessionConfig, StderrMode, Termination};
use std::path::PathBuf;
use tracing::error;

/// procpipe: managed child processes
#[derive(Parser, Debug)]
#[command(name = "procpipe", version, about = "Run and attach to managed child processes")]
struct Cli {
    /// Config file path (default: ~/.procpipe/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Drain loop poll interval in milliseconds
    #[arg(long, global = true)]
    poll_ms: Option<u64>,

    /// Capture the child's stderr along with stdout
    #[arg(long, global = true)]
    merge_stderr: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a command to completion and exit with its exit code
    Run {
        /// Working directory for the child
        #[arg(long)]
        cwd: Option<PathBuf>,
        program: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Start a command and relay stdin/stdout until it exits
    Attach {
        /// Working directory for the child
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// On end of input or Ctrl-C, close the child's stdin instead of killing it
        #[arg(long)]
        close_stdin: bool,
        program: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

impl Cli {
    /// Apply CLI overrides on top of the config file's session settings.
    fn session_config(&self, mut session: SessionConfig) -> SessionConfig {
        if let Some(ms) = self.poll_ms {
            session.poll_interval_ms = ms.max(1);
        }
        if self.merge_stderr {
            session.stderr = StderrMode::Merge;
        }
        session
    }
}

fn launch_spec(program: String, args: Vec<String>, cwd: Option<PathBuf>) -> LaunchSpec {
    let mut spec = LaunchSpec::new(program).args(args);
    spec.cwd = cwd;
    spec
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(config::default_path);
    let loaded = config::Config::load(&config_path);

    // Initialize tracing.
    use tracing_subscriber::EnvFilter;
    let level = cli.log_level.clone().unwrap_or_else(|| match &loaded {
        Ok(cfg) => cfg.log.level.clone(),
        Err(_) => "warn".to_string(),
    });
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cfg = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("procpipe: {e:#}");
            std::process::exit(1);
        }
    };
    let session = cli.session_config(cfg.session);

    let result = match cli.command {
        Command::Run { cwd, program, args } => {
            commands::run::run(launch_spec(program, args, cwd), session).await
        }
        Command::Attach {
            cwd,
            close_stdin,
            program,
            args,
        } => {
            let how = if close_stdin {
                Termination::CloseStdin
            } else {
                Termination::Kill
            };
            commands::attach::run(launch_spec(program, args, cwd), session, how).await
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("procpipe: {e:#}");
            std::process::exit(1);
        }
    }
}
