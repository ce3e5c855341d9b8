//! `procpipe attach program [args...]`: interactive session.
//!
//! Forwards our stdin to the child line by line and prints its buffered
//! output every poll interval. Ends when the child exits, or stops the
//! child on end of our input or Ctrl-C.

use anyhow::{Context, Result};
use procpipe::{LaunchSpec, ProcessSession, SessionConfig, Termination};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use super::exit_status_for;

pub async fn run(spec: LaunchSpec, config: SessionConfig, how: Termination) -> Result<i32> {
    let program = spec.to_string();
    let session = Arc::new(
        ProcessSession::spawn(spec, &config)
            .with_context(|| format!("failed to start session for '{program}'"))?,
    );
    info!(session_id = %session.id(), program = %program, ?how, "attached");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(config.poll_interval());

    let stop_reason = loop {
        tokio::select! {
            _ = ticker.tick() => {
                flush_output(&session)?;
                if !session.is_running() {
                    break None;
                }
            }
            line = lines.next_line() => match line.context("failed to read stdin")? {
                Some(mut line) => {
                    line.push('\n');
                    let s = session.clone();
                    tokio::task::spawn_blocking(move || s.write_input(line.as_bytes())).await?;
                }
                None => break Some("end of input"),
            },
            _ = tokio::signal::ctrl_c() => break Some("interrupted"),
        }
    };

    let s = session.clone();
    match stop_reason {
        Some(reason) => {
            debug!(reason, "stopping session");
            tokio::task::spawn_blocking(move || s.terminate(how)).await?;
        }
        None => tokio::task::spawn_blocking(move || s.wait_for_exit()).await?,
    }
    flush_output(&session)?;

    let code = session.exit_code();
    if code.is_none() && session.is_running() {
        warn!(session_id = %session.id(), "process did not exit after stdin was closed");
    }
    Ok(exit_status_for(code))
}

fn flush_output(session: &ProcessSession) -> Result<()> {
    let bytes = session.take_output_bytes();
    if !bytes.is_empty() {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&bytes)?;
        stdout.flush()?;
    }
    Ok(())
}
