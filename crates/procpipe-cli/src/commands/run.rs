//! `procpipe run program [args...]`: run to completion.
//!
//! Prints everything the child wrote to stdout and exits with its code.

use anyhow::{bail, Context, Result};
use procpipe::{CommandRunner, LaunchSpec, SessionConfig};
use std::io::Write;
use tracing::info;

use super::exit_status_for;

pub async fn run(spec: LaunchSpec, config: SessionConfig) -> Result<i32> {
    info!(program = %spec, "run");
    let program = spec.to_string();

    let out = CommandRunner::new(config)
        .run_async(spec)
        .await
        .with_context(|| format!("failed to run '{program}'"))?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&out.raw)?;
    stdout.flush()?;

    if out.exit_code.is_none() {
        bail!("'{program}' failed to start");
    }
    Ok(exit_status_for(out.exit_code))
}
