//! Log setup shared by the command line tool and the fuzzing harnesses.
//!
//! Lines look like `14:03:27.512 4242 message`. The level filter comes from
//! `RUST_LOG` and defaults to `info`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};

fn builder() -> Builder {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} {} {}",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            std::process::id(),
            record.args()
        )
    });
    builder
}

/// Logs to stderr. Calling it again is a no-op.
pub fn init() {
    let _ = builder().try_init();
}

/// Appends log lines to `path` instead of stderr.
///
/// Harnesses run under a driver own neither stdout nor stderr, so a file is
/// the only place their diagnostics can go.
pub fn init_with_file(path: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;

    builder()
        .target(Target::Pipe(Box::new(file)))
        .try_init()
        .context("A logger is already installed")
}
