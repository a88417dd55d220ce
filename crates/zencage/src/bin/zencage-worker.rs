//! Zencage worker
//!
//! Serves exactly one process-isolated call for a parent harness and exits.

use std::process::ExitCode;

use tracing::Level;
use tracing_subscriber::EnvFilter;
use zencage::UnitRegistry;
use zencage::isolate::{WORKER_FLAG, worker};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::WARN.into()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if std::env::args().nth(1).as_deref() != Some(WORKER_FLAG) {
        eprintln!("zencage-worker is started by the zencage harness, not by hand");
        return ExitCode::from(2);
    }

    worker::serve(&UnitRegistry::with_probes())
}
