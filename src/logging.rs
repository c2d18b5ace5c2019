use std::sync::OnceLock;

use anyhow::Result;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static INSTALLED: OnceLock<()> = OnceLock::new();

pub fn init() -> Result<()> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false));

    if subscriber.try_init().is_ok() {
        let _ = INSTALLED.set(());
    }

    Ok(())
}
