use std::env::consts::{ARCH, FAMILY, OS};

use anyhow::{Context, Error};
use clap::Parser;
use tracing::trace;

use crate::danbooru::config::ConfigManager;
use crate::danbooru::logger::init_logger;
use crate::program::{Args, Program};

mod danbooru;
mod program;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();
    let config = ConfigManager::load_or_create(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    // Held until exit so the file appender flushes.
    let _guard = init_logger(&config.config().logging)?;
    config.log_source();
    log_system_information();

    let program = Program::new(args, config.into_config());
    program.run().await
}

/// Logs important information about the system being used.
fn log_system_information() {
    trace!("Printing system information out into log for debug purposes...");
    trace!("ARCH:           \"{}\"", ARCH);
    trace!("FAMILY:         \"{}\"", FAMILY);
    trace!("OS:             \"{}\"", OS);
    trace!("CPUS:           \"{}\"", num_cpus::get());
}
