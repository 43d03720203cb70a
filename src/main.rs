//! Standalone debugger server.
//!
//! The usual deployment embeds the library into the host process that runs
//! the script VM; this binary boots the listener on its own, which is enough
//! to develop and test IDE clients against.

use anyhow::Context;
use clap::Parser;
use log::info;
use pawndbg::net::DebugServer;
use pawndbg::settings::Settings;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pawndbg", about = "Remote debugger server for Pawn-style script VMs")]
struct Args {
    /// Host key/value configuration file (DebuggerPort, DebuggerWaitTime).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port, overriding the configuration file.
    #[arg(short, long)]
    port: Option<u16>,
}

fn main() -> anyhow::Result<()> {
    let logger = env_logger::Logger::from_default_env();
    let filter = logger.filter();
    pawndbg::log::LOGGER_SWITCHER.switch(logger, filter);

    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("read config {}", path.display()))?,
        None => Settings::default(),
    };
    if let Some(port) = args.port {
        settings.port = port;
    }

    if settings.wait_time > 0.0 {
        info!(target: "net", "waiting {}s for debugger clients", settings.wait_time);
        std::thread::sleep(std::time::Duration::from_secs_f32(settings.wait_time));
    }

    let server = DebugServer::bind(("0.0.0.0", settings.port))
        .with_context(|| format!("bind port {}", settings.port))?;
    server.run();
    Ok(())
}
