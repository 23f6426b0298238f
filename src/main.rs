use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use outpost::auth::FileAuthenticator;
use outpost::command::{CommandFactory, ShellParams};
use outpost::config::OutpostConfig;
use outpost::errors::OutpostResult;
use outpost::reactor::Reactor;
use outpost::scheduler::Scheduler;
use outpost::server::Server;
use outpost::sessions::SessionRegistry;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .init();

    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

fn run() -> OutpostResult<()> {
    let config = Arc::new(OutpostConfig::load_from_file("outpost.conf")?);
    info!(
        address = %config.server.bind_address,
        port = config.server.port,
        "configuration loaded"
    );

    let reactor = Arc::new(Reactor::new()?);
    let scheduler = Arc::new(Scheduler::new());
    let sessions = Arc::new(SessionRegistry::new());
    let authenticator = Arc::new(FileAuthenticator::new("data")?);

    let factory = CommandFactory::new(
        config.shell.command_path.clone(),
        ShellParams {
            command_prefix: config.shell.command_prefix,
            default_prompt: config.shell.default_prompt.clone(),
        },
        sessions.clone(),
    )?;
    factory.start_auto_reload(&scheduler, config.shell.reload_interval);

    let server = Server::new(
        config,
        reactor,
        scheduler,
        authenticator,
        factory,
        sessions,
    );
    server.run()
}
