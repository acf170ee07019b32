mod cli;

use clap::Parser;
use cli::Cli;
use ezdemo::logging::init_logging;
use ezdemo::{CancellationToken, RelayCoordinator, SshTunnel};
use tracing::{error, info, instrument};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format, cli.color);

    if let Err(e) = run(cli).await {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

#[instrument(name = "run", skip(cli), fields(host = %cli.host, remote_port = cli.remote_port))]
async fn run(cli: Cli) -> ezdemo::Result<()> {
    let params = cli.tunnel_params();
    params.validate()?;

    info!(
        "ezdemo v{} - exposing {}:{}",
        env!("CARGO_PKG_VERSION"),
        params.local_host,
        params.local_port
    );

    let tunnel = SshTunnel::establish(&params, &cli.transport_config()).await?;

    info!(
        "Forwarding {}:{} -> {}:{}",
        params.remote_host,
        tunnel.remote_bind_port(),
        params.local_host,
        params.local_port
    );

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let coordinator = RelayCoordinator::new(
        tunnel,
        params.local_host.clone(),
        params.local_port,
        cli.relay_config(),
        cancel,
    );

    coordinator.run().await?;
    Ok(())
}

/// Set the cancellation signal once, on Ctrl+C or (on unix) SIGTERM.
async fn cancel_on_signal(cancel: CancellationToken) {
    wait_for_signal().await;
    info!("Exiting...");
    cancel.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        // Without a handler the tunnel runs until the transport drops.
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
