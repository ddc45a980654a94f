use std::net::SocketAddr;

use anyhow::Context;
use clap::{CommandFactory, FromArgMatches};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use fleetq::client::status::{fetch_status, print_status};
use fleetq::common::cli::{DryRunOpts, RootOptions, RunOpts, StatusOpts, SubCommand};
use fleetq::common::setup::setup_logging;
use fleetq::controller::config::ControllerConfig;
use fleetq::controller::process::dry_run;
use fleetq::controller::status::serve_status;
use fleetq::controller::{Controller, ControllerService, create_controller_service};

fn load_config(opts: &RunOpts) -> anyhow::Result<ControllerConfig> {
    let mut config = ControllerConfig::load(&opts.config)
        .with_context(|| format!("Cannot load configuration {}", opts.config.display()))?;
    if let Some(max_fleet_size) = opts.max_fleet_size {
        config.scaling.max_fleet_size = max_fleet_size;
    }
    if let Some(interval) = &opts.poll_interval {
        config.queue.poll_interval_ms = interval.get().as_millis() as u64;
    }
    if opts.reconcile {
        config.scaling.reconcile = true;
    }
    if opts.drain_on_exit {
        config.scaling.drain_on_exit = true;
    }
    config.validate()?;
    Ok(config)
}

async fn start_status_endpoint(
    address: SocketAddr,
    service: ControllerService,
) -> anyhow::Result<oneshot::Sender<()>> {
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("Cannot bind status endpoint to {address}"))?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        if let Err(error) = serve_status(listener, service, shutdown).await {
            log::error!("Status endpoint failed: {error:?}");
        }
    });
    Ok(shutdown_tx)
}

async fn command_run(opts: RunOpts) -> anyhow::Result<()> {
    let config = load_config(&opts)?;
    log::info!(
        "Starting controller {} for queue {} (max fleet size {})",
        config.name,
        config.queue.url,
        config.scaling.max_fleet_size
    );
    let controller = Controller::from_config(config)?;
    let (service, process) = create_controller_service(controller);

    let endpoint = match opts.status_addr {
        Some(address) => Some(start_status_endpoint(address, service.clone()).await?),
        None => None,
    };

    let mut process = std::pin::pin!(process);
    tokio::select! {
        _ = &mut process => {
            log::debug!("Controller loop has ended");
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received interrupt, stopping controller");
            let stop = service.stop();
            let ((), ()) = tokio::join!(&mut process, stop);
        }
    }

    if let Some(endpoint) = endpoint {
        let _ = endpoint.send(());
    }
    if let Some(error) = service.status().last_error {
        log::debug!("Last recorded error: {}", error.message);
    }
    Ok(())
}

async fn command_dry_run(opts: DryRunOpts) -> anyhow::Result<()> {
    let config = ControllerConfig::load(&opts.config)
        .with_context(|| format!("Cannot load configuration {}", opts.config.display()))?;
    dry_run(&config).await?;
    println!("Dry run of controller {} succeeded", config.name);
    Ok(())
}

async fn command_status(opts: StatusOpts) -> anyhow::Result<()> {
    let status = fetch_status(opts.addr).await?;
    print_status(&status, opts.output)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> fleetq::Result<()> {
    let matches = RootOptions::command().get_matches();
    let top_opts = match RootOptions::from_arg_matches(&matches) {
        Ok(opts) => opts,
        Err(error) => error.exit(),
    };

    setup_logging(top_opts.common.debug);

    let result = match top_opts.subcmd {
        SubCommand::Run(opts) => command_run(opts).await,
        SubCommand::DryRun(opts) => command_dry_run(opts).await,
        SubCommand::Status(opts) => command_status(opts).await,
    };

    if let Err(e) = result {
        log::error!("{e:?}");
        std::process::exit(1);
    }

    Ok(())
}
