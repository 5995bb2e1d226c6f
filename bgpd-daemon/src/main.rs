//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

mod config;

use bgpd_speaker::error::Error;
use bgpd_speaker::rib::TableId;
use bgpd_speaker::server::BgpServer;
use clap::{App, Arg};
use config::{Config, LoggingFileRotation, LoggingFmtStyle};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_appender::rolling;
use tracing_subscriber::Layer;
use tracing_subscriber::prelude::*;

fn init_tracing(config: &config::Logging) {
    // Enable logging to a file.
    let file = config.file.enabled.then(|| {
        let file_appender = match config.file.rotation {
            LoggingFileRotation::Never => {
                rolling::never(&config.file.dir, &config.file.name)
            }
            LoggingFileRotation::Hourly => {
                rolling::hourly(&config.file.dir, &config.file.name)
            }
            LoggingFileRotation::Daily => {
                rolling::daily(&config.file.dir, &config.file.name)
            }
        };

        let log_level_filter = LevelFilter::from_level(tracing::Level::TRACE);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(false)
            .with_thread_ids(config.file.fmt.show_thread_id)
            .with_file(config.file.fmt.show_source)
            .with_line_number(config.file.fmt.show_source)
            .with_ansi(config.file.fmt.colors);
        let layer = match config.file.fmt.style {
            LoggingFmtStyle::Compact => layer.compact().boxed(),
            LoggingFmtStyle::Full => layer.boxed(),
            LoggingFmtStyle::Json => layer.json().boxed(),
            LoggingFmtStyle::Pretty => layer.pretty().boxed(),
        };
        layer.with_filter(log_level_filter)
    });

    // Enable logging to stdout.
    let stdout = config.stdout.enabled.then(|| {
        let log_level_filter = LevelFilter::from_level(tracing::Level::TRACE);
        let layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(config.stdout.fmt.show_thread_id)
            .with_file(config.stdout.fmt.show_source)
            .with_line_number(config.stdout.fmt.show_source)
            .with_ansi(config.stdout.fmt.colors);
        let layer = match config.stdout.fmt.style {
            LoggingFmtStyle::Compact => layer.compact().boxed(),
            LoggingFmtStyle::Full => layer.boxed(),
            LoggingFmtStyle::Json => layer.json().boxed(),
            LoggingFmtStyle::Pretty => layer.pretty().boxed(),
        };
        layer.with_filter(log_level_filter)
    });

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive("bgpd_speaker=debug".parse().unwrap())
        .from_env_lossy()
        .add_directive("bgpd=info".parse().unwrap());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(file)
        .with(stdout)
        .init();
}

fn signal_listener() -> mpsc::Receiver<()> {
    let (signal_tx, signal_rx) = mpsc::channel(1);

    tokio::task::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).unwrap();
        let mut sigterm = signal(SignalKind::terminate()).unwrap();

        tokio::select! {
            _ = sigint.recv() => {
                info!("received SIGINT");
                let _ = signal_tx.send(()).await;
            },
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                let _ = signal_tx.send(()).await;
            }
        }
    });

    signal_rx
}

// Starts the server and applies the startup configuration.
async fn configure(
    server: &BgpServer,
    config: config::Bgp,
) -> Result<(), Error> {
    let mut global = config.global;
    let global_policy = std::mem::take(&mut global.apply_policy);
    server.start_bgp(global).await?;

    // Policies go first, as route server clients refer to them.
    server
        .set_policies(
            config.defined_sets,
            config.policies,
            [(TableId::Global, global_policy)].into(),
        )
        .await?;

    for vrf in config.vrfs {
        server.add_vrf(vrf).await?;
    }
    for group in config.peer_groups {
        server.add_peer_group(group).await?;
    }
    for dynamic in config.dynamic_neighbors {
        server.add_dynamic_neighbor(dynamic).await?;
    }

    // A bad neighbor doesn't prevent the others from coming up.
    for neighbor in config.neighbors {
        let addr = neighbor.address;
        if let Err(error) = server.add_peer(neighbor).await {
            error!(%addr, %error, "failed to add neighbor");
        }
    }

    Ok(())
}

// ===== main =====

fn main() {
    // Parse command-line parameters.
    let matches = App::new("BGP routing daemon")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("file")
                .help("Specify an alternative configuration file."),
        )
        .get_matches();

    // Read configuration file.
    let config_file = matches.value_of("config");
    let config = Config::load(config_file);

    // Initialize tracing.
    init_tracing(&config.logging);

    // We're ready to go!
    info!("starting up");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create async runtime")
        .block_on(async {
            let mut signal_rx = signal_listener();

            let server = BgpServer::new();
            if let Err(error) = configure(&server, config.bgp).await {
                error!(%error, "failed to start BGP");
                std::process::exit(1);
            }

            let _ = signal_rx.recv().await;
            if let Err(error) = server.stop_bgp().await {
                error.log();
            }
        });

    info!("exiting");
}
