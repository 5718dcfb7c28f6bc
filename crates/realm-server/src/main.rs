use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

use realm_core::time::epoch_millis;
use realm_server::config::ServerConfig;
use realm_server::game_loop::{Clock, GameCommand, LoopExit, spawn_game_loop};
use realm_server::{build_app, build_authority, build_world};

/// How long open sockets get to drain after the loop stops.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing(format: &str) {
    let builder = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env());
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = ServerConfig::load();
    init_tracing(&config.log_format);

    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }
    tracing::info!(listen_addr = %config.listen_addr, "Realm server starting");

    let now = epoch_millis();
    let world = match build_world(&config, now) {
        Ok(world) => world,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build the world");
            return ExitCode::FAILURE;
        },
    };
    let authority = build_authority(&config);
    let (commands, mut loop_handle) = spawn_game_loop(
        world,
        Clock::new(now),
        config.ticks.clone(),
        authority,
        config.limits.command_buffer,
    );

    let listener = match tokio::net::TcpListener::bind(&config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {e}", config.listen_addr);
            return ExitCode::FAILURE;
        },
    };
    let (app, _state) = build_app(config, commands.clone());

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let service = app.into_make_service_with_connect_info::<SocketAddr>();
        if let Err(e) = axum::serve(listener, service)
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
        {
            tracing::error!(error = %e, "Server error");
        }
    });

    let outcome = tokio::select! {
        result = &mut loop_handle => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupt received, shutting down");
            let _ = commands.send(GameCommand::Shutdown).await;
            loop_handle.await
        }
    };

    let _ = stop_tx.send(());
    if tokio::time::timeout(DRAIN_TIMEOUT, server).await.is_err() {
        tracing::warn!("Connections did not drain in time");
    }

    match outcome {
        Ok(Ok(LoopExit::Shutdown)) => ExitCode::SUCCESS,
        Ok(Ok(LoopExit::Reboot)) => {
            tracing::info!("Exiting for scheduled reboot");
            ExitCode::SUCCESS
        },
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Simulation halted");
            ExitCode::FAILURE
        },
        Err(e) => {
            tracing::error!(error = %e, "Control loop task failed");
            ExitCode::FAILURE
        },
    }
}
