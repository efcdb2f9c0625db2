use std::{future::IntoFuture, process, sync::Arc};

use memoserve::{
    application::error::AppError,
    cache::{CacheConfig, MemoryStore, ResponsePipeline},
    config,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        telemetry,
        upstream::UpstreamGenerator,
    },
};
use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let generator = UpstreamGenerator::new(&settings.upstream)?;

    let cache_config = CacheConfig::from(&settings.cache);
    let store = MemoryStore::new(cache_config.memory_capacity);
    let pipeline = ResponsePipeline::new(Arc::new(store), cache_config);

    let state = HttpState {
        pipeline,
        generator: Arc::new(generator),
        default_color: settings.content.default_color.clone(),
    };

    serve_http(&settings, state).await
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(InfraError::bind(settings.server.addr))?;
    info!(
        target = "memoserve::http",
        addr = %settings.server.addr,
        "listening"
    );

    let (signalled_tx, mut signalled_rx) = watch::channel(false);
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = signalled_tx.send(true);
        })
        .into_future();
    tokio::pin!(server);

    let shutting_down = tokio::select! {
        biased;
        result = &mut server => {
            result.map_err(InfraError::Serve)?;
            false
        }
        _ = signalled_rx.wait_for(|signalled| *signalled) => true,
    };

    if shutting_down {
        let grace = settings.server.graceful_shutdown;
        match tokio::time::timeout(grace, server).await {
            Ok(result) => result.map_err(InfraError::Serve)?,
            Err(_) => warn!(
                target = "memoserve::http",
                grace_seconds = grace.as_secs(),
                "graceful shutdown timed out; dropping open connections"
            ),
        }
    }

    info!(target = "memoserve::http", "server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM"),
                    _ = sigint.recv() => info!("received SIGINT"),
                }
            }
            _ => {
                warn!("failed to install signal handlers; falling back to ctrl-c");
                ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received ctrl-c"),
        Err(err) => {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    }
}
