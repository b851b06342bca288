use std::{process, sync::Arc};

use i8gate::{
    application::{
        CacheHierarchy, GatedDelegate, HttpProbe, LegacyDelegate, SiteDirectory,
        error::AppError,
    },
    config::{self, CliArgs, ResolveArgs},
    domain::ResourceIdentifier,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        telemetry,
    },
};
use tokio::{signal, sync::watch, task::JoinHandle};
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
    let (cli_args, settings) = config::load_with_cli().map_err(InfraError::from)?;

    let command = cli_args
        .command
        .clone()
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(cli_args, settings).await,
        config::Command::Resolve(args) => run_resolve(&settings, &args),
    }
}

async fn run_serve(cli_args: CliArgs, settings: config::Settings) -> Result<(), AppError> {
    let probe = HttpProbe::new(&settings.probe).map_err(InfraError::from)?;
    let directory = Arc::new(SiteDirectory::new(settings.sites.clone()));
    let hierarchy = Arc::new(CacheHierarchy::new(
        directory.clone(),
        Arc::new(probe),
        settings.cache.clone(),
    ));
    let delegate = GatedDelegate::new(
        LegacyDelegate::new(settings.legacy.url_prefix.clone()),
        hierarchy,
        directory.clone(),
    );

    info!(
        sites = directory.len(),
        max_redirects = settings.probe.max_redirects,
        "Authorization gate configured"
    );

    let reload_handle = spawn_sitemap_reload(Arc::new(cli_args), directory)?;
    let result = serve_http(&settings, HttpState::new(Arc::new(delegate))).await;

    if let Some(handle) = reload_handle {
        handle.abort();
        let _ = handle.await;
    }

    result
}

fn run_resolve(settings: &config::Settings, args: &ResolveArgs) -> Result<(), AppError> {
    match ResourceIdentifier::parse(&args.identifier) {
        Some(identifier) => {
            let url = identifier.resolve(&settings.sites)?;
            println!("{url}");
        }
        None => println!("`{}` is not a gated identifier", args.identifier),
    }
    Ok(())
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(addr = %settings.server.addr, "Delegate endpoint listening");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown(
        async move {
            let _ = shutdown_rx.changed().await;
        },
    );
    let mut server = tokio::spawn(async move { server.await });

    tokio::select! {
        result = &mut server => return flatten_server_result(result),
        () = shutdown_signal() => {}
    }

    info!("Shutdown signal received, draining connections");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(settings.server.graceful_shutdown, &mut server).await {
        Ok(result) => flatten_server_result(result),
        Err(_) => {
            warn!(
                timeout_secs = settings.server.graceful_shutdown.as_secs(),
                "Graceful shutdown timed out"
            );
            server.abort();
            Ok(())
        }
    }
}

fn flatten_server_result(
    result: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), AppError> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(AppError::from(InfraError::from(err))),
        Err(err) => Err(AppError::unexpected(format!("server task failed: {err}"))),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

/// Re-read configuration on SIGHUP and swap in the new sitemap.
#[cfg(unix)]
fn spawn_sitemap_reload(
    cli_args: Arc<CliArgs>,
    directory: Arc<SiteDirectory>,
) -> Result<Option<JoinHandle<()>>, AppError> {
    let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    Ok(Some(tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match config::load(&cli_args) {
                Ok(settings) => directory.replace(settings.sites),
                Err(err) => {
                    let err = InfraError::from(err);
                    error!(error = %err, "Configuration reload failed, keeping current sitemap")
                }
            }
        }
    })))
}

#[cfg(not(unix))]
fn spawn_sitemap_reload(
    _cli_args: Arc<CliArgs>,
    _directory: Arc<SiteDirectory>,
) -> Result<Option<JoinHandle<()>>, AppError> {
    Ok(None)
}
