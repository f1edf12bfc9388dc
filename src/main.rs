use std::{process, sync::Arc};

use playcache::{
    application::{
        catalog::{CatalogService, CatalogSource},
        error::AppError,
    },
    cache::{CacheConfig, CacheContext},
    config,
    infra::{
        error::InfraError,
        http::{self, AdminState, HttpState},
        telemetry,
        upstream::HttpCatalog,
    },
};
use tokio::try_join;
use tracing::{Dispatch, Level, dispatcher, error, info};
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

    match command {
        config::Command::Serve(_) => {
            telemetry::init(&settings.logging)?;
            run_serve(settings).await
        }
        config::Command::ShowConfig => {
            println!("{:#?}", CacheConfig::from(&settings.cache));
            println!(
                "upstream: {} (timeout {:?}, api key {})",
                settings.upstream.base_url,
                settings.upstream.timeout,
                if settings.upstream.api_key.is_some() {
                    "set"
                } else {
                    "unset"
                }
            );
            Ok(())
        }
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let cache = CacheContext::new(CacheConfig::from(&settings.cache));
    let upstream: Arc<dyn CatalogSource> = Arc::new(HttpCatalog::new(&settings.upstream)?);
    let catalog = CatalogService::new(
        upstream,
        cache.objects().clone(),
        cache.config().default_entry_options(),
    );

    let workers = cache.spawn_workers();
    info!(
        public_addr = %settings.server.public_addr,
        admin_addr = %settings.server.admin_addr,
        upstream = %settings.upstream.base_url,
        object_cache = cache.config().enabled,
        response_cache = cache.config().enable_response_cache,
        "Starting playcache"
    );

    let result = serve_http(
        &settings,
        HttpState { catalog },
        AdminState {
            cache: cache.clone(),
        },
        &cache,
    )
    .await;

    workers.shutdown().await;
    result
}

async fn serve_http(
    settings: &config::Settings,
    http_state: HttpState,
    admin_state: AdminState,
    cache: &CacheContext,
) -> Result<(), AppError> {
    let public_router = http::build_router(http_state, cache.responses().clone());
    let admin_router = http::build_admin_router(admin_state);

    let public_listener = tokio::net::TcpListener::bind(settings.server.public_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let admin_listener = tokio::net::TcpListener::bind(settings.server.admin_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    let public_server = axum::serve(public_listener, public_router.into_make_service())
        .with_graceful_shutdown(shutdown_signal());
    let admin_server = axum::serve(admin_listener, admin_router.into_make_service())
        .with_graceful_shutdown(shutdown_signal());

    try_join!(public_server, admin_server)
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    info!("Servers stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
