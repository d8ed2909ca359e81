use std::{net::SocketAddr, sync::atomic, sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::MatchedPath,
    response::{IntoResponse, Response},
    Router,
};
use axum_server::{bind, bind_rustls, tls_rustls::RustlsConfig, Handle as ServerHandle};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use http::{header, Method, StatusCode, Uri};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::{self, CorsLayer},
    trace::TraceLayer,
    ServiceBuilderExt as _,
};
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

pub use ovmeet::*; // Re-export everything from the library crate

use ovmeet::coordination::CoordinationStore;

#[cfg(all(not(target_env = "msvc"), feature = "jemalloc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(all(not(target_env = "msvc"), feature = "jemalloc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

static SUB_TABLES: [&str; 3] = ["tls", "media_server", "blob"];

#[tokio::main]
async fn main() {
    clap::parse();

    // Initialize config
    let raw_config = Figment::new()
        .merge(
            Toml::file(Env::var("OVMEET_CONFIG").expect(
                "The OVMEET_CONFIG env var needs to be set. Example: /etc/ovmeet.toml",
            ))
            .nested(),
        )
        .merge(Env::prefixed("OVMEET_").global().map(|k| {
            let mut key = k.into();

            for table in SUB_TABLES {
                if k.starts_with(&(table.to_owned() + "_")) {
                    key = figment::value::Uncased::from(
                        table.to_owned() + "." + k[table.len() + 1..k.len()].as_str(),
                    );
                    break;
                }
            }

            key
        }));

    let config = match raw_config.extract::<Config>() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("It looks like your config is invalid. The following error occurred: {e}");
            std::process::exit(1);
        }
    };

    config.warn_deprecated();

    let registry = tracing_subscriber::Registry::default();
    let fmt_layer = tracing_subscriber::fmt::Layer::new();
    let filter_layer = match EnvFilter::try_new(&config.log) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("It looks like your log config is invalid. The following error occurred while parsing it: {e}");
            EnvFilter::try_new("warn").unwrap()
        }
    };
    let subscriber = registry.with(filter_layer).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).unwrap();

    // More file descriptors for the connection pools under load
    #[cfg(unix)]
    maximize_fd_limit().expect("should be able to increase the soft limit to the hard limit");

    info!("Connecting to the coordination store");
    let store: Arc<dyn CoordinationStore> = if config.redis_url == "memory" {
        warn!("Using the in-process coordination store; run exactly one replica");
        Arc::new(coordination::memory::Store::new())
    } else {
        match coordination::redis::Store::open(&config.redis_url).await {
            Ok(store) => Arc::new(store),
            Err(error) => {
                error!(?error, "The coordination store is unreachable");
                std::process::exit(1);
            }
        }
    };
    if let Err(error) = store.ping().await {
        error!(?error, "The coordination store is unreachable");
        std::process::exit(1);
    }

    info!("Opening storage");
    let bootstrap_client = match reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()
    {
        Ok(client) => client,
        Err(error) => {
            error!(?error, "Could not build an HTTP client");
            std::process::exit(1);
        }
    };

    let db = match Database::open(&config, bootstrap_client.clone()).await {
        Ok(db) => Box::leak(Box::new(db)),
        Err(error) => {
            error!(?error, "The database couldn't be opened");
            std::process::exit(1);
        }
    };

    let services_raw = match Services::build(db, store, config) {
        Ok(services) => Box::new(services),
        Err(error) => {
            error!(?error, "Could not wire up services");
            std::process::exit(1);
        }
    };

    // This is the first and only time we initialize the SERVICES static
    *SERVICES.write().unwrap() = Some(Box::leak(services_raw));

    info!("Running migrations");
    if let Err(error) = db
        .migrate(
            &services().globals.config,
            &services().mutex,
            bootstrap_client,
        )
        .await
    {
        error!(?error, "Migrations failed");
        std::process::exit(1);
    }

    if let Err(error) = services().start().await {
        error!(?error, "Startup failed");
        std::process::exit(1);
    }

    info!("Starting server");
    run_server().await.unwrap();
}

async fn run_server() -> std::io::Result<()> {
    let config = &services().globals.config;
    let addr = SocketAddr::from((config.address, config.port));

    let middlewares = ServiceBuilder::new()
        .sensitive_headers([header::AUTHORIZATION])
        .layer(axum::middleware::from_fn(spawn_task))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &http::Request<_>| {
                let path = if let Some(path) = request.extensions().get::<MatchedPath>() {
                    path.as_str()
                } else {
                    request.uri().path()
                };

                tracing::info_span!("http_request", %path)
            }),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::PATCH,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([
                    header::ORIGIN,
                    header::CONTENT_TYPE,
                    header::ACCEPT,
                    header::AUTHORIZATION,
                ])
                .max_age(Duration::from_secs(86400)),
        );

    let app = routes().layer(middlewares).into_make_service();
    let handle = ServerHandle::new();

    tokio::spawn(shutdown_signal(handle.clone()));

    match &config.tls {
        Some(tls) => {
            let conf = RustlsConfig::from_pem_file(&tls.certs, &tls.key).await?;
            let server = bind_rustls(addr, conf).handle(handle).serve(app);

            #[cfg(feature = "systemd")]
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);

            server.await?
        }
        None => {
            let server = bind(addr).handle(handle).serve(app);

            #[cfg(feature = "systemd")]
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);

            server.await?
        }
    }

    Ok(())
}

fn routes() -> Router {
    api::routes().fallback(not_found)
}

async fn spawn_task(
    req: http::Request<Body>,
    next: axum::middleware::Next<Body>,
) -> std::result::Result<Response, StatusCode> {
    if services()
        .globals
        .shutdown
        .load(atomic::Ordering::Relaxed)
    {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    tokio::spawn(next.run(req))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn shutdown_signal(handle: ServerHandle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let sig: &str;

    tokio::select! {
        _ = ctrl_c => { sig = "Ctrl+C"; },
        _ = terminate => { sig = "SIGTERM"; },
    }

    warn!("Received {}, shutting down...", sig);
    handle.graceful_shutdown(Some(Duration::from_secs(30)));

    services().shutdown().await;

    #[cfg(feature = "systemd")]
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
}

async fn not_found(uri: Uri) -> impl IntoResponse {
    warn!("Not found: {uri}");
    Error::BadRequest(ErrorKind::NotFound, "Unrecognized request")
}

#[cfg(unix)]
#[tracing::instrument(err)]
fn maximize_fd_limit() -> Result<(), nix::errno::Errno> {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};

    let res = Resource::RLIMIT_NOFILE;

    let (soft_limit, hard_limit) = getrlimit(res)?;

    tracing::debug!("Current nofile soft limit: {soft_limit}");

    setrlimit(res, hard_limit, hard_limit)?;

    tracing::debug!("Increased nofile soft limit to {hard_limit}");

    Ok(())
}
