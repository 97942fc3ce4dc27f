use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;
use fetchbox::app_state::AppState;
use fetchbox::config::{self, Args};
use fetchbox::db::Repository;
use fetchbox::scheduler::{Scheduler, SchedulerConfig};
use fetchbox::tracing::init_tracer;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let log_channel = init_tracer(tracing::Level::INFO);

    if let Ok(path) = dotenv() {
        tracing::info!("loaded env variables from: {}", path.display());
    } else {
        tracing::debug!("no .env file found");
    }

    let config_path = args.config.clone().unwrap_or_else(config::default_config_path);
    let file_settings = config::read_file_settings(&config_path).await.unwrap_or_else(|err| {
        tracing::warn!("error reading config file {}: {err}", config_path.display());
        config::FileSettings::default()
    });
    let settings = config::Settings::resolve(args, file_settings);

    tracing::info!(download_dir = %settings.download_dir.display(), "resolved settings");

    let cancellation_token = CancellationToken::new();

    let repo = Repository::connect(&settings.database_path)
        .await
        .expect("database to be reachable");

    let scheduler = Scheduler::new(
        repo,
        SchedulerConfig {
            download_dir: settings.download_dir.clone(),
            max_concurrent: settings.max_concurrent,
            connect_timeout: std::time::Duration::from_secs(settings.connect_timeout_secs),
            receive_timeout: std::time::Duration::from_secs(settings.receive_timeout_secs),
        },
    );
    scheduler.initialize().await.expect("scheduler to initialize");

    let app_state = AppState {
        scheduler: Arc::clone(&scheduler),
        cancellation_token: cancellation_token.clone(),
        log_channel,
    };

    let app = fetchbox::server::router(app_state);

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), settings.port);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to start server on port {}: {e}", settings.port);
            return;
        }
    };
    tracing::info!("listening on port {}", settings.port);

    {
        let cancellation_token = cancellation_token.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(cancellation_token.cancelled_owned())
                .await
                .unwrap();
        });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            cancellation_token.cancel();
        }
        _ = cancellation_token.cancelled() => {}
    }

    tracing::trace!("waiting for all running downloads to finish");
    scheduler.tracker().close();
    scheduler.tracker().wait().await;
    tracing::info!("gracefully shut down");
}
