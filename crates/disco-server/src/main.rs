use anyhow::Result;
use clap::Parser;
use disco_server::{start_server, AppState, Cli};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "disco_server=info,disco_detect=info,disco_model=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Cli::parse().into_config()?;
    info!(
        model = %config.model_path.display(),
        face_detector = ?config.face_detector_path,
        face_embedder = ?config.face_embedder_path,
        deadline_ms = config.deadline_ms,
        "starting disco server"
    );

    let state = AppState::load(&config)?;
    start_server(&config, state).await
}
