use tracing::info;

mod app;
mod listener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sitrep=info".into()),
        )
        .init();

    // load config: explicit path via SITREP_CONFIG > ./sitrep.toml, then
    // documented env overrides on top
    let config_path = std::env::var("SITREP_CONFIG").ok();
    let config = sitrep_core::config::SitrepConfig::load(config_path.as_deref())
        .and_then(|config| {
            config.validate()?;
            Ok(config)
        })
        .unwrap_or_else(|e| {
            eprintln!("configuration error: {e}");
            std::process::exit(2);
        });

    info!(model = %config.llm.gemini_model, db = %config.database.path, "sitrep starting");
    app::run(config).await
}
