use brypt_config::Settings;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = brypt_config::parse_cli_arguments();
    let mut settings = Settings::load_from_file(&args.config)?;
    settings.apply_cli_overrides(&args)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    brypt_node::run(settings).await
}
