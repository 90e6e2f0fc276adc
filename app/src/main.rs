mod shell;

use std::path::PathBuf;

use clap::Parser;
use tabula_adapters::{DuckDbBackend, ReqwestTransport};
use tabula_core::config::TabulaConfig;
use tabula_core::connections::EMBEDDED_CONNECTION_ID;
use tabula_core::snapshot::FileSnapshotStore;
use tabula_core::SessionController;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tabula", version, about = "Interactive SQL shell over DuckDB and HTTP analytics endpoints")]
struct Cli {
    /// Path to config.toml; defaults to the platform config directory.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Start with a fresh workspace instead of the saved session.
    #[arg(long)]
    no_restore: bool,
}

fn load_config(cli: &Cli) -> Result<TabulaConfig, Box<dyn std::error::Error>> {
    let config = match &cli.config {
        Some(path) => TabulaConfig::load_from_path(path)?,
        None => TabulaConfig::load_default()?,
    };
    Ok(config)
}

async fn run_app<R, W>(
    cli: &Cli,
    config: &TabulaConfig,
    input: R,
    output: W,
) -> Result<(), Box<dyn std::error::Error>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let store = FileSnapshotStore::new(config.resolved_snapshot_path()?);
    let mut session = SessionController::new(
        DuckDbBackend::open(config.embedded_path.clone()),
        ReqwestTransport::default(),
        config.session_options(),
    );

    let resume = if cli.no_restore {
        None
    } else {
        match store.load()? {
            Some(snapshot) => session.restore(snapshot).await,
            None => None,
        }
    };

    session.initialize_default().await?;
    if let Some(id) = resume.filter(|id| id != EMBEDDED_CONNECTION_ID) {
        if let Err(error) = session.connect(&id).await {
            tracing::warn!(%error, connection = %id, "could not resume saved connection");
        }
    }

    shell::run(&mut session, input, output).await?;

    store.persist(&session.snapshot().await)?;
    session.teardown().await;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    run_app(
        &cli,
        &config,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use std::fs;

    use clap::Parser;
    use tabula_core::config::TabulaConfig;
    use tabula_core::snapshot::FileSnapshotStore;
    use tempfile::TempDir;

    use super::{load_config, run_app, Cli};

    fn config_in(temp_dir: &TempDir) -> TabulaConfig {
        TabulaConfig {
            baseline_extensions: Vec::new(),
            snapshot_path: Some(temp_dir.path().join("session.json")),
            ..TabulaConfig::default()
        }
    }

    #[test]
    fn parses_flags() {
        let cli = Cli::try_parse_from(["tabula", "--config", "/tmp/tabula.toml", "--no-restore"])
            .expect("flags should parse");
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("/tmp/tabula.toml")));
        assert!(cli.no_restore);
    }

    #[test]
    fn loads_config_from_explicit_path() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "log_filter = \"debug\"\nbaseline_extensions = []\n")
            .expect("failed to write config");

        let cli = Cli::try_parse_from(["tabula", "--config", path.to_str().expect("utf8 path")])
            .expect("flags should parse");
        let config = load_config(&cli).expect("config should load");
        assert_eq!(config.log_filter, "debug");
        assert!(config.baseline_extensions.is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn session_is_persisted_and_restored_between_runs() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let config = config_in(&temp_dir);
        let cli = Cli::try_parse_from(["tabula"]).expect("flags should parse");

        let mut output = Vec::new();
        run_app(&cli, &config, &b"SELECT 41 + 1 AS answer\n.tab new\n"[..], &mut output)
            .await
            .expect("first run should succeed");

        let saved = FileSnapshotStore::new(temp_dir.path().join("session.json"))
            .load()
            .expect("snapshot should parse")
            .expect("snapshot should exist");
        assert_eq!(saved.query_history[0].query_text, "SELECT 41 + 1 AS answer");
        assert_eq!(saved.tabs.len(), 3);

        let mut output = Vec::new();
        run_app(&cli, &config, &b".history\n.tabs\n"[..], &mut output)
            .await
            .expect("second run should succeed");
        let output = String::from_utf8(output).expect("utf8 output");
        assert!(output.contains("SELECT 41 + 1 AS answer"), "{output}");
        assert!(output.contains("Query 2"), "{output}");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn no_restore_starts_from_a_blank_workspace() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let config = config_in(&temp_dir);

        let first = Cli::try_parse_from(["tabula"]).expect("flags should parse");
        run_app(&first, &config, &b"SELECT 1\n"[..], Vec::new())
            .await
            .expect("first run should succeed");

        let fresh = Cli::try_parse_from(["tabula", "--no-restore"]).expect("flags should parse");
        let mut output = Vec::new();
        run_app(&fresh, &config, &b".history\n"[..], &mut output)
            .await
            .expect("second run should succeed");
        assert!(output.is_empty());
    }
}
