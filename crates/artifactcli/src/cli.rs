//! Exposes the command line application.
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use artifact_cache::{ArtifactCache, Config};
use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::batch;
use crate::logging;

/// Artifact cache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch an artifact unless it is cached, and print one of its members.
    Get(GetArgs),

    /// Run a YAML list of requests concurrently against one cache and print a JSON report.
    Batch {
        /// Path to the batch file.
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[derive(Debug, Args)]
struct GetArgs {
    /// The key identifying the artifact.
    #[arg(long)]
    key: String,

    /// The size of the artifact in bytes, as accounted by the cache.
    #[arg(long)]
    size: u64,

    /// Where to fetch the artifact from.
    ///
    /// An absolute path, or a `file://`, `http(s)://`, or `s3://` URL.
    #[arg(long)]
    remote: String,

    /// Where to store the artifact locally.
    #[arg(long)]
    local: PathBuf,

    /// The member of the artifact to print.
    ///
    /// Empty for single-file artifacts.
    #[arg(long, default_value = "")]
    member: String,

    /// Write the member to this file instead of stdout.
    #[arg(long, short, value_name = "FILE")]
    output: Option<PathBuf>,
}

/// A local cache for artifacts in remote blob stores.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Overrides the log level of the configuration file.
    ///
    /// Possible values: off, error, warn, info, debug, trace
    #[arg(long, global = true)]
    log_level: Option<LevelFilter>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config()).context("failed loading config")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    // SAFETY: The runtime and its worker threads do not exist yet.
    unsafe { logging::init_logging(&config) };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create the runtime")?;

    runtime.block_on(run(config, cli.command))
}

async fn run(config: Config, command: Command) -> Result<()> {
    let cache = ArtifactCache::from_config(&config).context("failed to create the cache")?;
    tracing::debug!(
        capacity = cache.capacity(),
        policy = ?config.cache.policy,
        "Created artifact cache"
    );

    match command {
        Command::Get(args) => get(&cache, args).await,
        Command::Batch { file } => {
            let requests = batch::load(&file)?;
            let report = batch::run(Arc::new(cache), requests).await?;

            let mut stdout = std::io::stdout().lock();
            serde_json::to_writer_pretty(&mut stdout, &report)
                .context("failed to write the report")?;
            writeln!(stdout)?;
            Ok(())
        }
    }
}

async fn get(cache: &ArtifactCache, args: GetArgs) -> Result<()> {
    let contents = cache
        .get(
            args.key.as_str(),
            args.size,
            args.local,
            args.remote,
            &args.member,
        )
        .await
        .with_context(|| format!("failed to get artifact `{}`", args.key))?;

    match args.output {
        Some(path) => tokio::fs::write(&path, &contents)
            .await
            .with_context(|| format!("failed to write `{}`", path.display()))?,
        None => std::io::stdout()
            .lock()
            .write_all(&contents)
            .context("failed to write to stdout")?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use artifact_cache_test::{fixture, read_fixture, setup, tempdir};
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_get() {
        let cli = Cli::try_parse_from([
            "artifactcli",
            "get",
            "--key",
            "build-1",
            "--size",
            "252",
            "--remote",
            "s3://ci-artifacts/build-1.zip",
            "--local",
            "/var/cache/artifacts/build-1",
            "--member",
            "logs/build.log",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert_eq!(cli.log_level, Some(LevelFilter::DEBUG));
        assert_eq!(cli.config(), None);
        let Command::Get(args) = cli.command else {
            panic!("expected the get command");
        };
        assert_eq!(args.key, "build-1");
        assert_eq!(args.size, 252);
        assert_eq!(args.member, "logs/build.log");
        assert_eq!(args.output, None);
    }

    #[test]
    fn test_parse_batch() {
        let cli =
            Cli::try_parse_from(["artifactcli", "batch", "requests.yml", "-c", "config.yml"])
                .unwrap();

        assert_eq!(cli.config(), Some(Path::new("config.yml")));
        assert!(matches!(cli.command, Command::Batch { ref file } if file == Path::new("requests.yml")));
    }

    #[test]
    fn test_parse_rejects_invalid_size() {
        let result = Cli::try_parse_from([
            "artifactcli",
            "get",
            "--key",
            "a",
            "--size",
            "-5",
            "--remote",
            "/a",
            "--local",
            "/b",
        ]);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_get_to_file() {
        setup();
        let dir = tempdir();
        let output = dir.path().join("out.txt");

        let mut config = Config::default();
        config.cache.capacity = 1024;
        let cache = ArtifactCache::from_config(&config).unwrap();

        let args = GetArgs {
            key: "hello".into(),
            size: 12,
            remote: fixture("artifacts/hello.txt").to_string_lossy().into_owned(),
            local: dir.path().join("cache/hello"),
            member: String::new(),
            output: Some(output.clone()),
        };
        get(&cache, args).await.unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), read_fixture("artifacts/hello.txt"));
        assert!(cache.contains("hello").await);
    }

    #[tokio::test]
    async fn test_get_error_context() {
        setup();
        let dir = tempdir();
        let cache = ArtifactCache::from_config(&Config::default()).unwrap();

        let args = GetArgs {
            key: "empty".into(),
            size: 0,
            remote: "/does/not/matter".into(),
            local: dir.path().join("empty"),
            member: String::new(),
            output: None,
        };
        let error = get(&cache, args).await.unwrap_err();
        insta::assert_snapshot!(format!("{error:#}"), @"failed to get artifact `empty`: artifact size must be positive");
    }
}
