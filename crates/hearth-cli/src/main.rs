use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use hearth_client::{
    CachedGeocoder, FetcherFactory, GeocoderConfig, HttpGeocoder, ProxyCheckConfig, Routing,
    Selection, TorConfig, TorController, build_sources, check_proxies, load_sources,
};
use hearth_core::enrichment::{BaselineScorer, ScoringEnricher};
use hearth_core::fetcher::FetcherConfig;
use hearth_core::heatmap::{DEFAULT_GRID_SIZE, aggregate_heatmap};
use hearth_core::metrics::MetricsRecorder;
use hearth_core::orchestrator::{Orchestrator, OrchestratorConfig};
use hearth_core::proxy_pool::{ProxyPool, ProxyProtocol};
use hearth_core::store::MemoryStore;
use hearth_core::traits::{Enricher, PropertyStore};
use hearth_db::{Database, DatabaseConfig, PgPropertyRepository};

#[derive(Parser)]
#[command(name = "hearth", version, about = "Real-estate listing harvester")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest every configured source into the database
    Run {
        /// JSON file with source definitions
        #[arg(short, long, env = "HEARTH_SOURCES")]
        sources: PathBuf,

        /// Worker tasks; 1 runs sources one after another
        #[arg(short, long, env = "HEARTH_WORKERS", default_value_t = 1)]
        workers: usize,

        /// Deadline for one run, in seconds
        #[arg(long, env = "HEARTH_RUN_TIMEOUT", default_value_t = 3600)]
        timeout: u64,

        /// Repeat the run every SECS seconds until interrupted
        #[arg(long, env = "HEARTH_EVERY")]
        every: Option<u64>,

        /// Keep results in memory instead of writing to the database
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// Records per storage write
        #[arg(long, env = "HEARTH_BATCH_SIZE", default_value_t = 100)]
        batch_size: usize,

        /// OpenCage API key; Nominatim is used without one
        #[arg(long, env = "HEARTH_OPENCAGE_KEY")]
        opencage_key: Option<String>,

        /// Do not geocode listings published without coordinates
        #[arg(long, default_value_t = false)]
        no_geocode: bool,

        #[command(flatten)]
        fetch: FetchArgs,

        #[command(flatten)]
        tor: TorArgs,

        /// Route requests through the proxies listed in this file
        #[arg(long, env = "HEARTH_PROXY_FILE", conflicts_with = "use_tor")]
        proxy_file: Option<PathBuf>,

        /// Scheme for proxy lines without one (http, https, socks5)
        #[arg(long, env = "HEARTH_PROXY_PROTOCOL", default_value = "http")]
        proxy_protocol: ProxyProtocol,

        /// Pick proxies at random instead of round-robin
        #[arg(long, default_value_t = false)]
        random_proxy: bool,
    },

    /// Probe every proxy in a list and report which ones work
    CheckProxies {
        /// Proxy list, one address per line
        #[arg(short, long, env = "HEARTH_PROXY_FILE")]
        file: PathBuf,

        #[arg(long, env = "HEARTH_PROXY_PROTOCOL", default_value = "http")]
        protocol: ProxyProtocol,

        /// URL each proxy must fetch with HTTP 200
        #[arg(long, default_value = "https://httpbin.org/ip")]
        test_url: String,

        /// Per-request timeout, in seconds
        #[arg(long, default_value_t = 10)]
        timeout: u64,

        /// Rewrite the list with only the working proxies
        #[arg(long, default_value_t = false)]
        prune: bool,
    },

    /// Ask Tor for a new circuit
    RotateCircuit {
        #[command(flatten)]
        tor: TorArgs,

        /// Print the circuit status after rotating
        #[arg(long, default_value_t = false)]
        status: bool,
    },

    /// Print one stored listing as JSON
    Show {
        #[arg(long)]
        id: i64,
    },

    /// Aggregate stored listings into price heatmap points
    Heatmap {
        /// Only listings in this city
        #[arg(long)]
        city: Option<String>,

        /// Grid cell size in degrees
        #[arg(long, default_value_t = DEFAULT_GRID_SIZE)]
        grid: f64,
    },
}

#[derive(Args, Debug)]
struct FetchArgs {
    /// Minimum pause between requests of one source, in milliseconds
    #[arg(long, env = "HEARTH_RATE_LIMIT_MS", default_value_t = 2000)]
    rate_limit_ms: u64,

    /// Upper bound of the random extra pause, in milliseconds
    #[arg(long, env = "HEARTH_RATE_JITTER_MS", default_value_t = 2000)]
    rate_jitter_ms: u64,

    /// Retries after the first attempt
    #[arg(long, env = "HEARTH_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Base of the exponential backoff, in milliseconds
    #[arg(long, env = "HEARTH_RETRY_DELAY_MS", default_value_t = 2000)]
    retry_delay_ms: u64,

    /// HTTP request timeout, in seconds
    #[arg(long, env = "HEARTH_REQUEST_TIMEOUT", default_value_t = 30)]
    request_timeout: u64,
}

impl FetchArgs {
    fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig::default()
            .with_rate_limit(
                Duration::from_millis(self.rate_limit_ms),
                Duration::from_millis(self.rate_jitter_ms),
            )
            .with_retries(self.max_retries, Duration::from_millis(self.retry_delay_ms))
    }
}

#[derive(Args, Debug)]
struct TorArgs {
    /// Send requests through Tor and rotate circuits periodically
    #[arg(long, env = "HEARTH_USE_TOR", default_value_t = false)]
    use_tor: bool,

    #[arg(long, env = "HEARTH_TOR_HOST", default_value = "127.0.0.1")]
    tor_host: String,

    #[arg(long, env = "HEARTH_TOR_SOCKS_PORT", default_value_t = 9050)]
    tor_socks_port: u16,

    #[arg(long, env = "HEARTH_TOR_CONTROL_PORT", default_value_t = 9051)]
    tor_control_port: u16,

    #[arg(long, env = "HEARTH_TOR_PASSWORD", hide_env_values = true)]
    tor_password: Option<String>,
}

impl TorArgs {
    fn control_config(&self) -> TorConfig {
        TorConfig::default()
            .with_control_addr(format!("{}:{}", self.tor_host, self.tor_control_port))
            .with_password(self.tor_password.clone())
    }
}

/// Settings that stay fixed across scheduled runs.
struct Schedule {
    workers: usize,
    timeout: Duration,
    every: Option<Duration>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("hearth=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            sources,
            workers,
            timeout,
            every,
            dry_run,
            batch_size,
            opencage_key,
            no_geocode,
            fetch,
            tor,
            proxy_file,
            proxy_protocol,
            random_proxy,
        } => {
            let routing = if tor.use_tor {
                Routing::Tor {
                    socks_host: tor.tor_host.clone(),
                    socks_port: tor.tor_socks_port,
                    control: tor.control_config(),
                }
            } else if let Some(path) = proxy_file {
                let pool = load_proxy_pool(&path, proxy_protocol)?;
                let selection = if random_proxy {
                    Selection::Random
                } else {
                    Selection::RoundRobin
                };
                Routing::Proxies { pool, selection }
            } else {
                Routing::Direct
            };

            let geocoder = if no_geocode {
                None
            } else {
                let http = HttpGeocoder::new(GeocoderConfig::from_api_key(opencage_key))
                    .map_err(|e| anyhow::anyhow!(e))?;
                Some(CachedGeocoder::new(http, Duration::from_secs(24 * 60 * 60)))
            };

            let factory = FetcherFactory::new(
                routing,
                fetch.fetcher_config(),
                Duration::from_secs(fetch.request_timeout),
            );
            let specs = load_sources(&sources).map_err(|e| anyhow::anyhow!(e))?;
            let built = build_sources(&specs, &factory, geocoder.as_ref())
                .map_err(|e| anyhow::anyhow!(e))?;
            if built.is_empty() {
                anyhow::bail!("{} defines no sources", sources.display());
            }

            let schedule = Schedule {
                workers,
                timeout: Duration::from_secs(timeout),
                every: every.map(Duration::from_secs),
            };
            let config = OrchestratorConfig::default().with_batch_size(batch_size);
            let shutdown = shutdown_on_ctrl_c();

            if dry_run {
                let store = MemoryStore::new();
                let enricher = ScoringEnricher::new(BaselineScorer::default(), store.clone());
                let orchestrator = Orchestrator::with_enricher(built, store.clone(), enricher)
                    .with_config(config);
                cmd_run(&orchestrator, &schedule, &shutdown).await?;
                tracing::info!(listings = store.len(), "Dry run kept listings in memory");
            } else {
                let repo = connect_db().await?;
                let enricher = ScoringEnricher::new(BaselineScorer::default(), repo.clone());
                let orchestrator =
                    Orchestrator::with_enricher(built, repo, enricher).with_config(config);
                cmd_run(&orchestrator, &schedule, &shutdown).await?;
            }
        }
        Commands::CheckProxies {
            file,
            protocol,
            test_url,
            timeout,
            prune,
        } => {
            let config = ProxyCheckConfig {
                test_url,
                timeout: Duration::from_secs(timeout),
                ..ProxyCheckConfig::default()
            };
            cmd_check_proxies(&file, protocol, &config, prune).await?;
        }
        Commands::RotateCircuit { tor, status } => {
            let controller = TorController::new(tor.control_config());
            controller
                .new_identity()
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            println!("Circuit rotated");
            if status {
                let circuits = controller
                    .circuit_status()
                    .await
                    .map_err(|e| anyhow::anyhow!(e))?;
                println!("{circuits}");
            }
        }
        Commands::Show { id } => {
            let repo = connect_db().await?;
            match repo.find_by_id(id).await.map_err(|e| anyhow::anyhow!(e))? {
                Some(property) => println!("{}", serde_json::to_string_pretty(&property)?),
                None => println!("No listing with id {id}"),
            }
        }
        Commands::Heatmap { city, grid } => {
            let repo = connect_db().await?;
            let listings = repo
                .heatmap_listings(city.as_deref())
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            let points = aggregate_heatmap(listings.iter().map(|(p, s)| (p, *s)), grid);
            println!("{}", serde_json::to_string_pretty(&points)?);
        }
    }

    Ok(())
}

/// Connect with `DATABASE_*` settings and apply pending migrations.
async fn connect_db() -> Result<PgPropertyRepository> {
    let config = DatabaseConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.map_err(|e| anyhow::anyhow!(e))?;
    Ok(db.property_repo())
}

fn load_proxy_pool(path: &Path, protocol: ProxyProtocol) -> Result<ProxyPool> {
    let list = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read proxy list: {}", path.display()))?;
    let pool = ProxyPool::default();
    let added = pool.add_from_list(&list, protocol);
    if added == 0 {
        anyhow::bail!("{} contains no usable proxies", path.display());
    }
    tracing::info!(proxies = added, "Proxy pool loaded");
    Ok(pool)
}

/// The token fires on Ctrl-C.
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling");
            trigger.cancel();
        }
    });
    token
}

async fn cmd_run<S: PropertyStore, E: Enricher>(
    orchestrator: &Orchestrator<S, E>,
    schedule: &Schedule,
    shutdown: &CancellationToken,
) -> Result<()> {
    let metrics: &MetricsRecorder = orchestrator.metrics();

    loop {
        let run_cancel = shutdown.child_token();
        let deadline = {
            let token = run_cancel.clone();
            let timeout = schedule.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                tracing::warn!(timeout_secs = timeout.as_secs(), "Run deadline reached");
                token.cancel();
            })
        };

        let result = if schedule.workers > 1 {
            orchestrator
                .run_all_concurrent(&run_cancel, schedule.workers)
                .await
        } else {
            orchestrator.run_all(&run_cancel).await
        };
        deadline.abort();
        orchestrator.wait_enrichment().await;

        println!("{}", serde_json::to_string_pretty(&metrics.snapshot())?);

        let Some(every) = schedule.every else {
            return result.map(|_| ()).map_err(|e| anyhow::anyhow!(e));
        };

        match result {
            Ok(report) => tracing::info!(
                run_id = %report.run_id,
                saved = report.total_saved(),
                "Run complete"
            ),
            Err(e) => tracing::error!(error = %e, "Run finished with failures"),
        }

        tracing::info!(next_in_secs = every.as_secs(), "Waiting for next run");
        tokio::select! {
            () = tokio::time::sleep(every) => {}
            () = shutdown.cancelled() => {
                tracing::info!("Scheduler stopped");
                return Ok(());
            }
        }
    }
}

async fn cmd_check_proxies(
    file: &Path,
    protocol: ProxyProtocol,
    config: &ProxyCheckConfig,
    prune: bool,
) -> Result<()> {
    let pool = load_proxy_pool(file, protocol)?;
    let summary = check_proxies(&pool, config).await;

    for endpoint in pool.endpoints() {
        let status = if endpoint.is_working { "ok" } else { "dead" };
        println!("  [{status}] {}", endpoint.address);
    }
    println!("\n{} of {} proxies working", summary.working, summary.checked);

    if prune {
        let removed = pool.remove_failed();
        let working: Vec<String> = pool.endpoints().into_iter().map(|e| e.address).collect();
        let mut contents = working.join("\n");
        contents.push('\n');
        std::fs::write(file, contents)
            .with_context(|| format!("Failed to rewrite proxy list: {}", file.display()))?;
        tracing::info!(removed, "Pruned dead proxies");
    }

    Ok(())
}
