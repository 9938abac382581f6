use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use proxy_vetter::{
    config::is_valid_service_url,
    refresh::{EgressRefresher, RefreshOutcome},
    store::SOLVER_URL_KEY,
    tui::RunMonitor,
    Config, ProxyParser, ProxyStore, ProxyType, SqliteStore, Strategy, VetterService,
};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Verify proxies for fraud risk and keep the clean ones
#[derive(Parser)]
#[command(name = "proxy-vetter")]
#[command(about = "Verify proxies for fraud risk and keep the clean ones")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Database URL
    #[arg(short, long, default_value = "sqlite://proxy-vetter.db")]
    database: String,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Challenge solver URL, overrides the stored setting
    #[arg(long)]
    solver_url: Option<String>,

    /// MaxMind City database used to fill in missing geography
    #[arg(long)]
    mmdb: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Import proxies from a file, probing each one before it is stored
    Import {
        /// Input file containing proxies
        input: PathBuf,
        /// Protocol assumed for lines without a scheme (http, https, socks4, socks4a, socks5)
        #[arg(short = 't', long, default_value = "http")]
        proxy_type: String,
        /// Number of concurrent probes
        #[arg(short = 'n', long, default_value = "10")]
        concurrency: usize,
        /// Timeout in seconds for each protocol probe
        #[arg(long, default_value = "10")]
        timeout: u64,
    },
    /// Verify all stored proxies
    Run {
        /// Verification strategy (api, scrape)
        #[arg(short, long, default_value = "api")]
        strategy: String,
        /// Number of concurrent workers
        #[arg(short = 'n', long, default_value = "5")]
        limit: usize,
        /// Follow the run in an interactive monitor
        #[arg(long)]
        tui: bool,
    },
    /// Show the clean proxies of the last run
    Results {
        /// Also write them to this file in IP:PORT format
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Re-probe stored proxies when their egress address changed
    Refresh {
        /// Keep checking on an interval until interrupted
        #[arg(long)]
        watch: bool,
        /// Interval in seconds between checks
        #[arg(long, default_value = "600")]
        interval: u64,
    },
    /// List stored proxies
    Proxies,
    /// Manage API tokens
    Token {
        #[command(subcommand)]
        action: EntryAction,
    },
    /// Manage bypass proxies used against the challenge page
    Bypass {
        #[command(subcommand)]
        action: EntryAction,
    },
    /// Manage blocked egress addresses
    Block {
        #[command(subcommand)]
        action: EntryAction,
    },
    /// Configure the challenge solver
    Solver {
        #[command(subcommand)]
        action: SolverAction,
    },
}

#[derive(Subcommand)]
enum EntryAction {
    /// Add an entry
    Add { value: String },
    /// List entries
    List,
    /// Remove an entry by ID
    Remove { id: i64 },
}

#[derive(Subcommand)]
enum SolverAction {
    /// Store the solver URL
    Set { url: String },
    /// Show the solver URL in use
    Show,
}

fn init_logging(cli: &Cli, interactive: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    match &cli.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        // the monitor owns the terminal
        None if interactive => {}
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let interactive = matches!(cli.command, Commands::Run { tui: true, .. });
    init_logging(&cli, interactive)?;

    let mut config = Config::new().with_database_url(cli.database.clone());
    if let Some(url) = &cli.solver_url {
        config = config.with_solver_url(url.clone());
    }
    if let Some(path) = &cli.mmdb {
        config = config.with_mmdb_path(path.clone());
    }

    let store = Arc::new(SqliteStore::connect(&config.database_url).await?);

    match cli.command {
        Commands::Import {
            input,
            proxy_type,
            concurrency,
            timeout,
        } => {
            let ptype: ProxyType = proxy_type.parse()?;
            let proxies = ProxyParser::parse_file(&input, ptype)?;
            println!("Loaded {} proxies from {:?}", proxies.len(), input);

            let config = config
                .with_batch_concurrency(concurrency)
                .with_probe_timeout(Duration::from_secs(timeout));
            let service = VetterService::new(store, config)?;
            let (id, handle) = service.submit_batch_with_handle(proxies);
            println!("Import job {}", id);

            let mut printed = 0;
            loop {
                let finished = handle.is_finished();
                if let Some(status) = service.job_status(id) {
                    for line in &status.lines[printed..] {
                        println!("{}", line);
                    }
                    printed = status.lines.len();
                    if finished {
                        println!(
                            "Done: {} of {} proxies added",
                            status.added, status.total
                        );
                        break;
                    }
                }
                if finished {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }
        Commands::Run {
            strategy,
            limit,
            tui,
        } => {
            let strategy: Strategy = strategy.parse()?;
            let service = Arc::new(VetterService::new(store, config)?);
            let id = service.start_run(strategy, limit).await?;

            if tui {
                let mut monitor = RunMonitor::new(Arc::clone(&service));
                monitor.run().await?;
                service.stop_run().await;
            } else {
                println!("Run {} started ({} strategy, {} workers)", id, strategy, limit);
                let run = service
                    .current_run()
                    .ok_or_else(|| anyhow!("run {} vanished", id))?;

                let mut ticker = tokio::time::interval(Duration::from_secs(5));
                loop {
                    tokio::select! {
                        _ = run.finished() => break,
                        _ = tokio::signal::ctrl_c() => {
                            println!("Interrupted, stopping run");
                            service.stop_run().await;
                            break;
                        }
                        _ = ticker.tick() => {
                            let s = run.snapshot();
                            info!(progress = s.percent, queued = s.remaining, clean = s.accepted, "run progress");
                        }
                    }
                }

                let results = service.results().await?;
                println!("Clean proxies: {}", results.len());
                for record in &results {
                    println!(
                        "  {} [{}] {}",
                        record.ip.as_deref().unwrap_or("?"),
                        record.proxy_type.map(|t| t.as_str()).unwrap_or("?"),
                        record.country_code.as_deref().unwrap_or("")
                    );
                }
            }
        }
        Commands::Results { output } => {
            let results = store.list_records().await?;
            if results.is_empty() {
                println!("No clean proxies recorded.");
            }
            for record in &results {
                println!(
                    "{} [{}] score={} {} {} {}",
                    record.ip.as_deref().unwrap_or("?"),
                    record.proxy_type.map(|t| t.as_str()).unwrap_or("?"),
                    record.fraud_score.map_or("?".to_string(), |s| s.to_string()),
                    record.country_code.as_deref().unwrap_or(""),
                    record.city.as_deref().unwrap_or(""),
                    record.isp.as_deref().unwrap_or("")
                );
            }

            if let Some(output_path) = output {
                let stored = store.list_proxies().await?;
                let clean: Vec<_> = stored
                    .into_iter()
                    .filter(|p| results.iter().any(|r| r.ip.as_deref() == Some(p.host.as_str())))
                    .collect();
                ProxyParser::save_to_file(&clean, &output_path)?;
                println!("Saved {} proxies to {:?}", clean.len(), output_path);
            }
        }
        Commands::Refresh { watch, interval } => {
            let config = config.with_refresh_interval(Duration::from_secs(interval));
            let service = VetterService::new(store, config)?;
            let refresher = EgressRefresher::new(
                Arc::clone(service.store()),
                service.probe().clone(),
                Arc::clone(service.config()),
            );

            if watch {
                let cancel = CancellationToken::new();
                let stopper = cancel.clone();
                tokio::spawn(async move {
                    let _ = tokio::signal::ctrl_c().await;
                    stopper.cancel();
                });
                refresher.watch(cancel).await;
            } else {
                match refresher.check_once().await? {
                    RefreshOutcome::NothingStored => println!("No proxies stored."),
                    RefreshOutcome::NoReachableProxy => println!("No stored proxy is reachable."),
                    RefreshOutcome::Unchanged => println!("Egress unchanged."),
                    RefreshOutcome::Refreshed { updated, total } => {
                        println!("Egress changed, refreshed {} of {} proxies", updated, total)
                    }
                }
            }
        }
        Commands::Proxies => {
            let proxies = store.list_proxies().await?;
            if proxies.is_empty() {
                println!("No proxies stored.");
            }
            for proxy in proxies {
                println!("{} {}", proxy, proxy.proxy_type);
            }
        }
        Commands::Token { action } => match action {
            EntryAction::Add { value } => match store.add_token(&value).await? {
                Some(id) => println!("Token added: {}", id),
                None => println!("Token already stored"),
            },
            EntryAction::List => {
                for token in store.list_tokens().await? {
                    println!("{} {}", token.id, token.token);
                }
            }
            EntryAction::Remove { id } => {
                store.remove_token(id).await?;
                println!("Token removed: {}", id);
            }
        },
        Commands::Bypass { action } => match action {
            EntryAction::Add { value } => {
                let proxy = ProxyParser::parse_line(&value, ProxyType::Http)
                    .ok_or_else(|| anyhow!("expected host:port, got {:?}", value))?;
                match store.add_bypass_proxy(&proxy.host, proxy.port).await? {
                    Some(id) => println!("Bypass proxy added: {}", id),
                    None => println!("Bypass proxy already stored"),
                }
            }
            EntryAction::List => {
                for bypass in store.list_bypass_proxies().await? {
                    println!("{} {}", bypass.id, bypass);
                }
            }
            EntryAction::Remove { id } => {
                store.remove_bypass_proxy(id).await?;
                println!("Bypass proxy removed: {}", id);
            }
        },
        Commands::Block { action } => match action {
            EntryAction::Add { value } => {
                let blocked = store.add_blocked(&value).await?;
                println!("Blocked {} (mask {}.*)", blocked.address, blocked.mask);
            }
            EntryAction::List => {
                for blocked in store.list_blocked().await? {
                    println!("{} {} {}.*", blocked.id, blocked.address, blocked.mask);
                }
            }
            EntryAction::Remove { id } => {
                store.remove_blocked(id).await?;
                println!("Block removed: {}", id);
            }
        },
        Commands::Solver { action } => match action {
            SolverAction::Set { url } => {
                if !is_valid_service_url(&url) {
                    return Err(anyhow!("not an http(s) URL: {}", url));
                }
                store.set_setting(SOLVER_URL_KEY, &url).await?;
                println!("Solver URL set to {}", url);
            }
            SolverAction::Show => {
                let service = VetterService::new(store, config)?;
                match service.solver_url().await? {
                    Some(url) => println!("{}", url),
                    None => println!("No solver URL configured."),
                }
            }
        },
    }

    Ok(())
}
