use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;
use url::Url;

use stormsight::app::{
    App, DownloadResult, DownloadSpec, EventsResult, ProbeResult, SearchQuery, SearchResult,
};
use stormsight::assets::{AssetProber, AssetResolver, HttpAssetProber, RemoteStat};
use stormsight::catalog::{CatalogClient, CatalogSession, StacHttpClient};
use stormsight::config::{ConfigLoader, ResolvedConfig};
use stormsight::domain::{AssetRole, EventId, ItemId, PhaseFilter};
use stormsight::download::{
    AssetFetcher, DownloadManager, DownloadOptions, FetchBody, HttpAssetFetcher,
};
use stormsight::error::StormsightError;
use stormsight::geometry::{BoundingBox, Region};
use stormsight::output::{JsonOutput, OutputMode, StderrSink};
use stormsight::preview::{HttpRangeClient, PreviewAdapter, PreviewOptions, RangeClient};
use stormsight::store::Store;

#[derive(Parser)]
#[command(name = "stormsight")]
#[command(about = "Browse and fetch disaster-response satellite imagery from STAC catalogs")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "List disaster events published by the catalog")]
    Events(EventsArgs),
    #[command(about = "Search an event's imagery by phase and area")]
    Search(SearchArgs),
    #[command(about = "Inspect an item's asset and its tile pyramid")]
    Probe(ProbeArgs),
    #[command(about = "Download assets with resume and checksum verification")]
    Download(DownloadArgs),
}

#[derive(Args)]
struct EventsArgs {
    #[arg(long)]
    refresh: bool,

    #[arg(long)]
    catalog: Option<Url>,
}

#[derive(Args)]
struct SearchArgs {
    event: EventId,

    #[arg(long, default_value = "any")]
    phase: PhaseFilter,

    #[arg(long)]
    bbox: Option<BoundingBox>,

    #[arg(long, conflicts_with = "bbox")]
    region: Option<String>,

    #[arg(long)]
    catalog: Option<Url>,
}

#[derive(Args)]
struct ProbeArgs {
    event: EventId,

    item: ItemId,

    #[arg(long, default_value = "visual")]
    role: AssetRole,

    #[arg(long)]
    catalog: Option<Url>,
}

#[derive(Args)]
struct DownloadArgs {
    event: EventId,

    #[arg(long, value_delimiter = ',')]
    items: Vec<ItemId>,

    #[arg(long, default_value = "visual")]
    role: AssetRole,

    #[arg(long)]
    out: Option<Utf8PathBuf>,

    #[arg(long, default_value = "any")]
    phase: PhaseFilter,

    #[arg(long)]
    bbox: Option<BoundingBox>,

    #[arg(long, conflicts_with = "bbox")]
    region: Option<String>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    force: bool,

    #[arg(long)]
    catalog: Option<Url>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<StormsightError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &StormsightError) -> u8 {
    match error {
        StormsightError::InvalidEventId(_)
        | StormsightError::InvalidItemId(_)
        | StormsightError::InvalidPhase(_)
        | StormsightError::InvalidRole(_)
        | StormsightError::InvalidCriteria(_)
        | StormsightError::EventNotFound(_)
        | StormsightError::ItemNotFound(_)
        | StormsightError::AssetNotFound { .. }
        | StormsightError::MissingCatalogUrl
        | StormsightError::ConfigRead(_)
        | StormsightError::ConfigParse(_) => 2,
        StormsightError::CatalogHttp(_)
        | StormsightError::CatalogStatus { .. }
        | StormsightError::DownloadHttp(_)
        | StormsightError::DownloadStatus { .. }
        | StormsightError::UnreachableAsset { .. }
        | StormsightError::RangeRead { .. }
        | StormsightError::DownloadStalled(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    let config = ConfigLoader::resolve(cli.config.as_deref()).into_diagnostic()?;
    let store = Store::new(config.staging_dir.as_deref()).into_diagnostic()?;

    match cli.command {
        Commands::Events(args) => {
            let session = catalog_session(args.catalog.clone(), &config)?;
            let app = App::new(
                session,
                AssetResolver::new(NopProber),
                PreviewAdapter::new(NopRange, preview_options(&config)),
                DownloadManager::new(NopFetcher, download_options(&config, None)),
                store,
            );
            run_events(args, app, output_mode)
        }
        Commands::Search(args) => {
            let session = catalog_session(args.catalog.clone(), &config)?;
            let app = App::new(
                session,
                AssetResolver::new(NopProber),
                PreviewAdapter::new(NopRange, preview_options(&config)),
                DownloadManager::new(NopFetcher, download_options(&config, None)),
                store,
            );
            run_search(args, app, output_mode)
        }
        Commands::Probe(args) => {
            let session = catalog_session(args.catalog.clone(), &config)?;
            let prober = HttpAssetProber::new(config.timeout_secs).into_diagnostic()?;
            let range = HttpRangeClient::new(config.timeout_secs).into_diagnostic()?;
            let app = App::new(
                session,
                AssetResolver::new(prober),
                PreviewAdapter::new(range, preview_options(&config)),
                DownloadManager::new(NopFetcher, download_options(&config, None)),
                store,
            );
            run_probe(args, app, output_mode)
        }
        Commands::Download(args) => {
            let session = catalog_session(args.catalog.clone(), &config)?;
            let fetcher = HttpAssetFetcher::new().into_diagnostic()?;
            let app = App::new(
                session,
                AssetResolver::new(NopProber),
                PreviewAdapter::new(NopRange, preview_options(&config)),
                DownloadManager::new(fetcher, download_options(&config, args.workers)),
                store,
            );
            run_download(args, app, output_mode)
        }
    }
}

fn catalog_session(
    flag: Option<Url>,
    config: &ResolvedConfig,
) -> miette::Result<CatalogSession<StacHttpClient>> {
    let root = flag
        .or_else(|| config.catalog_url.clone())
        .ok_or(StormsightError::MissingCatalogUrl)
        .into_diagnostic()?;
    let client = StacHttpClient::new(config.timeout_secs).into_diagnostic()?;
    Ok(CatalogSession::new(client, root))
}

fn preview_options(config: &ResolvedConfig) -> PreviewOptions {
    PreviewOptions {
        cache_bytes: config.tile_cache_bytes,
        max_parallel_reads: config.tile_concurrency,
    }
}

fn download_options(config: &ResolvedConfig, workers: Option<usize>) -> DownloadOptions {
    DownloadOptions {
        workers: workers.unwrap_or(config.workers),
        retry_limit: config.retry_limit,
    }
}

fn load_region(
    bbox: Option<BoundingBox>,
    region_file: Option<&str>,
) -> miette::Result<Option<Region>> {
    if let Some(bbox) = bbox {
        return Ok(Some(Region::Bbox(bbox)));
    }
    let Some(path) = region_file else {
        return Ok(None);
    };
    let text = std::fs::read_to_string(path)
        .map_err(|err| {
            StormsightError::InvalidCriteria(format!("cannot read region file {path}: {err}"))
        })
        .into_diagnostic()?;
    let region = Region::from_geojson(&text).into_diagnostic()?;
    Ok(Some(region))
}

fn run_events<C: CatalogClient, P: AssetProber, R: RangeClient, F: AssetFetcher + 'static>(
    args: EventsArgs,
    app: App<C, P, R, F>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    match output_mode {
        OutputMode::Json => {
            let result = app.events(args.refresh, &JsonOutput).into_diagnostic()?;
            JsonOutput::print_events(&result).into_diagnostic()?;
            Ok(())
        }
        OutputMode::Human => {
            let result = app.events(args.refresh, &StderrSink).into_diagnostic()?;
            print_events_summary(&result);
            Ok(())
        }
    }
}

fn run_search<C: CatalogClient, P: AssetProber, R: RangeClient, F: AssetFetcher + 'static>(
    args: SearchArgs,
    app: App<C, P, R, F>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let region = load_region(args.bbox, args.region.as_deref())?;
    let query = SearchQuery {
        event: args.event,
        phase: args.phase,
        region,
    };
    match output_mode {
        OutputMode::Json => {
            let result = app.search(query, &JsonOutput).into_diagnostic()?;
            JsonOutput::print_search(&result).into_diagnostic()?;
            Ok(())
        }
        OutputMode::Human => {
            let result = app.search(query, &StderrSink).into_diagnostic()?;
            print_search_summary(&result);
            Ok(())
        }
    }
}

fn run_probe<C: CatalogClient, P: AssetProber, R: RangeClient, F: AssetFetcher + 'static>(
    args: ProbeArgs,
    app: App<C, P, R, F>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    match output_mode {
        OutputMode::Json => {
            let result = app
                .probe(&args.event, &args.item, &args.role, &JsonOutput)
                .into_diagnostic()?;
            JsonOutput::print_probe(&result).into_diagnostic()?;
            Ok(())
        }
        OutputMode::Human => {
            let result = app
                .probe(&args.event, &args.item, &args.role, &StderrSink)
                .into_diagnostic()?;
            print_probe_summary(&result);
            Ok(())
        }
    }
}

fn run_download<C: CatalogClient, P: AssetProber, R: RangeClient, F: AssetFetcher + 'static>(
    args: DownloadArgs,
    app: App<C, P, R, F>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let region = load_region(args.bbox, args.region.as_deref())?;
    let spec = DownloadSpec {
        event: args.event,
        items: args.items,
        role: args.role,
        phase: args.phase,
        region,
        dest_dir: args.out,
        force: args.force,
    };
    match output_mode {
        OutputMode::Json => {
            let result = app.download(spec, &JsonOutput).into_diagnostic()?;
            JsonOutput::print_download(&result).into_diagnostic()?;
            Ok(())
        }
        OutputMode::Human => {
            let result = app.download(spec, &StderrSink).into_diagnostic()?;
            print_download_summary(&result);
            Ok(())
        }
    }
}

fn print_events_summary(result: &EventsResult) {
    let green = "\x1b[32m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    let title = result.catalog_title.as_deref().unwrap_or(&result.catalog_id);
    println!(
        "{cyan}{title}{reset} ({} events, fetched {})",
        result.events.len(),
        result.fetched_at
    );
    for event in &result.events {
        println!("  {green}{}{reset}  {}", event.id, event.title);
    }
}

fn print_search_summary(result: &SearchResult) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!(
        "{cyan}{}{reset} ({} of {} items match)",
        result.title,
        result.items.len(),
        result.total_items
    );
    if let Some(description) = &result.description {
        println!("{description}");
    }
    for item in &result.items {
        let phase = item.phase.as_deref().unwrap_or("-");
        let sensor = item.sensor.as_deref().unwrap_or("-");
        let cloud = item
            .cloud_cover
            .map(|value| format!("{value:.0}%"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {green}{}{reset}  {}  phase={phase} sensor={sensor} cloud={cloud}",
            item.id, item.datetime
        );
    }
    if !result.issues.is_empty() {
        println!(
            "{yellow}{} catalog nodes skipped with errors{reset}",
            result.issues.len()
        );
        for issue in &result.issues {
            println!("{yellow}  {}: {}{reset}", issue.node, issue.error);
        }
    }
}

fn print_probe_summary(result: &ProbeResult) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!("{cyan}{} ({}){reset}", result.item, result.role);
    println!("  url: {}", result.url);
    println!("  media type: {}", result.media_type);
    match result.byte_size {
        Some(bytes) => println!("  size: {bytes} bytes"),
        None => println!("  size: unknown"),
    }
    println!(
        "  range requests: {}",
        if result.supports_range {
            "supported"
        } else {
            "unsupported"
        }
    );
    if let Some(expires) = &result.expires_at {
        println!("  {yellow}signed link expires {expires}{reset}");
    }
    for (level, info) in result.levels.iter().enumerate() {
        println!(
            "  {green}L{level}{reset} {}x{} tiles {}x{} ({}x{} grid)",
            info.width,
            info.height,
            info.tile_width,
            info.tile_height,
            info.tiles_across,
            info.tiles_down
        );
    }
}

fn print_download_summary(result: &DownloadResult) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    let completed = result
        .outcomes
        .iter()
        .filter(|outcome| outcome.status == "completed")
        .count();
    let cached = result
        .outcomes
        .iter()
        .filter(|outcome| outcome.status == "cache-hit")
        .count();
    let failed = result
        .outcomes
        .iter()
        .filter(|outcome| outcome.status == "failed")
        .count();

    println!("{cyan}{} downloads{reset}", result.event);
    println!("{green}completed: {completed}, cache hits: {cached}{reset}");
    if failed > 0 {
        println!("{red}failed: {failed}{reset}");
    }

    for outcome in &result.outcomes {
        let color = match outcome.status.as_str() {
            "completed" | "cache-hit" => green,
            "failed" => red,
            _ => yellow,
        };
        let verified = if outcome.verified { ", verified" } else { "" };
        println!(
            "{color}  {} {} ({} bytes{verified}){reset}",
            outcome.item, outcome.status, outcome.bytes
        );
        if let Some(destination) = &outcome.destination {
            println!("{color}    -> {destination}{reset}");
        }
        if let Some(error) = &outcome.error {
            println!("{red}    {error}{reset}");
        }
    }
}

#[derive(Clone, Copy)]
struct NopProber;
struct NopRange;
struct NopFetcher;

impl AssetProber for NopProber {
    fn probe(&self, url: &Url) -> Result<RemoteStat, StormsightError> {
        Err(StormsightError::UnreachableAsset {
            url: url.to_string(),
            reason: "asset prober not configured".to_string(),
        })
    }
}

impl RangeClient for NopRange {
    fn probe(&self, url: &Url) -> Result<RemoteStat, StormsightError> {
        Err(StormsightError::UnreachableAsset {
            url: url.to_string(),
            reason: "range client not configured".to_string(),
        })
    }

    fn read_range(
        &self,
        url: &Url,
        _start: u64,
        _length: u64,
    ) -> Result<Vec<u8>, StormsightError> {
        Err(StormsightError::UnreachableAsset {
            url: url.to_string(),
            reason: "range client not configured".to_string(),
        })
    }
}

impl AssetFetcher for NopFetcher {
    fn fetch(&self, _url: &Url, _offset: u64) -> Result<FetchBody, StormsightError> {
        Err(StormsightError::DownloadHttp(
            "download client not configured".to_string(),
        ))
    }
}
