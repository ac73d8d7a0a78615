use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use water_balance::raster_io::RasterIO;
use water_balance::{
    Calendar, Catalog, Config, PipelineOutcome, PipelineResult, Selection, SliderPreset, Toggles,
    WaterBalanceEngine,
};

#[derive(Parser, Debug)]
#[command(name = "water-balance")]
#[command(about = "Region and crop weighted water balance time series")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "WATER_BALANCE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Catalog manifest, overrides the configured path
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List countries
    Countries {
        /// Case-insensitive substring filter
        #[arg(short, long)]
        filter: Option<String>,
    },
    /// List the sub-region options of a country
    States { country: String },
    /// Compute the time series for one selection
    Run(RunArgs),
    /// Compute every sub-region of a country
    Batch {
        #[arg(long)]
        country: String,
        #[arg(long, default_value = "none")]
        crop: String,
        #[arg(long, default_value_t = 3)]
        window: u32,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long)]
    country: String,
    #[arg(long, default_value = "All")]
    state: String,
    #[arg(long, default_value = "none")]
    crop: String,
    /// Integration window in months (3 or 12)
    #[arg(long, default_value_t = 3)]
    window: u32,
    #[arg(long)]
    no_historical: bool,
    #[arg(long)]
    no_forecast: bool,
    /// First month shown in the chart summary
    #[arg(long, conflicts_with = "preset")]
    since: Option<NaiveDate>,
    /// all, last-5-years or last-5-months
    #[arg(long)]
    preset: Option<SliderPreset>,
    /// CSV output path, defaults to the export file name in the output directory
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Also write forecast map points to this CSV file
    #[arg(long)]
    map: Option<PathBuf>,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn init_thread_pool(config: &Config) {
    let cpu_cores = config.get_cpu_cores();
    info!("Setting up Rayon thread pool with {} cores", cpu_cores);
    if let Err(e) = rayon::ThreadPoolBuilder::new()
        .num_threads(cpu_cores)
        .build_global()
    {
        warn!("Failed to configure Rayon thread pool: {}", e);
    }
}

fn build_engine(config: &Config, catalog_override: Option<&Path>) -> Result<WaterBalanceEngine> {
    let catalog_path = catalog_override.unwrap_or(&config.catalog_path);
    let catalog = Catalog::load(catalog_path)
        .with_context(|| format!("Failed to load catalog {}", catalog_path.display()))?;
    let calendar = Calendar::new(config.historical_start, config.initial_conditions())?;
    info!(
        "Initial conditions {}-{:02}",
        calendar.initial_conditions().year(),
        calendar.initial_conditions().month()
    );
    Ok(WaterBalanceEngine::new(Arc::new(catalog), calendar))
}

fn write_table(result: &PipelineResult, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    result.table.write_csv(BufWriter::new(file))?;
    info!("Wrote {} rows to {}", result.table.len(), path.display());
    Ok(())
}

fn print_summary(engine: &WaterBalanceEngine, result: &PipelineResult, cutoff: Option<NaiveDate>) -> Result<()> {
    let view = engine.chart(result, cutoff)?;
    if let Some(title) = engine.chart_title(result) {
        println!("{}", title);
    }
    println!(
        "  historical points: {}, forecast points: {}, bridged: {}",
        view.historical.len(),
        view.forecast.len(),
        !view.bridge.is_empty()
    );
    if let Some((historical, forecast)) = result.nrows {
        println!("  weighted cells: historical {}, forecast {}", historical, forecast);
    }
    println!("  map points: {} (zoom {:.2})", result.forecast_map.len(), result.map_zoom);

    let display = result.table.display_rows();
    for row in display.iter().take(12) {
        let value = row.percentile.map_or_else(|| "-".to_string(), |v| format!("{:.4}", v));
        println!("  {}  {:<10}  {}", row.time, row.kind.as_str(), value);
    }
    if display.len() > 12 {
        println!("  ... {} more rows", display.len() - 12);
    }
    Ok(())
}

fn run(engine: &WaterBalanceEngine, config: &Config, args: RunArgs) -> Result<()> {
    let toggles = Toggles {
        historical: !args.no_historical,
        forecast: !args.no_forecast,
    };
    let selection = Selection::new(args.country, args.state, args.crop, args.window).with_toggles(toggles);

    let result = match engine.compute(&selection)? {
        PipelineOutcome::Ready(result) => result,
        PipelineOutcome::NoData => {
            println!("No data available for {} / {}", selection.country, selection.state);
            return Ok(());
        }
    };

    let cutoff = match (args.since, args.preset) {
        (Some(since), _) => Some(since),
        (None, Some(preset)) => engine.calendar().cutoff(preset),
        (None, None) => None,
    };
    print_summary(engine, &result, cutoff)?;

    let output = args
        .output
        .unwrap_or_else(|| config.output_dir.join(engine.export_filename(&result)));
    write_table(&result, &output)?;

    if let Some(map_path) = args.map {
        let file = File::create(&map_path)
            .with_context(|| format!("Failed to create {}", map_path.display()))?;
        RasterIO::write_map_csv(BufWriter::new(file), &result.forecast_map)?;
        info!("Wrote {} map points to {}", result.forecast_map.len(), map_path.display());
    }
    Ok(())
}

fn batch(engine: &WaterBalanceEngine, config: &Config, country: &str, crop: &str, window: u32) -> Result<()> {
    let states = engine.catalog().geometry.state_options(country)?;

    let pb = ProgressBar::new(states.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?,
    );

    let mut written = 0;
    for state in &states {
        pb.set_message(state.clone());
        let selection = Selection::new(country, state.as_str(), crop, window);
        match engine.compute(&selection)? {
            PipelineOutcome::Ready(result) => {
                let path = config.output_dir.join(engine.export_filename(&result));
                write_table(&result, &path)?;
                written += 1;
            }
            PipelineOutcome::NoData => info!("Skipping {} / {}: no data", country, state),
        }
        pb.inc(1);
    }
    pb.finish_with_message("done");

    println!("Wrote {} of {} tables for {}", written, states.len(), country);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config);
    init_thread_pool(&config);

    let engine = build_engine(&config, cli.catalog.as_deref())?;

    match cli.command {
        Command::Countries { filter } => {
            for country in engine.catalog().geometry.countries(filter.as_deref()) {
                println!("{}", country);
            }
        }
        Command::States { country } => {
            for state in engine.catalog().geometry.state_options(&country)? {
                println!("{}", state);
            }
        }
        Command::Run(args) => {
            if args.no_historical && args.no_forecast {
                bail!("--no-historical and --no-forecast leave nothing to compute");
            }
            run(&engine, &config, args)?;
        }
        Command::Batch { country, crop, window } => batch(&engine, &config, &country, &crop, window)?,
    }
    Ok(())
}
