use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, ValueHint};
use prod_calc::{BucketResult, ConfigParams, Finalized, RawBuffer};
use rayon::prelude::*;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_COMMIT_HASH"), ")");

#[derive(Parser, Debug)]
#[command(author, version = VERSION, about = "Net production from cumulative meter readings", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute per-bucket production for one or more CSV files of readings
    Calc(CalcArgs),
    /// Write the partial aggregation state of one CSV file as JSON
    Partial(PartialArgs),
    /// Merge partial state files and compute per-bucket production
    Final(FinalArgs),
}

#[derive(Args, Debug, Clone, Default)]
struct ConfigArgs {
    /// Maximum plausible production rate (value per hour)
    #[arg(long)]
    slope: Option<f64>,

    /// Bucket granularity (second|minute|hour|day|month|year, or a pattern such as yyyy-MM-dd)
    #[arg(long)]
    date_format: Option<String>,

    /// Timestamp of the last valid reading of a previous window
    #[arg(long, requires = "seed_value")]
    seed_time: Option<String>,

    /// Value of the last valid reading of a previous window
    #[arg(long, requires = "seed_time")]
    seed_value: Option<f64>,

    /// JSON config file (slope, dateFormat, lastValidTime, lastValidValue); flags take precedence
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug, Clone, Default)]
struct InputArgs {
    /// Input CSV files have no header row
    #[arg(long, action = ArgAction::SetTrue)]
    no_header: bool,

    /// Warn about and skip rows with an absent or non-numeric field instead of failing
    #[arg(long, action = ArgAction::SetTrue)]
    skip_invalid: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    #[default]
    Csv,
    Json,
}

#[derive(Args, Debug, Clone)]
struct OutputArgs {
    /// Output path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Csv)]
    format: OutputFormat,

    /// Log stage timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Parser, Debug)]
struct CalcArgs {
    /// CSV files of `timestamp,value` readings, one partition each
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    #[command(flatten)]
    config: ConfigArgs,

    #[command(flatten)]
    input: InputArgs,

    #[command(flatten)]
    out: OutputArgs,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct PartialArgs {
    /// CSV file of `timestamp,value` readings
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Partial state JSON path
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    output: PathBuf,

    #[command(flatten)]
    config: ConfigArgs,

    #[command(flatten)]
    csv: InputArgs,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct FinalArgs {
    /// Partial state JSON files, merged in the given order
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    partials: Vec<PathBuf>,

    // Applied over whatever configuration the partials carry.
    #[command(flatten)]
    config: ConfigArgs,

    #[command(flatten)]
    out: OutputArgs,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Calc(args) => args.verbose,
        Command::Partial(args) => args.verbose,
        Command::Final(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Calc(args) => handle_calc(args),
        Command::Partial(args) => handle_partial(args),
        Command::Final(args) => handle_final(args),
    }
}

fn handle_calc(args: CalcArgs) -> Result<()> {
    let params = args.config.resolve()?;

    let t_parse = Instant::now();
    let parts = args
        .inputs
        .par_iter()
        .map(|path| read_partition(path, &args.input))
        .collect::<Result<Vec<_>>>()?;

    // Sequential merge keeps collisions resolving to the later file.
    let mut combined = RawBuffer::new();
    let mut skipped = 0;
    for (part, part_skipped) in parts {
        combined.merge(part);
        skipped += part_skipped;
    }
    if skipped > 0 {
        warn!("Skipped {} invalid rows", skipped);
    }
    if args.out.profile || args.verbose {
        info!(
            "Parse stage: {:.1} ms ({} files, {} readings)",
            t_parse.elapsed().as_secs_f64() * 1000.0,
            args.inputs.len(),
            combined.len()
        );
    }

    apply_config(&mut combined, &params)?;
    let finalized = finalize_timed(combined, args.out.profile || args.verbose)?;
    write_results(&finalized.buckets, &args.out)
}

fn handle_partial(args: PartialArgs) -> Result<()> {
    let params = args.config.resolve()?;
    let (mut buffer, skipped) = read_partition(&args.input, &args.csv)?;
    if skipped > 0 {
        warn!("Skipped {} invalid rows in {}", skipped, args.input.display());
    }
    if params.slope.is_some() || params.date_format.is_some() {
        apply_config(&mut buffer, &params)?;
    } else if params.last_valid_time.is_some() || params.last_valid_value.is_some() {
        return Err(anyhow!(
            "a seed needs --slope and --date-format to be attached to a partial"
        ));
    }

    let text = buffer.to_partial_json()?;
    fs::write(&args.output, text)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    info!(
        "Wrote partial state: {} ({} readings{})",
        args.output.display(),
        buffer.len(),
        if buffer.config().is_some() {
            ", configured"
        } else {
            ""
        }
    );
    Ok(())
}

fn handle_final(args: FinalArgs) -> Result<()> {
    let params = args.config.resolve()?;

    let t_load = Instant::now();
    let parts = args
        .partials
        .par_iter()
        .map(|path| -> Result<RawBuffer> {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            RawBuffer::from_partial_json(&text)
                .with_context(|| format!("failed to parse {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut combined = RawBuffer::new();
    for part in parts {
        combined.merge(part);
    }
    if args.out.profile || args.verbose {
        info!(
            "Load stage: {:.1} ms ({} partials, {} readings)",
            t_load.elapsed().as_secs_f64() * 1000.0,
            args.partials.len(),
            combined.len()
        );
    }

    // Flags override the carried configuration field by field.
    let params = match combined.config() {
        Some(carried) => params.or(ConfigParams::from(carried.clone())),
        None => params,
    };
    apply_config(&mut combined, &params)?;
    let finalized = finalize_timed(combined, args.out.profile || args.verbose)?;
    write_results(&finalized.buckets, &args.out)
}

impl ConfigArgs {
    fn resolve(&self) -> Result<ConfigParams> {
        let flags = ConfigParams {
            slope: self.slope,
            date_format: self.date_format.clone(),
            last_valid_time: self.seed_time.clone(),
            last_valid_value: self.seed_value,
        };
        match self.config.as_ref() {
            Some(path) => Ok(flags.or(load_config_file(path)?)),
            None => Ok(flags),
        }
    }
}

fn load_config_file(path: &Path) -> Result<ConfigParams> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let params: ConfigParams = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid config JSON object", path.display()))?;
    if params == ConfigParams::default() {
        warn!("Config {} had no usable entries", path.display());
    }
    Ok(params)
}

fn apply_config(buffer: &mut RawBuffer, params: &ConfigParams) -> Result<()> {
    let seed = match (params.last_valid_time.as_deref(), params.last_valid_value) {
        (Some(ts), Some(value)) => Some((ts, value)),
        (None, None) => None,
        _ => return Err(anyhow!("a seed needs both lastValidTime and lastValidValue")),
    };
    buffer
        .set_config(params.slope, params.date_format.as_deref(), seed)
        .context("invalid configuration")
}

fn read_partition(path: &Path, opts: &InputArgs) -> Result<(RawBuffer, usize)> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    read_readings(file, &path.display().to_string(), opts)
}

/// Fill a fresh buffer from `timestamp,value` rows. Returns the buffer and
/// the number of rows skipped under `--skip-invalid`.
fn read_readings<R: Read>(source: R, label: &str, opts: &InputArgs) -> Result<(RawBuffer, usize)> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(!opts.no_header)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(source);
    let mut buffer = RawBuffer::new();
    let mut skipped = 0;

    for (idx, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("failed to read row {} of {}", idx + 1, label))?;
        let timestamp = record.get(0).filter(|s| !s.is_empty());
        let value = record.get(1).filter(|s| !s.is_empty());
        if let Err(err) = buffer.add(timestamp, value) {
            if opts.skip_invalid {
                warn!("Skipping row {} of {}: {}", idx + 1, label, err);
                skipped += 1;
                continue;
            }
            return Err(err).with_context(|| format!("row {} of {}", idx + 1, label));
        }
    }
    debug!("Read {} readings from {}", buffer.len(), label);
    Ok((buffer, skipped))
}

fn finalize_timed(buffer: RawBuffer, profile: bool) -> Result<Finalized> {
    let t_compute = Instant::now();
    let finalized = buffer.finalize()?;
    if profile {
        info!(
            "Compute stage: {:.1} ms ({} buckets)",
            t_compute.elapsed().as_secs_f64() * 1000.0,
            finalized.buckets.len()
        );
    }

    let diag = &finalized.diagnostics;
    info!(
        "Production computed: {} buckets from {} readings ({} valid segments; runs solid {}, dead {}, jump {})",
        diag.buckets,
        diag.points_total,
        diag.runs.segments_valid,
        diag.runs.runs_solid,
        diag.runs.runs_dead,
        diag.runs.runs_jump
    );
    if diag.points_rejected > 0 {
        warn!(
            "{} readings excluded for unparseable timestamps",
            diag.points_rejected
        );
    }
    Ok(finalized)
}

fn write_results(results: &[BucketResult], out: &OutputArgs) -> Result<()> {
    if out.output.as_os_str() == "-" {
        let stdout = io::stdout();
        let handle = stdout.lock();
        write_results_to(results, out.format, handle)
    } else {
        let file = File::create(&out.output)
            .with_context(|| format!("failed to create {}", out.output.display()))?;
        write_results_to(results, out.format, file)?;
        info!("Wrote results: {}", out.output.display());
        Ok(())
    }
}

fn write_results_to<W: Write>(
    results: &[BucketResult],
    format: OutputFormat,
    mut writer: W,
) -> Result<()> {
    match format {
        OutputFormat::Csv => {
            let mut writer = csv::Writer::from_writer(writer);
            write_result_rows(results, &mut writer)
        }
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut writer, results)?;
            writeln!(writer)?;
            Ok(())
        }
    }
}

fn write_result_rows<W: Write>(results: &[BucketResult], writer: &mut csv::Writer<W>) -> Result<()> {
    writer.write_record(["timeGroup", "production", "lastValidTime", "lastValidValue"])?;
    for result in results {
        writer.write_record([
            result.bucket_key.clone(),
            result.production.to_string(),
            result.last_valid_timestamp.clone().unwrap_or_default(),
            result
                .last_valid_value
                .map(|v| v.to_string())
                .unwrap_or_default(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
