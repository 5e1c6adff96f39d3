/// ajdc: calibrate, review, store and replay ocular-artifact decompositions.
///
///   ajdc calibrate --input run_2-1.safetensors --annotation " 16" --offset 5 --duration 20 \
///                  --output sub-S002.review.safetensors
///   ajdc review    --request sub-S002.review.safetensors --store out \
///                  --subject sub-S002 --condition _CLEAN_
///   ajdc denoise   --input run_3-1.safetensors --store out --subject sub-S002 \
///                  --condition _CLEAN_ --output run_3-1_denoised.safetensors
///   ajdc inspect   out/parameters/band_1_80/_CLEAN_/sub-S002.ajdc.safetensors
///   ajdc batch     --study study.json --stage all
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use ajdc::{
    begin_review, denoise_with, fit, read_parameters, read_review_request, read_signal, resume,
    study, write_review_request, write_signal, CalibrationConfig, CalibrationWindow,
    DecompositionParameters, DenoiseConfig, DimensionalityReduction, FrequencyBand, ParameterKey,
    ParameterStore, ReviewRequest, ReviewResponse, StFile, StageReport, StudyConfig, StudyEntry,
};

#[derive(Parser)]
#[command(name = "ajdc", version, about = "Ocular-artifact removal for EEG by spectral joint diagonalization")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Fit a decomposition on a calibration window and write a review request
    Calibrate(CalibrateArgs),
    /// Answer a review request and store the final parameters
    Review(ReviewArgs),
    /// Denoise a recording with stored parameters
    Denoise(DenoiseArgs),
    /// Summarise a parameter record, review request or signal file
    Inspect(InspectArgs),
    /// Run a study stage over every subject and condition
    Batch(BatchArgs),
}

#[derive(Args)]
struct BandArgs {
    /// Lower band edge (Hz)
    #[arg(long, default_value_t = 1)]
    fmin: u32,

    /// Upper band edge (Hz)
    #[arg(long, default_value_t = 80)]
    fmax: u32,
}

impl BandArgs {
    fn band(&self) -> FrequencyBand {
        FrequencyBand::new(self.fmin, self.fmax)
    }
}

#[derive(Args)]
struct CalibrateArgs {
    /// Calibration recording (signal safetensors)
    #[arg(long)]
    input: PathBuf,

    /// Review request output path
    #[arg(long)]
    output: PathBuf,

    /// Anchor the window on the last annotation containing this label
    #[arg(long, conflicts_with_all = ["tmin", "tmax"])]
    annotation: Option<String>,

    /// Window start after the anchor annotation (s)
    #[arg(long, default_value_t = 5.0)]
    offset: f64,

    /// Window length after the anchor annotation (s)
    #[arg(long, default_value_t = 20.0)]
    duration: f64,

    /// Explicit window start (s)
    #[arg(long, requires = "tmax")]
    tmin: Option<f64>,

    /// Explicit window end (s)
    #[arg(long, requires = "tmin")]
    tmax: Option<f64>,

    #[command(flatten)]
    band: BandArgs,

    /// Analysis window length (s)
    #[arg(long, default_value_t = 1.0)]
    window: f64,

    /// Analysis window overlap fraction
    #[arg(long, default_value_t = 0.5)]
    overlap: f64,

    /// Keep exactly this many sources
    #[arg(long, conflicts_with_all = ["explained_variance", "max_cond"])]
    components: Option<usize>,

    /// Keep sources explaining this fraction of variance (default 0.99)
    #[arg(long, conflicts_with = "max_cond")]
    explained_variance: Option<f64>,

    /// Keep sources up to this condition number
    #[arg(long)]
    max_cond: Option<f64>,
}

impl CalibrateArgs {
    fn config(&self) -> CalibrationConfig {
        let dim_red = match (self.components, self.explained_variance, self.max_cond) {
            (Some(n), _, _) => DimensionalityReduction::Components(n),
            (_, Some(v), _) => DimensionalityReduction::ExplainedVariance(v),
            (_, _, Some(c)) => DimensionalityReduction::MaxConditionNumber(c),
            _ => DimensionalityReduction::default(),
        };
        CalibrationConfig {
            window_length: self.window,
            overlap: self.overlap,
            band: self.band.band(),
            dim_red,
            ..CalibrationConfig::default()
        }
    }
}

#[derive(Args)]
struct ReviewArgs {
    /// Review request written by `calibrate`
    #[arg(long)]
    request: PathBuf,

    /// Parameter store root
    #[arg(long)]
    store: PathBuf,

    #[arg(long)]
    subject: String,

    #[arg(long)]
    condition: String,

    /// Blink sources, whitespace separated (prompted when omitted)
    #[arg(long)]
    blink: Option<String>,

    /// Saccade sources, whitespace separated (prompted when omitted)
    #[arg(long)]
    saccade: Option<String>,

    /// Also write the corrected calibration window here
    #[arg(long)]
    corrected: Option<PathBuf>,
}

#[derive(Args)]
struct DenoiseArgs {
    /// Recording to denoise (signal safetensors)
    #[arg(long)]
    input: PathBuf,

    /// Denoised output path
    #[arg(long)]
    output: PathBuf,

    /// Parameter record file, instead of a store lookup
    #[arg(long, conflicts_with_all = ["store", "subject", "condition"])]
    parameters: Option<PathBuf>,

    /// Parameter store root
    #[arg(long, requires_all = ["subject", "condition"])]
    store: Option<PathBuf>,

    #[arg(long)]
    subject: Option<String>,

    #[arg(long)]
    condition: Option<String>,

    #[command(flatten)]
    band: BandArgs,

    /// Epoch length (s)
    #[arg(long, default_value_t = 0.5)]
    epoch: f64,

    /// Denoise epochs in parallel
    #[arg(long)]
    parallel: bool,

    /// Re-reference to the channel average before denoising
    #[arg(long)]
    average_reference: bool,
}

#[derive(Args)]
struct InspectArgs {
    /// Any file written by ajdc
    path: PathBuf,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Stage {
    Calibrate,
    Review,
    Denoise,
    All,
}

#[derive(Args)]
struct BatchArgs {
    /// Study description (JSON)
    #[arg(long)]
    study: PathBuf,

    #[arg(long, value_enum, default_value_t = Stage::All)]
    stage: Stage,

    /// Prerecorded operator answers (JSON list of
    /// {subject, condition, blink, saccade}); prompts when omitted
    #[arg(long)]
    answers: Option<PathBuf>,

    /// Print the plan and exit
    #[arg(long)]
    dry_run: bool,
}

/// One prerecorded operator answer.
#[derive(Deserialize)]
struct Answer {
    subject: String,
    condition: String,
    #[serde(default)]
    blink: String,
    #[serde(default)]
    saccade: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    match cli.command {
        Command::Calibrate(args) => calibrate(args),
        Command::Review(args) => review(args),
        Command::Denoise(args) => denoise(args),
        Command::Inspect(args) => inspect(&args.path),
        Command::Batch(args) => batch(args),
    }
}

fn calibrate(args: CalibrateArgs) -> Result<()> {
    let cfg = args.config();
    let signal = read_signal(&args.input)?;
    println!(
        "Loaded {} ch × {} samples @ {} Hz",
        signal.n_channels(),
        signal.n_times(),
        signal.sfreq
    );

    let window = match (&args.annotation, args.tmin, args.tmax) {
        (Some(label), _, _) => {
            CalibrationWindow::from_annotation(&signal, label, args.offset, args.duration)?
        }
        (None, Some(tmin), Some(tmax)) => CalibrationWindow::from_bounds(&signal, tmin, tmax)?,
        _ => CalibrationWindow::whole(signal),
    };

    let params = fit(&window, &cfg)?;
    let request = begin_review(&window, params)?;
    print_sources(&request);
    write_review_request(&request, &args.output)?;
    println!("Review request → {}", args.output.display());
    Ok(())
}

fn review(args: ReviewArgs) -> Result<()> {
    let request = read_review_request(&args.request)
        .with_context(|| format!("reading review request {}", args.request.display()))?;
    print_sources(&request);

    let response = match (&args.blink, &args.saccade) {
        (Some(b), Some(s)) => ReviewResponse::from_prompt(b, s),
        _ => prompt_response()?,
    };
    let params = resume(&request, &response)?;

    let store = ParameterStore::new(&args.store);
    let key = ParameterKey::new(&args.subject, &args.condition, params.band());
    let path = store.save(&params, &key)?;
    println!("Parameters → {}", path.display());

    if let Some(out) = &args.corrected {
        write_signal(&request.corrected_calibration(&params)?, out)?;
        println!("Corrected calibration → {}", out.display());
    }
    Ok(())
}

fn denoise(args: DenoiseArgs) -> Result<()> {
    let params = match (&args.parameters, &args.store, &args.subject, &args.condition) {
        (Some(path), ..) => read_parameters(path)?,
        (None, Some(root), Some(subject), Some(condition)) => {
            ParameterStore::new(root).load(&ParameterKey::new(subject, condition, args.band.band()))?
        }
        _ => bail!("either --parameters or --store with --subject and --condition is required"),
    };

    let mut signal = read_signal(&args.input)?;
    if args.average_reference {
        signal.average_reference_inplace();
    }
    let cfg = DenoiseConfig { epoch_duration: args.epoch, parallel: args.parallel };
    let clean = denoise_with(&signal, &params, &params.suppression_set(), &cfg)?;
    println!(
        "Denoised {:.2} s → {:.2} s, suppressed sources {:?}",
        signal.duration(),
        clean.duration(),
        params.suppression_set().iter().collect::<Vec<_>>()
    );
    write_signal(&clean, &args.output)?;
    println!("Written → {}", args.output.display());
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let st = StFile::load(path)?;
    match st.metadata("format") {
        Some(ajdc::store::PARAMETERS_FORMAT) => print_parameters(&read_parameters(path)?),
        Some(ajdc::review::REVIEW_FORMAT) => {
            let request = read_review_request(path)?;
            print_parameters(&request.decomposition);
            print_sources(&request);
        }
        _ => {
            let signal = read_signal(path)?;
            println!("signal      : {} ch × {} samples", signal.n_channels(), signal.n_times());
            println!("sfreq       : {} Hz ({:.2} s)", signal.sfreq, signal.duration());
            println!("channels    : {}", signal.ch_names.join(" "));
            if let Some(date) = signal.meas_date {
                println!("meas_date   : {}", date.to_rfc3339());
            }
            println!("first_samp  : {}", signal.first_samp);
            println!("annotations : {}", signal.annotations.len());
        }
    }
    Ok(())
}

fn batch(args: BatchArgs) -> Result<()> {
    let cfg = StudyConfig::from_file(&args.study)?;

    if args.dry_run {
        for entry in cfg.plan() {
            match &entry.action {
                study::Action::Process => println!("{entry}"),
                study::Action::Skip(reason) => println!("{entry}  (skip: {reason})"),
            }
        }
        return Ok(());
    }

    let answers: Vec<Answer> = match &args.answers {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading answers {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing answers {}", path.display()))?
        }
        None => Vec::new(),
    };

    let mut failed = 0;
    if matches!(args.stage, Stage::Calibrate | Stage::All) {
        failed += report("calibration", &study::run_calibration(&cfg));
    }
    if matches!(args.stage, Stage::Review | Stage::All) {
        let answer = |entry: &StudyEntry, request: &ReviewRequest| -> Result<ReviewResponse> {
            if args.answers.is_some() {
                let a = answers
                    .iter()
                    .find(|a| a.subject == entry.subject && a.condition == entry.condition)
                    .with_context(|| format!("no prerecorded answer for {entry}"))?;
                return Ok(ReviewResponse::from_prompt(&a.blink, &a.saccade));
            }
            println!("── {entry}");
            print_sources(request);
            prompt_response()
        };
        failed += report("review", &study::run_review(&cfg, answer));
    }
    if matches!(args.stage, Stage::Denoise | Stage::All) {
        failed += report("denoising", &study::run_denoising(&cfg));
    }

    if failed > 0 {
        bail!("{failed} entries failed");
    }
    Ok(())
}

fn report(stage: &str, report: &StageReport) -> usize {
    println!(
        "{stage}: {} done, {} skipped, {} failed",
        report.done(),
        report.skipped(),
        report.failed()
    );
    for (entry, outcome) in &report.rows {
        if let study::EntryOutcome::Failed(msg) = outcome {
            println!("  {entry}: {msg}");
        }
    }
    report.failed()
}

fn print_parameters(p: &DecompositionParameters) {
    println!("channels    : {} ({})", p.n_channels(), p.ch_names().join(" "));
    println!("sources     : {}", p.n_sources());
    println!("sfreq       : {} Hz", p.sfreq());
    println!("band        : {}–{} Hz", p.band().fmin, p.band().fmax);
    println!("window      : {} s, overlap {}", p.window_length(), p.overlap());
    println!("blink       : {:?}", p.blink_indices());
    println!("saccade     : {:?}", p.saccade_indices());
}

/// Per-source spectral peak and dominant channel, to help labelling.
fn print_sources(request: &ReviewRequest) {
    let names = request.decomposition.ch_names();
    let topo = request.topographies();
    for (s, row) in request.spectra.rows().into_iter().enumerate() {
        let peak = row
            .iter()
            .enumerate()
            .fold((0, f64::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
            .0;
        let peak_hz = request.freqs.get(peak).copied().unwrap_or(f64::NAN);
        let dominant = topo
            .column(s)
            .iter()
            .enumerate()
            .fold((0, 0.0_f64), |best, (c, &v)| if v.abs() > best.1 { (c, v.abs()) } else { best })
            .0;
        println!(
            "  {}  peak {:6.2} Hz  strongest on {}",
            request.sources.ch_names[s],
            peak_hz,
            names.get(dominant).map(String::as_str).unwrap_or("?")
        );
    }
}

fn prompt_response() -> Result<ReviewResponse> {
    let blink = prompt("Blink components : ")?;
    let saccade = prompt("Saccade components : ")?;
    Ok(ReviewResponse::from_prompt(&blink, &saccade))
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line)
}
