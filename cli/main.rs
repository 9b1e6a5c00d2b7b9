#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::process;

use sundial::config::RunConfig;
use sundial::ensemble::ModelFormat;
use sundial::explain::SummaryEntry;
use sundial::record::{load_record, to_toml_string};
use sundial::schema::{Domain, Feature, FeatureSchema};
use sundial::{PipelineError, RiskPipeline, RiskReport};

#[derive(Args)]
pub struct SourceArgs {
    /// TOML run configuration; command-line flags override its values
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Feature schema (.toml)
    #[arg(long, value_name = "PATH")]
    pub schema: Option<PathBuf>,
}

#[derive(Args)]
pub struct PredictArgs {
    /// Subject record: TOML (`name = value`) or two-column TSV (`name<TAB>value`)
    pub input: PathBuf,

    #[command(flatten)]
    pub source: SourceArgs,

    /// Trained tree ensemble
    #[arg(long, value_name = "PATH")]
    pub model: Option<PathBuf>,

    /// Format of the model file
    #[arg(long, value_enum)]
    pub model_format: Option<ModelFormat>,

    /// Number of features shown before the rest are aggregated
    #[arg(long, value_name = "K", allow_negative_numbers = true)]
    pub top_k: Option<i64>,

    /// Relative tolerance for baseline + contributions == score
    #[arg(long, value_name = "TOL")]
    pub sum_tolerance: Option<f64>,

    /// Print the full report as JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct TemplateArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Write the template here instead of stdout
    #[arg(long, short, value_name = "PATH")]
    pub output: Option<PathBuf>,
}

#[derive(Parser)]
#[command(
    name = "sundial",
    about = "Risk scoring with per-feature explanations",
    long_about = "Scores a subject's clinical record with a trained gradient-boosted tree \
                 ensemble and explains the score as additive per-feature contributions."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Score a subject record and explain the score
    #[command(about = "Score and explain one subject record")]
    Predict(PredictArgs),

    /// Write a record pre-filled with every feature's default value
    #[command(about = "Write a default-valued input record (TOML)")]
    Template(TemplateArgs),

    /// List the schema's features and their admissible values
    #[command(about = "Describe the feature schema")]
    Schema(SourceArgs),

    /// Display version information
    #[command(about = "Display version information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Predict(args)) => run_predict(args),
        Some(Commands::Template(args)) => run_template(args),
        Some(Commands::Schema(args)) => run_schema(args),
        Some(Commands::Version) => {
            println!("sundial {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Box::<dyn Error>::from),
    };

    if let Err(e) = result {
        // Invalid input gets its own exit code so callers can re-prompt.
        let user_error = e
            .downcast_ref::<PipelineError>()
            .is_some_and(PipelineError::is_user_error);
        if user_error {
            eprintln!("Invalid input: {e}");
            process::exit(2);
        }
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn base_config(source: &SourceArgs) -> Result<RunConfig, Box<dyn Error>> {
    let mut config = match &source.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    if let Some(schema) = &source.schema {
        config.schema = Some(schema.clone());
    }
    Ok(config)
}

fn load_schema(source: &SourceArgs) -> Result<FeatureSchema, Box<dyn Error>> {
    let config = base_config(source)?;
    Ok(FeatureSchema::load(config.schema_path()?)?)
}

fn run_predict(args: PredictArgs) -> Result<(), Box<dyn Error>> {
    let mut config = base_config(&args.source)?;
    if let Some(model) = args.model {
        config.model = Some(model);
    }
    if let Some(format) = args.model_format {
        config.model_format = format;
    }
    if let Some(k) = args.top_k {
        config.top_k = k;
    }
    if let Some(tolerance) = args.sum_tolerance {
        config.sum_tolerance = tolerance;
    }

    let pipeline = RiskPipeline::from_config(&config)?;
    let record = load_record(&args.input)?;
    let report = pipeline.run(&record)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(pipeline.schema(), &report);
    }
    Ok(())
}

fn run_template(args: TemplateArgs) -> Result<(), Box<dyn Error>> {
    let schema = load_schema(&args.source)?;
    let text = to_toml_string(&schema.default_record())?;
    match args.output {
        Some(path) => {
            fs::write(&path, text)?;
            println!("Template for {} features written to {}", schema.feature_count(), path.display());
        }
        None => print!("{text}"),
    }
    Ok(())
}

fn run_schema(args: SourceArgs) -> Result<(), Box<dyn Error>> {
    let schema = load_schema(&args)?;
    let width = schema.names().map(str::len).max().unwrap_or(0);
    for (index, feature) in schema.features().iter().enumerate() {
        println!(
            "{index:>3}  {:<width$}  {:<11}  {}",
            feature.name(),
            feature.kind().to_string(),
            feature.describe_domain()
        );
    }
    Ok(())
}

fn print_report(schema: &FeatureSchema, report: &RiskReport) {
    let mut buffer = ryu::Buffer::new();
    let summary = &report.summary;
    println!("Predicted score: {}", buffer.format(report.prediction.score));
    println!("Baseline:        {}", buffer.format(summary.baseline.value()));
    println!();

    let labels: Vec<(String, String)> = summary
        .entries
        .iter()
        .map(|entry| match entry {
            SummaryEntry::Feature(attribution) => {
                let feature = schema.feature_at(attribution.schema_index);
                let name = feature.map_or(attribution.feature_name.as_str(), Feature::display_name);
                let input = feature.map_or_else(
                    || buffer.format(attribution.input_value).to_string(),
                    |f| describe_input(f, attribution.input_value),
                );
                (name.to_string(), input)
            }
            SummaryEntry::Remainder { feature_count, .. } => {
                (entry.label().to_string(), format!("{feature_count} features"))
            }
        })
        .collect();

    let name_width = labels.iter().map(|(name, _)| name.chars().count()).max().unwrap_or(0);
    let input_width = labels.iter().map(|(_, input)| input.chars().count()).max().unwrap_or(0);
    for ((name, input), entry) in labels.iter().zip(&summary.entries) {
        println!(
            "  {name:<name_width$}  {input:<input_width$}  {:+.6}",
            entry.value()
        );
    }
}

fn describe_input(feature: &Feature, value: f64) -> String {
    match feature.domain() {
        Domain::Categorical { categories, .. } => categories
            .iter()
            .find(|category| category.code as f64 == value)
            .map_or_else(|| value.to_string(), |category| category.label.clone()),
        Domain::Numeric { .. } => ryu::Buffer::new().format(value).to_string(),
    }
}
