//! contract-extract: pull text out of contract PDFs and photos.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};

use contract_extract::config;
use contract_extract::pipeline::extraction::{PreprocessPreset, ProgressEvent};
use contract_extract::{init_tracing, Document, ExtractionConfig, ExtractionPipeline, TemplateStore};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PresetArg {
    /// Mild contrast boost and sharpening
    Default,
    /// Faded or low-contrast scans
    LowQuality,
    /// Thin or connected script, no binarization
    Script,
}

impl From<PresetArg> for PreprocessPreset {
    fn from(arg: PresetArg) -> Self {
        match arg {
            PresetArg::Default => PreprocessPreset::ContractDefault,
            PresetArg::LowQuality => PreprocessPreset::LowQuality,
            PresetArg::Script => PreprocessPreset::ScriptOptimized,
        }
    }
}

#[derive(Parser)]
#[command(name = "contract-extract")]
#[command(about = "Tiered text extraction for contract documents")]
#[command(version)]
struct Cli {
    /// JSON config file (environment overrides still apply)
    #[arg(short, long, global = true, env = "EXTRACT_CONFIG")]
    config: Option<PathBuf>,

    /// Learned-pattern database
    #[arg(long, global = true, env = "EXTRACT_DB")]
    db: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract text from a PDF or image and print the result as JSON
    Extract {
        file: PathBuf,
        /// Never call cloud OCR providers
        #[arg(long)]
        no_cloud: bool,
        /// Preprocessing preset for local OCR
        #[arg(long, value_enum)]
        preset: Option<PresetArg>,
        /// Skip pattern learning for this run
        #[arg(long)]
        no_learn: bool,
        /// Print progress to stderr
        #[arg(short = 'P', long)]
        progress: bool,
        /// Print only the extracted text
        #[arg(long)]
        text_only: bool,
    },

    /// Inspect or reset learned extraction patterns
    Patterns {
        #[command(subcommand)]
        command: PatternCommands,
    },

    /// Show the cloud OCR providers that would be used, in order
    Providers,
}

#[derive(Subcommand)]
enum PatternCommands {
    /// Print learned patterns as JSON
    List,
    /// Forget every learned pattern
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    tracing::debug!("contract-extract v{}", config::APP_VERSION);

    let mut extraction_config = match &cli.config {
        Some(path) => ExtractionConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ExtractionConfig::default(),
    };
    let db_path = cli.db.clone().unwrap_or_else(config::patterns_db_path);

    match cli.command {
        Commands::Extract {
            file,
            no_cloud,
            preset,
            no_learn,
            progress,
            text_only,
        } => {
            if no_cloud {
                extraction_config.cloud_fallback_enabled = false;
            }
            if let Some(preset) = preset {
                extraction_config.preset = preset.into();
            }

            let document =
                Document::open(&file).with_context(|| format!("reading {}", file.display()))?;

            let mut builder = ExtractionPipeline::builder().with_config(extraction_config);
            if no_cloud {
                builder = builder.without_cloud();
            }
            if !no_learn {
                let store = TemplateStore::open(&db_path)
                    .with_context(|| format!("opening pattern store {}", db_path.display()))?;
                builder = builder.with_template_store(Arc::new(store));
            }
            let pipeline = builder.build().context("building extraction pipeline")?;

            let reporter = |event: ProgressEvent| {
                eprintln!("[{:>3}%] {}", event.percent, event.message);
            };
            let result = if progress {
                pipeline.extract(document, Some(&reporter)).await
            } else {
                pipeline.extract(document, None).await
            };

            if text_only {
                println!("{}", result.text);
            } else {
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            if !result.success {
                std::process::exit(2);
            }
        }

        Commands::Patterns { command } => {
            let store = TemplateStore::open(&db_path)
                .with_context(|| format!("opening pattern store {}", db_path.display()))?;
            match command {
                PatternCommands::List => {
                    println!("{}", serde_json::to_string_pretty(&store.patterns())?);
                }
                PatternCommands::Clear => {
                    let count = store.len();
                    store.clear();
                    println!("Cleared {count} learned patterns");
                }
            }
        }

        Commands::Providers => {
            let providers = extraction_config.resolved_providers();
            if providers.is_empty() {
                println!("No cloud OCR providers configured");
            }
            for (i, provider) in providers.iter().enumerate() {
                println!(
                    "{}. {:?} model={} endpoint={}",
                    i + 1,
                    provider.kind,
                    provider.model,
                    provider.endpoint.as_deref().unwrap_or("(default)")
                );
            }
        }
    }

    Ok(())
}
