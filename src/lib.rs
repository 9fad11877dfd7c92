pub mod config;
pub mod db;
pub mod pipeline;
pub mod pipeline_config;

pub use pipeline::extraction::{
    Document, ExtractionError, ExtractionMethod, ExtractionPipeline, ExtractionResult,
    ProgressEvent, ProgressReporter, ProgressStage,
};
pub use pipeline::learning::TemplateStore;
pub use pipeline_config::ExtractionConfig;

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` wins over `verbose`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing(verbose: bool) {
    let fallback = if verbose {
        config::verbose_log_filter()
    } else {
        config::default_log_filter()
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
