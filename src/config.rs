use std::path::PathBuf;

/// Application-level constants
pub const APP_NAME: &str = "contract-extract";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get the application data directory
/// (`~/.local/share/contract-extract` on Linux, the platform data dir elsewhere).
/// Falls back to the working directory when the platform has none.
pub fn app_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Default location of the learned-pattern database.
pub fn patterns_db_path() -> PathBuf {
    app_data_dir().join("patterns.db")
}

/// Log filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "warn,contract_extract=debug"
    } else {
        "warn,contract_extract=info"
    }
}

/// Log filter for `-v`: full crate tracing plus dependency info.
pub fn verbose_log_filter() -> &'static str {
    "info,contract_extract=trace"
}
