use env_logger::Builder;
use log::LevelFilter;

const DEFAULT_LEVEL_FILTER: LevelFilter = LevelFilter::Info;

/// Use `level` if present, or else `RUST_LOG` if present, or else a default
/// filter scoped to `crate_name` only. Every binary in the workspace calls
/// this once at startup with its own `env!("CARGO_CRATE_NAME")`.
pub fn init(crate_name: &str, level: Option<LevelFilter>) {
    match (std::env::var(env_logger::DEFAULT_FILTER_ENV).ok(), level) {
        (Some(_), None) => {
            Builder::from_default_env().init();
        }
        _ => {
            Builder::new()
                .filter(Some(crate_name), level.unwrap_or(DEFAULT_LEVEL_FILTER))
                .init();
        }
    }
}
