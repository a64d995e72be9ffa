use std::env;

/// Name of the environment variable that enables debug tracing.
pub const DEBUG_ENV_VAR: &str = "LOCKFILE_DEBUG";

/// Initialize the logger with the specified verbosity level
///
/// # Arguments
/// * `verbose` - Verbosity level (0=warn, 1=info, 2=debug, 3+=trace)
pub fn setup_logger(verbose: u8) {
    let env_filter = match verbose {
        0 => "linklock=warn",
        1 => "linklock=info",
        2 => "linklock=debug",
        _ => "linklock=trace",
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(env_filter))
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();
}

/// Reports whether `LOCKFILE_DEBUG` asks for debug tracing. Any non-empty
/// value other than `0` and `false` counts as enabled.
pub fn debug_env_enabled() -> bool {
    match env::var(DEBUG_ENV_VAR) {
        Ok(value) => {
            let trimmed = value.trim();
            !trimmed.is_empty() && trimmed != "0" && !trimmed.eq_ignore_ascii_case("false")
        }
        Err(_) => false,
    }
}
