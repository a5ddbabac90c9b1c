use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_LEVEL: &str = "INFO";

/// Installs the global subscriber. `log_level` accepts plain levels ("DEBUG")
/// as well as filter directives ("fedcontroller=TRACE,kube=WARN").
pub fn setup_tracing(log_level: Option<String>) {
    let directives = log_level.unwrap_or_else(|| DEFAULT_LOG_LEVEL.into());
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|err| {
        eprintln!("Invalid log level {directives:?}: {err}, falling back to {DEFAULT_LOG_LEVEL}");
        EnvFilter::new(DEFAULT_LOG_LEVEL)
    });
    // Tests install it repeatedly, only the first call wins.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
