use anyhow::Result;
use fedcontroller::{built_info, context_builder::ContextBuilder};
use tracing::info;

fn main() -> Result<()> {
    let context_builder = ContextBuilder::from_cli()?;
    let context = context_builder.try_build_and_start()?;

    log_startup_string();
    for federated_type in &context.config().types {
        info!(
            "Tracking {} propagated as {}",
            federated_type.federated.kind, federated_type.target.kind
        );
    }

    context.wait_for_termination()?;

    info!("shutting down");

    context.shutdown()
}

fn log_startup_string() {
    print_startup_string(
        env!("CARGO_PKG_DESCRIPTION"),
        env!("CARGO_PKG_VERSION"),
        built_info::GIT_VERSION,
        built_info::TARGET,
        built_info::BUILT_TIME_UTC,
        built_info::RUSTC_VERSION,
    );
    info!("");
}

pub fn print_startup_string(
    pkg_description: &str,
    pkg_version: &str,
    git_version: Option<&str>,
    target: &str,
    built_time: &str,
    rustc_version: &str,
) {
    let git = match git_version {
        None => "".to_string(),
        Some(git) => format!(" (Git information: {git})"),
    };
    info!("Starting {pkg_description}");
    info!(
        "This is version {pkg_version}{git}, built for {target} by {rustc_version} at {built_time}",
    )
}
