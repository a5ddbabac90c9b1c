pub mod config;
pub mod context;
pub mod context_builder;
pub mod federation;
pub mod metrics;
pub mod status;
pub mod tracing;
pub mod utils;
pub mod version;
pub mod worker;

pub mod built_info {
    // The file has been placed there by the build script.
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[cfg(test)]
mod tests;
