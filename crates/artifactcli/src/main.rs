//! Artifact cache command line.
//!
//! Drives a single in-process [`ArtifactCache`](artifact_cache::ArtifactCache) configured from
//! a YAML file, either for one request or for a batch of concurrent requests.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod batch;
mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
