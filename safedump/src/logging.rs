//! Tracing subscriber setup for the command-line tool.
//!
//! Filter precedence: `SAFEDUMP_LOG`, then `RUST_LOG`, then the
//! `--log-level` flag. Log lines go to stderr so stdout stays reserved for
//! command output (checksums, listings, reports).

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const ENV_VAR: &str = "SAFEDUMP_LOG";

pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env(ENV_VAR)
        .or_else(|_| EnvFilter::try_from_default_env())
        .or_else(|_| EnvFilter::try_new(default_directives(level)))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

/// Directives derived from the `--log-level` flag: the requested level for
/// this crate, with the chatty SDK internals pinned to warn.
fn default_directives(level: &str) -> String {
    format!("{level},aws_config=warn,aws_smithy_runtime=warn,hyper=warn")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_parse() {
        assert!(EnvFilter::try_new(default_directives("debug")).is_ok());
        assert!(EnvFilter::try_new(default_directives("trace")).is_ok());
    }
}
