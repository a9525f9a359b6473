use fileflow_core::FlowConfigSnapshot;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    /// `log.format = json` selects JSON lines.
    pub fn from_snapshot(snapshot: &FlowConfigSnapshot) -> Self {
        match snapshot.get("log.format") {
            Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins; `info` otherwise.
pub fn init(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let installed = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fileflow_core::FlowConfig;

    #[test]
    fn json_format_is_opt_in() {
        let mut config = FlowConfig::new();
        assert_eq!(LogFormat::from_snapshot(&config.snapshot()), LogFormat::Pretty);

        config.set("log.format", "JSON");
        assert_eq!(LogFormat::from_snapshot(&config.snapshot()), LogFormat::Json);
    }
}
