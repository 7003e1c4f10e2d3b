//! Tracing configuration and initialization.

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

/// How the cluster service writes its logs.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Reported once in the start-up line
    pub service_name: String,
    /// Used when `RUST_LOG` is unset
    pub log_level: Level,
    /// Log span close events with their duration
    pub include_span_events: bool,
    /// One JSON object per line instead of the human readable format
    pub json_output: bool,
    pub include_location: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "cluster-service".to_string(),
            log_level: Level::INFO,
            include_span_events: false,
            json_output: false,
            include_location: false,
        }
    }
}

impl TracingConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json_output = json;
        self
    }

    pub fn with_span_events(mut self, include: bool) -> Self {
        self.include_span_events = include;
        self
    }

    pub fn with_location(mut self, include: bool) -> Self {
        self.include_location = include;
        self
    }

    /// `RUST_LOG` wins over the configured level.
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.log_level.as_str()))
    }

    fn span_events(&self) -> FmtSpan {
        if self.include_span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Parses a level name such as `debug` or `WARN`; unknown names yield `None`.
pub fn parse_level(name: &str) -> Option<Level> {
    name.trim().parse().ok()
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: TracingConfig) -> Result<(), TryInitError> {
    let location = config.include_location;
    let json = config.json_output.then(|| {
        fmt::layer()
            .json()
            .with_span_events(config.span_events())
            .with_file(location)
            .with_line_number(location)
    });
    let text = (!config.json_output).then(|| {
        fmt::layer()
            .with_span_events(config.span_events())
            .with_file(location)
            .with_line_number(location)
    });

    tracing_subscriber::registry()
        .with(config.filter())
        .with(json)
        .with(text)
        .try_init()?;

    tracing::info!(
        service = %config.service_name,
        level = %config.log_level,
        json = config.json_output,
        "Tracing initialized"
    );
    Ok(())
}

/// Span for one deployment workflow run.
#[macro_export]
macro_rules! workflow_span {
    ($workflow:expr, $cluster_id:expr) => {
        tracing::info_span!(
            "workflow",
            workflow = $workflow,
            cluster_id = %$cluster_id
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TracingConfig::default();
        assert_eq!(config.service_name, "cluster-service");
        assert_eq!(config.log_level, Level::INFO);
        assert!(!config.json_output);
        assert_eq!(config.span_events(), FmtSpan::NONE);
    }

    #[test]
    fn test_builder() {
        let config = TracingConfig::new("deployer")
            .with_level(Level::DEBUG)
            .with_json(true)
            .with_span_events(true)
            .with_location(true);

        assert_eq!(config.service_name, "deployer");
        assert_eq!(config.log_level, Level::DEBUG);
        assert!(config.json_output && config.include_location);
        assert_eq!(config.span_events(), FmtSpan::CLOSE);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level(" WARN "), Some(Level::WARN));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_workflow_span_macro() {
        let span = crate::workflow_span!("create_cluster", "c-1");
        // no subscriber installed, so the span is disabled but constructible
        let _guard = span.enter();
    }
}
