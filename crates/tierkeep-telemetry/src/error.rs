//! Error types for logging and metrics setup.

use prometheus::Error as PrometheusError;
use thiserror::Error;

/// Result alias for telemetry operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Errors raised by telemetry helpers.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A global tracing subscriber was already installed.
    #[error("tracing subscriber already installed")]
    SubscriberInstall {
        /// Underlying tracing subscriber error.
        source: tracing_subscriber::util::TryInitError,
    },
    /// A collector definition was rejected.
    #[error("metric definition rejected")]
    MetricsCollector {
        /// Metric name.
        name: &'static str,
        /// Underlying Prometheus error.
        source: PrometheusError,
    },
    /// The registry refused a collector.
    #[error("metric registration rejected")]
    MetricsRegister {
        /// Metric name.
        name: &'static str,
        /// Underlying Prometheus error.
        source: PrometheusError,
    },
    /// The text exposition could not be produced.
    #[error("metric exposition failed")]
    MetricsEncode {
        /// Underlying Prometheus error.
        source: PrometheusError,
    },
    /// The text exposition contained invalid UTF-8.
    #[error("metric exposition was not utf-8")]
    MetricsUtf8 {
        /// Underlying conversion error.
        source: std::string::FromUtf8Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn registration_failure_keeps_metric_name_and_source() {
        let err = TelemetryError::MetricsRegister {
            name: "tierkeep_scans_total",
            source: PrometheusError::AlreadyReg,
        };
        assert_eq!(err.to_string(), "metric registration rejected");
        assert!(matches!(
            err,
            TelemetryError::MetricsRegister {
                name: "tierkeep_scans_total",
                ..
            }
        ));
        assert!(err.source().is_some());
    }

    #[test]
    fn invalid_exposition_bytes_are_reported() {
        let Err(source) = String::from_utf8(vec![0xf0, 0x28]) else {
            panic!("expected invalid utf-8");
        };
        let err = TelemetryError::MetricsUtf8 { source };
        assert_eq!(err.to_string(), "metric exposition was not utf-8");
        assert!(err.source().is_some());
    }
}
