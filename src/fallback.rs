// src/fallback.rs
//
// =============================================================================
// RUNSCRIBE: BACKEND DEGRADATION
// =============================================================================
//
// A misconfigured or unreachable tracking backend must never abort an
// experiment. Each degradation produces exactly one `warn` record; with the
// diagnostic toggle on, the full error chain rides in that same record.

use crate::config::{Settings, ENV_PRINT_STACKTRACE};
use crate::error::TrackingError;

/// What the user was told when a backend call was downgraded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackNotice {
    /// The one-line warning.
    pub message: String,
    /// Full error chain, present only when the diagnostic toggle is on.
    pub detail: Option<String>,
}

impl FallbackNotice {
    /// Formats the notice for `context`, without emitting it.
    pub fn build(context: &str, err: TrackingError, print_stacktrace: bool) -> Self {
        let message = format!("{}: {}", context, err);
        // anyhow renders the source chain and, when captured, a backtrace.
        let detail = print_stacktrace.then(|| format!("{:?}", anyhow::Error::new(err)));
        Self { message, detail }
    }

    /// Emits the notice as a single warning record.
    pub fn emit(&self) {
        match &self.detail {
            Some(detail) => log::warn!("{}\n{}", self.message, detail),
            None => log::warn!(
                "{} (set {}=true for details)",
                self.message,
                ENV_PRINT_STACKTRACE
            ),
        }
    }
}

/// Builds and emits the notice for a downgraded backend failure.
pub fn report(context: &str, err: TrackingError, settings: &Settings) -> FallbackNotice {
    let notice = FallbackNotice::build(context, err, settings.print_stacktrace);
    notice.emit();
    notice
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_like() -> TrackingError {
        TrackingError::io(
            "/srv/tracker",
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused"),
        )
    }

    #[test]
    fn detail_only_with_toggle() {
        let quiet = FallbackNotice::build("MLflow is badly configured", unreachable_like(), false);
        assert!(quiet.message.starts_with("MLflow is badly configured: "));
        assert!(quiet.detail.is_none());

        let loud = FallbackNotice::build("MLflow is badly configured", unreachable_like(), true);
        assert_eq!(loud.message, quiet.message);
        let detail = loud.detail.unwrap();
        assert!(detail.contains("Caused by"), "{detail}");
        assert!(detail.contains("connection refused"), "{detail}");
    }

    #[test]
    fn detail_renders_the_cause_chain_in_order() {
        let notice = FallbackNotice::build("Tracking backend is unavailable", unreachable_like(), true);
        let detail = notice.detail.unwrap();
        let top = detail.find("tracking store I/O failed").unwrap();
        let caused_by = detail.find("Caused by").unwrap();
        assert!(top < caused_by, "{detail}");
        // Once in the headline, once as the listed cause.
        assert_eq!(detail.matches("connection refused").count(), 2, "{detail}");
    }
}
