use serde::{Deserialize, Serialize};

/// How long a notice stays on screen unless the caller says otherwise.
pub const DEFAULT_NOTICE_DURATION_MS: u64 = 4_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeSeverity {
    Info,
    Success,
    Warning,
    Error,
}

/// User-facing notification channel owned by the caller.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, message: &str, severity: NoticeSeverity, duration_ms: u64);
}

/// Busy indicator owned by the caller.
pub trait ProgressIndicator: Send + Sync {
    fn begin(&self, label: &str);
    fn end(&self);
}

/// Renders notifications as log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn notify(&self, message: &str, severity: NoticeSeverity, duration_ms: u64) {
        match severity {
            NoticeSeverity::Info | NoticeSeverity::Success => {
                tracing::info!(?severity, duration_ms, "{message}")
            }
            NoticeSeverity::Warning => tracing::warn!(duration_ms, "{message}"),
            NoticeSeverity::Error => tracing::error!(duration_ms, "{message}"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressIndicator for TracingProgress {
    fn begin(&self, label: &str) {
        tracing::info!(label, "Progress started");
    }

    fn end(&self) {
        tracing::debug!("Progress finished");
    }
}

/// Calls `end()` when dropped, so every exit path closes the indicator.
pub(crate) struct ProgressGuard<'a> {
    indicator: &'a dyn ProgressIndicator,
}

impl<'a> ProgressGuard<'a> {
    pub(crate) fn begin(indicator: &'a dyn ProgressIndicator, label: &str) -> Self {
        indicator.begin(label);
        Self { indicator }
    }
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.indicator.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingProgress;

    #[test]
    fn test_guard_ends_on_drop() {
        let progress = RecordingProgress::default();
        {
            let _guard = ProgressGuard::begin(&progress, "Processing subscription...");
            assert_eq!(progress.begun(), vec!["Processing subscription...".to_string()]);
            assert_eq!(progress.ended(), 0);
        }
        assert_eq!(progress.ended(), 1);
    }

    #[test]
    fn test_guard_ends_on_early_return() {
        fn fails(progress: &RecordingProgress) -> Result<(), &'static str> {
            let _guard = ProgressGuard::begin(progress, "work");
            Err::<(), _>("boom")?;
            Ok(())
        }
        let progress = RecordingProgress::default();
        assert!(fails(&progress).is_err());
        assert_eq!(progress.ended(), 1);
    }

    #[test]
    fn test_severity_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&NoticeSeverity::Warning).unwrap(),
            "\"warning\""
        );
    }
}
