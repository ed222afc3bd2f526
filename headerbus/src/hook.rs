//! Publish observability hook
//!
//! Every publish reports `(severity, metadata, payload, message)` to a single
//! process-wide hook. Without a hook the report becomes a `tracing` event
//! carrying the metadata and the serialized payload.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

/// Severity of a publish report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Trace => "trace",
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// Hook invoked after every publish.
pub type PublishHook = Arc<dyn Fn(Severity, &Value, &Value, &str) + Send + Sync>;

static PUBLISH_HOOK: RwLock<Option<PublishHook>> = parking_lot::const_rwlock(None);

/// Install the publish hook, replacing any previous one.
pub fn set_publish_hook<F>(hook: F)
where
    F: Fn(Severity, &Value, &Value, &str) + Send + Sync + 'static,
{
    *PUBLISH_HOOK.write() = Some(Arc::new(hook));
}

/// Remove the publish hook, restoring the log fallback.
pub fn reset_publish_hook() {
    *PUBLISH_HOOK.write() = None;
}

/// Whether a publish hook is installed.
pub fn has_publish_hook() -> bool {
    PUBLISH_HOOK.read().is_some()
}

/// Report a published event to the hook, or log it when no hook is installed.
pub fn log_event_published(severity: Severity, metadata: &Value, payload: &Value, message: &str) {
    // Clone out so the hook may replace itself without deadlocking
    let hook = PUBLISH_HOOK.read().clone();

    match hook {
        Some(hook) => hook(severity, metadata, payload, message),
        None => {
            let payload = payload.to_string();
            match severity {
                Severity::Trace => tracing::trace!(metadata = %metadata, payload = %payload, "{}", message),
                Severity::Debug => tracing::debug!(metadata = %metadata, payload = %payload, "{}", message),
                Severity::Info => tracing::info!(metadata = %metadata, payload = %payload, "{}", message),
                Severity::Warn => tracing::warn!(metadata = %metadata, payload = %payload, "{}", message),
                Severity::Error => tracing::error!(metadata = %metadata, payload = %payload, "{}", message),
            }
        }
    }
}
