//! Observability: structured logging, lifecycle events and counters
//!
//! # Principles
//!
//! 1. Observability is read-only and never changes control flow
//! 2. One log line per event, JSON, deterministic key order
//! 3. Counters are monotonic atomics
//!
//! ```ignore
//! use streamdb::observability::{log_event_with_fields, Event, MetricsRegistry};
//!
//! log_event_with_fields(Event::ChunkCompleted, &[("chunk", "0")]);
//!
//! let metrics = MetricsRegistry::new();
//! metrics.record_append(128);
//! ```

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::Event;
pub use logger::{enabled, Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use scope::{ObservationScope, Timer};

fn severity_of(event: Event) -> Severity {
    if event.is_fatal() {
        Severity::Fatal
    } else if event.is_warning() {
        Severity::Warn
    } else {
        Severity::Info
    }
}

/// Log a lifecycle event
pub fn log_event(event: Event) {
    Logger::log(severity_of(event), event.as_str(), &[]);
}

/// Log a lifecycle event with fields
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    Logger::log(severity_of(event), event.as_str(), fields);
}
