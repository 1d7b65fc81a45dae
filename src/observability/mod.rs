//! Observability for the server and sensor nodes
//!
//! Structured logging through tracing; operator-facing health is served
//! by [`crate::http`].

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use crate::{monitor_span, mqtt_span};
