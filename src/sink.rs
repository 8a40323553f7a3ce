//! Fault-reporting sinks.
//!
//! A server has two independently configurable sinks: one for errors raised by
//! application code and one for transport failures. Both receive an
//! [`ErrorContext`] identifying the connection.

use std::sync::Arc;

use crate::error::ErrorContext;

/// Destination for failures.
pub trait ErrorSink: Send + Sync + 'static {
    fn report(&self, context: &ErrorContext, error: &anyhow::Error);
}

pub type SharedSink = Arc<dyn ErrorSink>;

impl<F> ErrorSink for F
where
    F: Fn(&ErrorContext, &anyhow::Error) + Send + Sync + 'static,
{
    fn report(&self, context: &ErrorContext, error: &anyhow::Error) {
        self(context, error)
    }
}

/// Prints the full diagnostic, error chain included, to stderr.
///
/// Default application sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrintErrorSink;

impl ErrorSink for PrintErrorSink {
    fn report(&self, context: &ErrorContext, error: &anyhow::Error) {
        eprintln!("[{}] {:?}", context, error);
    }
}

/// Discards everything. Default transport sink: on a real network peers
/// disconnect mid-request all the time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentErrorSink;

impl ErrorSink for SilentErrorSink {
    fn report(&self, _context: &ErrorContext, _error: &anyhow::Error) {}
}

/// Emits a structured `tracing` event per failure.
#[derive(Debug, Clone, Copy)]
pub struct TracingErrorSink {
    level: tracing::Level,
}

impl TracingErrorSink {
    pub fn new(level: tracing::Level) -> Self {
        Self { level }
    }
}

impl Default for TracingErrorSink {
    fn default() -> Self {
        Self::new(tracing::Level::ERROR)
    }
}

impl ErrorSink for TracingErrorSink {
    fn report(&self, context: &ErrorContext, error: &anyhow::Error) {
        let request = context.request.as_deref().unwrap_or("-");
        let message = format!("{:#}", error);
        if self.level == tracing::Level::ERROR {
            tracing::error!(
                peer = %context.remote_addr,
                connection = context.connection_id,
                kind = %context.kind,
                request,
                error = %message,
                "Unhandled failure"
            );
        } else if self.level == tracing::Level::WARN {
            tracing::warn!(
                peer = %context.remote_addr,
                connection = context.connection_id,
                kind = %context.kind,
                request,
                error = %message,
                "Unhandled failure"
            );
        } else {
            tracing::debug!(
                peer = %context.remote_addr,
                connection = context.connection_id,
                kind = %context.kind,
                request,
                error = %message,
                "Unhandled failure"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectionKind;
    use std::sync::Mutex;

    #[test]
    fn closures_are_sinks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let sink: SharedSink = Arc::new(move |ctx: &ErrorContext, err: &anyhow::Error| {
            captured
                .lock()
                .unwrap()
                .push(format!("{} {}", ctx.connection_id, err));
        });

        let ctx = ErrorContext::new("127.0.0.1:1".parse().unwrap(), 3, ConnectionKind::Http);
        sink.report(&ctx, &anyhow::anyhow!("boom"));

        assert_eq!(seen.lock().unwrap().as_slice(), ["3 boom"]);
    }
}
