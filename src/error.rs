use std::fmt::Display;

use tracing::error;
use tracing_error::{ExtractSpanTrace, SpanTrace};

/// An error together with the span trace captured where it surfaced.
#[derive(Debug)]
pub struct SpannedErr<T> {
    pub err: T,
    pub span_trace: SpanTrace,
}

impl<T> SpannedErr<T> {
    pub fn new(err: T) -> Self {
        Self {
            err,
            span_trace: SpanTrace::capture(),
        }
    }

    pub fn inner(&self) -> &T {
        &self.err
    }
}

pub trait SpannedExt<T, E> {
    fn with_span_trace(self) -> Result<T, SpannedErr<E>>;
}

impl<T, E> SpannedExt<T, E> for Result<T, E> {
    fn with_span_trace(self) -> Result<T, SpannedErr<E>> {
        self.map_err(SpannedErr::new)
    }
}

impl<E> ExtractSpanTrace for SpannedErr<E> {
    fn span_trace(&self) -> Option<&SpanTrace> {
        Some(&self.span_trace)
    }
}

impl<T: Display> Display for SpannedErr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.err, f)
    }
}

impl<U: std::error::Error> std::error::Error for SpannedErr<U> {}

/// Logs `err` and prints its span trace, if any, to stderr.
pub fn report(context: &str, err: &dyn Display, span_trace: Option<&SpanTrace>) {
    error!("{context}: {err}");
    if let Some(span_trace) = span_trace {
        eprintln!("\n{}\n", color_spantrace::colorize(span_trace));
    }
}
