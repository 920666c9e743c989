// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log line formatting and subscriber installation.
//!
//! Lines look like:
//! ```text
//! INGEST | WARN | journal_reader: Skipping unreadable journal entry offset=42 message_id=abc
//! INGEST | ERROR | stage_worker{stage="output" worker=1}: Failed to process message offset=7
//! ```

use std::fmt;

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::error::PipelineError;

/// Prefixes every line with `INGEST` and the level, followed by the active spans.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(&mut writer, "INGEST | {} | ", metadata.level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs the global subscriber, filtered at `log_level` (any `EnvFilter` directive).
///
/// Fails if the directive does not parse or a global subscriber is already set.
pub fn init(log_level: &str) -> Result<(), PipelineError> {
    let filter = EnvFilter::try_new(log_level).map_err(|e| {
        PipelineError::InvalidConfig(format!("could not parse log level '{log_level}': {e}"))
    })?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .event_format(Formatter)
        .finish();

    tracing::subscriber::set_global_default(subscriber).map_err(|e| {
        PipelineError::InvalidConfig(format!("setting default subscriber failed: {e}"))
    })?;

    tracing::debug!(log_level, "Logging subsystem enabled");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture_lines(f: impl FnOnce()) -> String {
        let capture = Capture::default();
        let make_writer = capture.clone();
        let subscriber = tracing_subscriber::fmt::Subscriber::builder()
            .event_format(Formatter)
            .with_writer(move || make_writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = capture.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_plain_event() {
        let out = capture_lines(|| tracing::info!(port = 8124, "pipeline started"));
        assert_eq!(out, "INGEST | INFO | pipeline started port=8124\n");
    }

    #[test]
    fn test_event_inside_spans() {
        let out = capture_lines(|| {
            let outer = tracing::info_span!("pipeline");
            let _outer = outer.enter();
            let inner = tracing::info_span!("stage_worker", worker = 1);
            let _inner = inner.enter();
            tracing::warn!(offset = 7, "Failed to process message");
        });
        assert_eq!(
            out,
            "INGEST | WARN | pipeline: stage_worker{worker=1}: Failed to process message offset=7\n"
        );
    }

    #[test]
    fn test_second_install_fails() {
        // another test harness may already own the global subscriber
        let _ = init("info");
        assert!(init("debug").is_err());
    }
}
