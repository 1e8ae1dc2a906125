//! Binary entrypoint: read JSON lines from stdin, write JSON lines to stdout.
//!
//! Each input line is an InboundMessage belonging to a split file
//! (START marker, content lines, END marker carrying `lineCount`).
//! Output lines are OutputRecords (`released` / `discarded` / `rejected`)
//! or an ErrorOutput when a line cannot be parsed.
//!
//! Logs go to stderr; filter with RUST_LOG.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use aggregator_engine::normalize::normalize;
use aggregator_engine::sink::JsonLinesSink;
use aggregator_engine::types::ErrorOutput;
use aggregator_engine::{Config, CorrelatingEngine, EngineError, InboundMessage, Message, Strategies};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const ENV_KEY_HEADER: &str = "AGGREGATOR_KEY_HEADER";
const DEFAULT_KEY_HEADER: &str = "file_name";

fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(io::stderr)
    .init();

  let config = match Config::from_env_with_defaults() {
    Ok(c) => c,
    Err(e) => {
      error!(error = %e, "invalid configuration");
      std::process::exit(2);
    }
  };
  let key_header =
    std::env::var(ENV_KEY_HEADER).unwrap_or_else(|_| DEFAULT_KEY_HEADER.to_string());

  let sink = Arc::new(JsonLinesSink::new(io::BufWriter::new(io::stdout())));
  let engine = match CorrelatingEngine::new(config, Strategies::file_splitter(&key_header), sink.clone()) {
    Ok(e) => Arc::new(e),
    Err(e) => {
      error!(error = %e, "cannot start engine");
      std::process::exit(2);
    }
  };
  let reaper = match engine.start_reaper() {
    Ok(r) => r,
    Err(e) => {
      error!(error = %e, "cannot start reaper");
      std::process::exit(2);
    }
  };

  let stdin = io::stdin();
  for line in stdin.lock().lines() {
    let line = match line {
      Ok(l) => l,
      Err(e) => {
        error!(error = %e, "read error");
        std::process::exit(1);
      }
    };

    // Skip blank lines.
    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }

    let raw: InboundMessage = match serde_json::from_str(trimmed) {
      Ok(v) => v,
      Err(e) => {
        write_error(&sink, ErrorOutput::new(format!("json parse: {}", e)));
        continue;
      }
    };

    let message = match normalize(&raw) {
      Ok(m) => m,
      Err(EngineError::Validation { field, reason }) => {
        write_error(&sink, ErrorOutput::new(reason).with_field(field));
        continue;
      }
      Err(e) => {
        write_error(&sink, ErrorOutput::new(e.to_string()));
        continue;
      }
    };

    submit_line(&engine, &sink, message);
  }

  reaper.stop();
  match engine.flush() {
    Ok(report) => info!(
      discarded = report.discarded,
      busy = report.busy,
      "flushed pending groups at end of input"
    ),
    Err(e) => error!(error = %e, "flush failed"),
  }
  info!(stats = ?engine.stats(), "done");
  let _ = sink.flush();
}

/// Releases, rejections and discards reach stdout through the sink. A lock
/// timeout leaves nothing behind, so it gets one retry and then an error line.
fn submit_line<W: Write + Send>(engine: &CorrelatingEngine, sink: &JsonLinesSink<W>, message: Message) {
  let id = message.id();
  let mut result = engine.submit(message.clone());
  if matches!(result, Err(EngineError::LockTimeout { .. })) {
    result = engine.submit(message);
  }
  if let Err(e @ EngineError::LockTimeout { .. }) = result {
    write_error(sink, ErrorOutput::new(format!("message {} dropped: {}", id, e)));
  }
}

fn write_error<W: Write + Send>(sink: &JsonLinesSink<W>, err: ErrorOutput) {
  sink.write_value(&err);
}
