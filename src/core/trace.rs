use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub ts_ms: i64,
    pub run_id: String,
    pub node: String,
    pub data: Value,
}

/// Destination for trace events. Implementations may fail; the [`Tracer`]
/// in front of them never lets that failure reach the run.
pub trait TraceSink: Send + Sync {
    fn record(&self, event: &TraceEvent) -> Result<()>;
}

/// Keeps every event in memory, in order.
#[derive(Default)]
pub struct MemoryTraceSink {
    events: Mutex<Vec<TraceEvent>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn events_for(&self, run_id: &str) -> Vec<TraceEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.run_id == run_id)
            .collect()
    }

    #[cfg(test)]
    pub fn nodes(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.node).collect()
    }
}

impl TraceSink for MemoryTraceSink {
    fn record(&self, event: &TraceEvent) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}

/// Forwards events to the `tracing` subscriber.
pub struct LogTraceSink;

impl TraceSink for LogTraceSink {
    fn record(&self, event: &TraceEvent) -> Result<()> {
        info!(
            target: "askdb::trace",
            run_id = %event.run_id,
            node = %event.node,
            "{}",
            event.data
        );
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonlTraceSink {
    file: Mutex<File>,
}

impl JsonlTraceSink {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open trace file {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl TraceSink for JsonlTraceSink {
    fn record(&self, event: &TraceEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

/// Sends every event to each inner sink; one failing sink does not starve the
/// others.
pub struct FanoutTraceSink {
    sinks: Vec<Arc<dyn TraceSink>>,
}

impl FanoutTraceSink {
    pub fn new(sinks: Vec<Arc<dyn TraceSink>>) -> Self {
        Self { sinks }
    }
}

impl TraceSink for FanoutTraceSink {
    fn record(&self, event: &TraceEvent) -> Result<()> {
        let errors: Vec<String> = self
            .sinks
            .iter()
            .filter_map(|s| s.record(event).err())
            .map(|e| format!("{:#}", e))
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("{} trace sink(s) failed: {}", errors.len(), errors.join("; ")))
        }
    }
}

/// Per-run recorder in front of a sink.
pub struct Tracer {
    run_id: String,
    sink: Arc<dyn TraceSink>,
    warned: AtomicBool,
}

impl Tracer {
    pub fn new(run_id: impl Into<String>, sink: Arc<dyn TraceSink>) -> Self {
        Self {
            run_id: run_id.into(),
            sink,
            warned: AtomicBool::new(false),
        }
    }

    pub fn record(&self, node: &str, data: Value) {
        let event = TraceEvent {
            ts_ms: chrono::Utc::now().timestamp_millis(),
            run_id: self.run_id.clone(),
            node: node.to_string(),
            data,
        };
        if let Err(e) = self.sink.record(&event)
            && !self.warned.swap(true, Ordering::Relaxed)
        {
            warn!("Trace sink failed for run {}: {:#}", self.run_id, e);
        }
    }
}

/// `[ts] node` followed by the pretty-printed payload, one block per event.
pub fn format_trace(events: &[TraceEvent]) -> String {
    events
        .iter()
        .map(|e| {
            let data = serde_json::to_string_pretty(&e.data).unwrap_or_else(|_| e.data.to_string());
            format!("[{}] {}\n{}", e.ts_ms, e.node, data)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
