//! Emitter - snapshot collection
//!
//! After each tick the scheduler hands the tree to the [`Emitter`], which
//! copies the configured paths into an in-memory log and forwards the same
//! records to any attached [`EmitSink`]s.
//!
//! Emission is strictly observational: nothing read here feeds back into the
//! simulation.
//!
//! # Sinks
//!
//! - [`JsonLinesSink`] - one JSON record per line to any writer
//! - [`NullSink`] - discard output

use std::fs::File;
use std::io::{BufWriter, Write};

use indexmap::IndexMap;
use tracing::trace;

use crate::config::EmitterConfig;
use crate::error::SinkError;
use crate::path::Path;
use crate::tree::StateTree;
use crate::types::{EmitRecord, Time, Value};

/// Trait for emit sinks
///
/// # Lifecycle
///
/// 1. Attach the sink with [`Emitter::add_sink`]
/// 2. `emit_tick()` is called for every captured tick
/// 3. `flush()` is called at the end of each run
/// 4. `close()` finalizes output; the sink must not be used afterwards
pub trait EmitSink: Send {
    fn emit_tick(&mut self, tick: u64, time: Time, records: &[EmitRecord]) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError>;

    fn close(&mut self) -> Result<(), SinkError>;
}

/// Null sink - discards all data
pub struct NullSink;

impl EmitSink for NullSink {
    fn emit_tick(&mut self, _tick: u64, _time: Time, _records: &[EmitRecord]) -> Result<(), SinkError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Writes each record as one JSON object per line.
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
    is_closed: bool,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            is_closed: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn check_not_closed(&self) -> Result<(), SinkError> {
        if self.is_closed {
            Err(SinkError::AlreadyClosed)
        } else {
            Ok(())
        }
    }
}

impl JsonLinesSink<BufWriter<File>> {
    /// Create (or truncate) a JSON-lines file.
    pub fn create(path: impl AsRef<std::path::Path>) -> Result<Self, SinkError> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> EmitSink for JsonLinesSink<W> {
    fn emit_tick(&mut self, _tick: u64, _time: Time, records: &[EmitRecord]) -> Result<(), SinkError> {
        self.check_not_closed()?;
        for record in records {
            serde_json::to_writer(&mut self.writer, record)?;
            self.writer.write_all(b"\n")?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.check_not_closed()?;
        self.writer.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if !self.is_closed {
            self.writer.flush()?;
            self.is_closed = true;
        }
        Ok(())
    }
}

/// Collects snapshots of configured paths.
pub struct Emitter {
    config: EmitterConfig,
    records: Vec<EmitRecord>,
    sinks: Vec<Box<dyn EmitSink>>,
}

impl Emitter {
    pub fn new(config: EmitterConfig) -> Self {
        Self {
            config,
            records: Vec::new(),
            sinks: Vec::new(),
        }
    }

    pub fn add_sink(&mut self, sink: Box<dyn EmitSink>) {
        self.sinks.push(sink);
    }

    pub fn config(&self) -> &EmitterConfig {
        &self.config
    }

    /// Capture configured paths for `tick`. Paths missing from the tree are
    /// skipped for this tick.
    pub fn capture(&mut self, tick: u64, time: Time, tree: &StateTree) -> Result<(), SinkError> {
        if self.config.stride > 1 && tick % self.config.stride != 0 {
            return Ok(());
        }

        let start = self.records.len();
        let root = [Path::root()];
        let paths: &[Path] = if self.config.paths.is_empty() {
            &root
        } else {
            &self.config.paths
        };
        for path in paths {
            match tree.get(path) {
                Ok(value) => self.records.push(EmitRecord {
                    tick,
                    time,
                    path: path.clone(),
                    value,
                }),
                Err(_) => trace!(path = %path, tick, "emit path absent"),
            }
        }

        let captured = &self.records[start..];
        for sink in &mut self.sinks {
            sink.emit_tick(tick, time, captured)?;
        }
        Ok(())
    }

    pub fn records(&self) -> &[EmitRecord] {
        &self.records
    }

    /// Distinct emit times in order.
    pub fn times(&self) -> Vec<Time> {
        let mut times: Vec<Time> = Vec::new();
        for record in &self.records {
            if times.last() != Some(&record.time) {
                times.push(record.time);
            }
        }
        times
    }

    /// Time series of the value at `path`.
    ///
    /// Values are extracted from the most specific captured ancestor of
    /// `path`; ticks where the path did not exist are left out.
    pub fn query(&self, path: &Path) -> Vec<(Time, Value)> {
        let mut best: IndexMap<u64, (usize, Time, Value)> = IndexMap::new();
        for record in &self.records {
            let Some(rest) = path.strip_prefix(&record.path) else {
                continue;
            };
            let Some(value) = record.value.get_path(rest) else {
                continue;
            };
            let depth = record.path.len();
            match best.get(&record.tick) {
                Some((existing, _, _)) if *existing >= depth => {}
                _ => {
                    best.insert(record.tick, (depth, record.time, value.clone()));
                }
            }
        }
        best.into_values().map(|(_, time, value)| (time, value)).collect()
    }

    pub fn flush(&mut self) -> Result<(), SinkError> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), SinkError> {
        for sink in &mut self.sinks {
            sink.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TypeRegistry;
    use serde_json::json;

    fn tree(json: serde_json::Value) -> StateTree {
        StateTree::from_value(&Value::from(json), &TypeRegistry::new()).unwrap()
    }

    #[test]
    fn test_capture_and_query() {
        let mut emitter = Emitter::new(EmitterConfig {
            paths: vec![Path::parse("cells")],
            stride: 1,
        });
        emitter.capture(0, 0.0, &tree(json!({"cells": {"0": {"v": 1.0}}}))).unwrap();
        emitter.capture(1, 1.0, &tree(json!({"cells": {"0": {"v": 2.0}}}))).unwrap();
        emitter.capture(2, 2.0, &tree(json!({"cells": {}}))).unwrap();

        assert_eq!(emitter.times(), vec![0.0, 1.0, 2.0]);
        assert_eq!(
            emitter.query(&Path::parse("cells/0/v")),
            vec![(0.0, Value::Float(1.0)), (1.0, Value::Float(2.0))]
        );
    }

    #[test]
    fn test_missing_path_skipped() {
        let mut emitter = Emitter::new(EmitterConfig {
            paths: vec![Path::parse("absent"), Path::parse("x")],
            stride: 1,
        });
        emitter.capture(0, 0.0, &tree(json!({"x": 1.0}))).unwrap();
        assert_eq!(emitter.records().len(), 1);
    }

    #[test]
    fn test_stride() {
        let mut emitter = Emitter::new(EmitterConfig {
            paths: Vec::new(),
            stride: 2,
        });
        let t = tree(json!({"x": 1.0}));
        for tick in 0..5 {
            emitter.capture(tick, tick as f64, &t).unwrap();
        }
        assert_eq!(emitter.times(), vec![0.0, 2.0, 4.0]);
    }

    #[test]
    fn test_json_lines_sink() {
        let mut sink = JsonLinesSink::new(Vec::new());
        let record = EmitRecord {
            tick: 3,
            time: 1.5,
            path: Path::parse("cells/0"),
            value: Value::Float(2.0),
        };
        sink.emit_tick(3, 1.5, std::slice::from_ref(&record)).unwrap();
        sink.close().unwrap();
        assert!(matches!(
            sink.emit_tick(4, 2.0, &[]),
            Err(SinkError::AlreadyClosed)
        ));

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let parsed: EmitRecord = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(parsed, record);
        assert!(text.contains(r#""path":"/cells/0""#));
    }
}
