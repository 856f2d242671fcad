// Copyright (c) 2021 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::HashMap;
use std::io;
use std::io::Write;
use std::process;
use std::result;
use std::sync::Mutex;

use slog::{BorrowedKV, Drain, Key, OwnedKV, OwnedKVList, Record, KV};

// The writer is a parameter so tests can capture the output.
pub fn create_logger<W>(name: &str, source: &str, level: slog::Level, writer: W) -> slog::Logger
where
    W: Write + Send + Sync + 'static,
{
    let json_drain = slog_json::Json::new(writer)
        .add_default_keys()
        .build()
        .fuse();

    // Collapse duplicate keys so a child logger field overrides the
    // parent field of the same name instead of appearing next to it.
    let unique_drain = UniqueDrain::new(json_drain).fuse();

    let filter_drain = RuntimeLevelFilter::new(unique_drain, level).fuse();

    let async_drain = slog_async::Async::new(filter_drain).build().fuse();

    slog::Logger::root(
        async_drain,
        o!("version" => env!("CARGO_PKG_VERSION"),
            "subsystem" => "root",
            "pid" => process::id().to_string(),
            "name" => name.to_string(),
            "source" => source.to_string()),
    )
}

// Flattens a KV chain into a map. Loggers serialize child fields first,
// so keeping the first instance of a key resolves a parent/child
// collision to the child value.
struct HashSerializer {
    fields: HashMap<String, String>,
}

impl HashSerializer {
    fn new() -> HashSerializer {
        HashSerializer {
            fields: HashMap::new(),
        }
    }

    fn add_field(&mut self, key: String, value: String) {
        self.fields.entry(key).or_insert(value);
    }

    fn remove_field(&mut self, key: &str) {
        self.fields.remove(key);
    }
}

impl slog::Serializer for HashSerializer {
    fn emit_arguments(&mut self, key: Key, value: &std::fmt::Arguments) -> slog::Result {
        self.add_field(format!("{}", key), format!("{}", value));
        Ok(())
    }
}

impl KV for HashSerializer {
    fn serialize(&self, _record: &Record, serializer: &mut dyn slog::Serializer) -> slog::Result {
        for (key, value) in self.fields.iter() {
            serializer.emit_str(Key::from(key.clone()), value)?;
        }
        Ok(())
    }
}

// Rebuilds each record with a unique set of key/value fields before it
// reaches the format drain.
struct UniqueDrain<D> {
    drain: D,
}

impl<D> UniqueDrain<D> {
    fn new(drain: D) -> Self {
        UniqueDrain { drain }
    }
}

impl<D> Drain for UniqueDrain<D>
where
    D: Drain,
{
    type Ok = ();
    type Err = io::Error;

    fn log(&self, record: &Record, values: &OwnedKVList) -> result::Result<Self::Ok, Self::Err> {
        let mut logger_fields = HashSerializer::new();
        values.serialize(record, &mut logger_fields)?;

        let mut record_fields = HashSerializer::new();
        record.kv().serialize(record, &mut record_fields)?;

        // A record field beats a logger field of the same name.
        for key in record_fields.fields.keys() {
            logger_fields.remove_field(key);
        }

        let record_kv = OwnedKV(record_fields);
        let record_static = record_static!(record.level(), "");
        let merged = Record::new(&record_static, record.msg(), BorrowedKV(&record_kv));

        self.drain
            .log(&merged, &OwnedKVList::from(OwnedKV(logger_fields)))
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "failed to drain log"))?;

        Ok(())
    }
}

// Discards records below the configured level.
struct RuntimeLevelFilter<D> {
    drain: D,
    level: Mutex<slog::Level>,
}

impl<D> RuntimeLevelFilter<D> {
    fn new(drain: D, level: slog::Level) -> Self {
        RuntimeLevelFilter {
            drain,
            level: Mutex::new(level),
        }
    }
}

impl<D> Drain for RuntimeLevelFilter<D>
where
    D: Drain,
{
    type Ok = Option<D::Ok>;
    type Err = Option<D::Err>;

    fn log(
        &self,
        record: &Record,
        values: &OwnedKVList,
    ) -> result::Result<Self::Ok, Self::Err> {
        let log_level = self.level.lock().unwrap();

        if record.level().is_at_least(*log_level) {
            self.drain.log(record, values)?;
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::io::prelude::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_create_logger_write_to_tmpfile() {
        let writer = NamedTempFile::new().expect("failed to create tempfile");
        let mut writer_ref = writer.reopen().expect("failed to clone tempfile");

        let logger = create_logger("vfs", "test", slog::Level::Trace, writer);

        info!(logger, "mounted"; "subsystem" => "mount", "target" => "/proc");

        // Joins the drain thread, flushing the file.
        drop(logger);

        let mut contents = String::new();
        writer_ref
            .read_to_string(&mut contents)
            .expect("failed to read tempfile contents");

        let fields: Value =
            serde_json::from_str(&contents).expect("failed to convert logfile to json");

        assert_ne!(fields.get("ts").unwrap(), "");
        assert_eq!(fields.get("version").unwrap(), env!("CARGO_PKG_VERSION"));
        assert_ne!(fields.get("pid").unwrap(), "");
        assert_eq!(fields.get("level").unwrap(), "INFO");
        assert_eq!(fields.get("msg").unwrap(), "mounted");
        assert_eq!(fields.get("name").unwrap(), "vfs");
        assert_eq!(fields.get("source").unwrap(), "test");
        // A record field wins over the logger field of the same name.
        assert_eq!(fields.get("subsystem").unwrap(), "mount");
        assert_eq!(fields.get("target").unwrap(), "/proc");
    }

    #[test]
    fn test_child_logger_field_overrides_parent() {
        let writer = NamedTempFile::new().expect("failed to create tempfile");
        let mut writer_ref = writer.reopen().expect("failed to clone tempfile");

        let root = create_logger("vfs", "test", slog::Level::Trace, writer);
        let child = root.new(o!("subsystem" => "mount"));

        info!(child, "attached");

        drop(child);
        drop(root);

        let mut contents = String::new();
        writer_ref
            .read_to_string(&mut contents)
            .expect("failed to read tempfile contents");

        // The parent's default must not survive next to the override,
        // or a last-key-wins parser resolves the line to the parent.
        assert_eq!(contents.matches("\"subsystem\"").count(), 1);

        let fields: Value =
            serde_json::from_str(&contents).expect("failed to convert logfile to json");
        assert_eq!(fields.get("subsystem").unwrap(), "mount");
        assert_eq!(fields.get("msg").unwrap(), "attached");
        // Parent fields without an override still reach the line.
        assert_eq!(fields.get("name").unwrap(), "vfs");
        assert_eq!(fields.get("source").unwrap(), "test");
    }

    #[test]
    fn test_level_filter_discards_below_threshold() {
        let writer = NamedTempFile::new().expect("failed to create tempfile");
        let mut writer_ref = writer.reopen().expect("failed to clone tempfile");

        let logger = create_logger("vfs", "test", slog::Level::Warning, writer);
        debug!(logger, "dropped");
        warn!(logger, "kept");
        drop(logger);

        let mut contents = String::new();
        writer_ref
            .read_to_string(&mut contents)
            .expect("failed to read tempfile contents");

        assert!(!contents.contains("dropped"));
        assert!(contents.contains("kept"));
    }
}
