// rust/pipeline-core/src/reader/text.rs

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;

use super::{LoadContext, RecordReader};
use crate::config::{ReaderConfig, SlotKind};
use crate::error::Result;
use crate::record::{Record, SlotTable};

/// Reads whitespace-separated text records, one per line.
///
/// A line is `[ins_id] [content] [log_key] name:value ...`, where each
/// leading field is present only if the matching `parse_*` option is set.
/// Feature tokens name a configured slot; values parse as `u64` or `f32`
/// according to the slot kind. Unknown or unused slots and unparsable
/// values are skipped token by token. Lines missing a leading field, and
/// lines with a malformed log key, are skipped whole.
#[derive(Debug, Clone)]
pub struct TextRecordReader {
    slots: Arc<SlotTable>,
    parse_ins_id: bool,
    parse_content: bool,
    parse_logkey: bool,
    write_batch: usize,
}

impl TextRecordReader {
    pub fn new(config: &ReaderConfig) -> Self {
        Self {
            slots: Arc::new(SlotTable::new(&config.slots)),
            parse_ins_id: config.parse_ins_id,
            parse_content: config.parse_content,
            parse_logkey: config.parse_logkey,
            write_batch: config.write_batch.max(1),
        }
    }

    pub fn slots(&self) -> &Arc<SlotTable> {
        &self.slots
    }

    /// Parses one line, or `None` if it is blank or malformed.
    pub fn parse_line(&self, line: &str) -> Option<Record> {
        let mut tokens = line.split_whitespace().peekable();
        tokens.peek()?;

        let mut record = Record::default();
        if self.parse_ins_id {
            record.instance_id = tokens.next()?.to_string();
        }
        if self.parse_content {
            record.content = Some(tokens.next()?.to_string());
        }
        if self.parse_logkey && !record.apply_log_key(tokens.next()?) {
            return None;
        }

        for token in tokens {
            let Some((name, value)) = token.split_once(':') else {
                continue;
            };
            let Some(slot) = self.slots.index_of(name) else {
                continue;
            };
            if !self.slots.is_used(slot) {
                continue;
            }
            match self.slots.kind(slot) {
                Some(SlotKind::Uint64) => {
                    if let Ok(v) = value.parse::<u64>() {
                        record.push_uint64(slot, v);
                    }
                }
                Some(SlotKind::Float) => {
                    if let Ok(v) = value.parse::<f32>() {
                        record.push_float(slot, v);
                    }
                }
                None => {}
            }
        }
        Some(record)
    }
}

impl RecordReader for TextRecordReader {
    fn name(&self) -> &'static str {
        "text"
    }

    fn load_into_memory(&self, ctx: &LoadContext) -> Result<usize> {
        let mut batch = Vec::with_capacity(self.write_batch);
        let mut loaded = 0;
        let mut features = 0u64;
        let mut skipped = 0usize;

        while let Some(path) = ctx.files.next_file() {
            let file = match File::open(&path) {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable file");
                    continue;
                }
            };

            for line in BufReader::new(file).lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "stopped reading file early");
                        break;
                    }
                };
                match self.parse_line(&line) {
                    Some(record) => {
                        features += record.feature_count() as u64;
                        batch.push(record);
                        if batch.len() >= self.write_batch {
                            let full = std::mem::replace(&mut batch, Vec::with_capacity(self.write_batch));
                            loaded += ctx.output.write(full);
                        }
                    }
                    None if line.trim().is_empty() => {}
                    None => skipped += 1,
                }
            }
        }
        loaded += ctx.output.write(batch);
        ctx.features.add(features);

        if skipped > 0 {
            tracing::warn!(thread = ctx.thread_id, skipped, "skipped malformed lines");
        }
        tracing::debug!(thread = ctx.thread_id, loaded, features, "load worker finished");
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::make_channel;
    use crate::config::SlotConfig;
    use crate::reader::{FeatureCounter, FileCursor};
    use std::io::Write;
    use tempfile::TempDir;

    fn config() -> ReaderConfig {
        ReaderConfig {
            parse_ins_id: true,
            write_batch: 2,
            slots: vec![
                SlotConfig::sparse("user", SlotKind::Uint64),
                SlotConfig::dense("ctr", SlotKind::Float),
                SlotConfig {
                    used: false,
                    ..SlotConfig::sparse("unused", SlotKind::Uint64)
                },
            ],
            ..ReaderConfig::default()
        }
    }

    #[test]
    fn test_parse_line() {
        let reader = TextRecordReader::new(&config());
        let record = reader
            .parse_line("ins-1 user:42 ctr:0.5 unused:9 nope:1 user:bad")
            .unwrap();

        assert_eq!(record.instance_id, "ins-1");
        assert_eq!(record.uint64_feasigns.len(), 1);
        assert_eq!(record.uint64_feasigns[0].value, 42);
        assert_eq!(record.float_feasigns.len(), 1);
        assert_eq!(record.float_feasigns[0].slot, 1);
    }

    #[test]
    fn test_parse_line_with_content_and_logkey() {
        let mut cfg = config();
        cfg.parse_content = true;
        cfg.parse_logkey = true;
        let reader = TextRecordReader::new(&cfg);

        let key = "00000000000".to_string() + "001" + "02" + "0000000000000010";
        let record = reader
            .parse_line(&format!("ins-1 payload {key} user:1"))
            .unwrap();
        assert_eq!(record.content.as_deref(), Some("payload"));
        assert_eq!(record.search_id, 16);

        assert!(reader.parse_line("ins-1 payload shortkey user:1").is_none());
        assert!(reader.parse_line("ins-1").is_none());
    }

    #[test]
    fn test_parse_blank_line() {
        let reader = TextRecordReader::new(&config());
        assert!(reader.parse_line("   ").is_none());
    }

    #[test]
    fn test_load_into_memory() {
        let dir = TempDir::new().unwrap();
        let mut files = Vec::new();
        for f in 0..3 {
            let path = dir.path().join(format!("part-{f}"));
            let mut file = File::create(&path).unwrap();
            for i in 0..5 {
                writeln!(file, "ins-{f}-{i} user:{i} ctr:1.5").unwrap();
            }
            writeln!(file).unwrap();
            files.push(path);
        }
        files.push(dir.path().join("missing"));

        let output = make_channel();
        let features = Arc::new(FeatureCounter::new());
        let ctx = LoadContext {
            thread_id: 0,
            thread_num: 1,
            files: Arc::new(FileCursor::new(files)),
            features: Arc::clone(&features),
            output: Arc::clone(&output),
        };

        let reader = TextRecordReader::new(&config());
        assert_eq!(reader.load_into_memory(&ctx).unwrap(), 15);
        assert_eq!(output.size(), 15);
        assert_eq!(features.get(), 30);
    }
}
