//! Training-Data Pipeline Runner
//!
//! Drives one or more pipeline passes over local files and reports what each
//! pass produced. Several ranks can be simulated in-process; they exchange
//! records through a local messenger.
//!
//! # Usage
//!
//! ```bash
//! # One pass over two files with the default configuration
//! tdp-runner part-000 part-001
//!
//! # Configuration file, three passes, two simulated ranks
//! tdp-runner --config pipeline.toml --passes 3 --ranks 2
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pipeline_core::reader::files_for_rank;
use pipeline_core::{
    Dataset, DatasetKind, InterRankMessenger, LocalCluster, PassReport, PipelineConfig,
    PipelineError, PipelineRuntime,
};

/// Training-Data Pipeline Runner
#[derive(Parser, Debug)]
#[command(name = "tdp-runner")]
#[command(about = "Runs training-data pipeline passes over local files")]
struct Args {
    /// Input files, replacing `dataset.filelist` from the configuration
    files: Vec<PathBuf>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dataset variant (multi_slot, slot, distributed_slot)
    #[arg(long)]
    kind: Option<String>,

    /// Number of in-process ranks
    #[arg(long, default_value = "1")]
    ranks: usize,

    /// Number of passes to run
    #[arg(long, default_value = "1")]
    passes: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> pipeline_core::Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    }
    .with_env_overrides();

    if !args.files.is_empty() {
        config.dataset.filelist = args.files.clone();
    }
    if let Some(kind) = &args.kind {
        config.dataset.kind = kind.parse()?;
    }
    if config.dataset.kind == DatasetKind::DistributedSlot && args.ranks < 2 {
        return Err(PipelineError::config("distributed_slot needs --ranks of at least 2"));
    }
    config.validate()?;
    Ok(config)
}

// Drains every reader the way a training loop would, returning the records seen.
fn consume(dataset: &mut dyn Dataset) -> usize {
    let kind = dataset.kind();
    let sessions = dataset.pv_data_size() > 0;
    let mut seen = 0;
    for reader in dataset.readers_mut() {
        match kind {
            DatasetKind::MultiSlot => {
                reader.start();
                while reader.next_batch(|batch| seen += batch.len())
                    || reader.next_indexed_batch(|batch| seen += batch.len())
                    || reader.next_pv_batch(|arena, batch| {
                        seen += batch.iter().map(|pv| pv.resolve(arena).count()).sum::<usize>()
                    })
                {}
            }
            DatasetKind::Slot | DatasetKind::DistributedSlot if sessions => {
                while let Some((arena, batch)) = reader.next_pv_offset_batch() {
                    seen += batch.iter().map(|pv| pv.resolve(arena).count()).sum::<usize>();
                }
            }
            DatasetKind::Slot | DatasetKind::DistributedSlot => {
                while let Some(batch) = reader.next_offset_batch() {
                    seen += batch.len();
                }
            }
        }
    }
    seen
}

fn run_rank(
    mut config: PipelineConfig,
    messenger: Option<Arc<dyn InterRankMessenger>>,
    passes: usize,
) -> pipeline_core::Result<Vec<PassReport>> {
    let rank = messenger.as_ref().map_or(0, |m| m.rank());
    if let Some(m) = &messenger {
        // The record pipeline does not poll files by rank itself.
        if config.dataset.kind == DatasetKind::MultiSlot {
            config.dataset.filelist = files_for_rank(&config.dataset.filelist, m.rank(), m.rank_count());
        }
    }

    let mut runtime = PipelineRuntime::from_config(config)?;
    if let Some(m) = messenger {
        runtime = runtime.with_messenger(m);
    }
    let mut dataset = runtime.build_dataset()?;

    let mut reports = Vec::with_capacity(passes);
    for pass in 0..passes {
        let report = runtime.run_pass(dataset.as_mut())?;
        let consumed = consume(dataset.as_mut());
        tracing::info!(
            rank,
            pass,
            loaded = report.loaded,
            consumed,
            features = report.features,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "pass finished"
        );
        if let Some(merge) = &report.merge {
            tracing::info!(rank, pass, merged = merge.merged_records, dropped = merge.dropped_records, "merge summary");
        }
        dataset.destroy_readers();
        dataset.release_memory();
        dataset.wait_release_done();
        reports.push(report);
    }
    Ok(reports)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;
    tracing::info!("Starting pipeline runner");
    tracing::info!("  Dataset: {:?}", config.dataset.kind);
    tracing::info!("  Files: {}", config.dataset.filelist.len());
    tracing::info!("  Ranks: {}", args.ranks);
    tracing::info!("  Passes: {}", args.passes);

    if args.ranks <= 1 {
        run_rank(config, None, args.passes)?;
        return Ok(());
    }

    let cluster = LocalCluster::new(args.ranks)?;
    let handles: Vec<_> = cluster
        .iter()
        .map(|m| {
            let messenger: Arc<dyn InterRankMessenger> = m.clone();
            let config = config.clone();
            let passes = args.passes;
            thread::Builder::new()
                .name(format!("rank-{}", m.rank()))
                .spawn(move || run_rank(config, Some(messenger), passes))
        })
        .collect::<Result<_, _>>()?;

    let mut failed = None;
    for (rank, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(reports)) => {
                let loaded: usize = reports.iter().map(|r| r.loaded).sum();
                tracing::info!(rank, passes = reports.len(), loaded, "rank finished");
            }
            Ok(Err(e)) => {
                tracing::error!(rank, error = %e, "rank failed");
                failed.get_or_insert(e);
            }
            Err(_) => {
                tracing::error!(rank, "rank panicked");
                failed.get_or_insert(PipelineError::worker(format!("rank-{rank}"), "rank thread panicked"));
            }
        }
    }

    match failed {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::{SlotConfig, SlotKind};
    use std::io::Write;
    use tempfile::TempDir;

    fn write_files(dir: &TempDir, files: usize, lines: usize) -> Vec<PathBuf> {
        (0..files)
            .map(|f| {
                let path = dir.path().join(format!("part-{f}"));
                let mut file = std::fs::File::create(&path).unwrap();
                for i in 0..lines {
                    writeln!(file, "ins-{f}-{i} user:{i}").unwrap();
                }
                path
            })
            .collect()
    }

    fn config(files: Vec<PathBuf>) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.dataset.thread_num = 2;
        config.dataset.filelist = files;
        config.reader.parse_ins_id = true;
        config.reader.slots = vec![SlotConfig::sparse("user", SlotKind::Uint64)];
        config.shuffle.thread_num = 2;
        config.merge.merge_thread_num = 2;
        config
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from(["tdp-runner", "--ranks", "2", "--kind", "slot", "a", "b"]);
        assert_eq!(args.ranks, 2);
        assert_eq!(args.passes, 1);
        assert_eq!(args.files.len(), 2);
        assert_eq!(args.kind.as_deref(), Some("slot"));
    }

    #[test]
    fn test_load_config_applies_overrides() {
        let args = Args::parse_from(["tdp-runner", "--kind", "slot", "x"]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.dataset.filelist, vec![PathBuf::from("x")]);

        let args = Args::parse_from(["tdp-runner", "--kind", "columnar"]);
        assert!(load_config(&args).is_err());

        let args = Args::parse_from(["tdp-runner", "--kind", "distributed_slot"]);
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn test_run_rank_multiple_passes() {
        let dir = TempDir::new().unwrap();
        let reports = run_rank(config(write_files(&dir, 2, 6)), None, 2).unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.loaded == 12));
    }

    #[test]
    fn test_consume_slot_offsets() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(write_files(&dir, 2, 6));
        cfg.dataset.kind = DatasetKind::Slot;
        let runtime = PipelineRuntime::from_config(cfg).unwrap();
        let mut dataset = runtime.build_dataset().unwrap();
        runtime.run_pass(dataset.as_mut()).unwrap();
        assert_eq!(consume(dataset.as_mut()), 12);
    }
}
