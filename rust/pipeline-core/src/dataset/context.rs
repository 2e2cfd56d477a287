// rust/pipeline-core/src/dataset/context.rs

use std::any::Any;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::PipelinePhase;
use crate::channel::{consumer_block_size, make_channel, Channel};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::feed::ThreadReader;
use crate::messenger::InterRankMessenger;
use crate::pool::{join_all, PipelinePools, TaskHandle, WorkerPool};
use crate::reader::{files_for_rank, FeatureCounter, FileCursor, LoadContext, RecordReader};
use crate::record::Record;

/// Arcs a load worker needs, detached from the dataset so pools can be
/// borrowed at the same time.
#[derive(Clone)]
pub(crate) struct LoadJob {
    pub reader: Arc<dyn RecordReader>,
    pub files: Arc<FileCursor>,
    pub features: Arc<FeatureCounter>,
    pub input: Arc<Channel<Record>>,
}

// Closes the input channel when the last load worker exits, even on panic.
struct CloseOnLast {
    remaining: Arc<AtomicUsize>,
    input: Arc<Channel<Record>>,
}

impl Drop for CloseOnLast {
    fn drop(&mut self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.input.close();
        }
    }
}

/// Queues `threads` load workers on `pool`. The last one to exit closes the input.
pub(crate) fn spawn_load_workers(
    pool: &WorkerPool,
    job: &LoadJob,
    threads: usize,
) -> Vec<TaskHandle<Result<usize>>> {
    let remaining = Arc::new(AtomicUsize::new(threads));
    (0..threads)
        .map(|thread_id| {
            let job = job.clone();
            let guard = CloseOnLast {
                remaining: Arc::clone(&remaining),
                input: Arc::clone(&job.input),
            };
            pool.spawn(move || {
                let _guard = guard;
                let ctx = LoadContext {
                    thread_id,
                    thread_num: threads,
                    files: job.files,
                    features: job.features,
                    output: job.input,
                };
                job.reader.load_into_memory(&ctx)
            })
        })
        .collect()
}

/// State every dataset variant carries.
pub(crate) struct DatasetContext {
    pub name: &'static str,
    pub config: PipelineConfig,
    pub reader: Arc<dyn RecordReader>,
    pub messenger: Option<Arc<dyn InterRankMessenger>>,
    pub files: Arc<FileCursor>,
    pub features: Arc<FeatureCounter>,
    pub input: Arc<Channel<Record>>,
    pub pools: PipelinePools,
    pub readers: Vec<ThreadReader>,
    pub rng: StdRng,
    phase: PipelinePhase,
    preload: Vec<TaskHandle<Result<usize>>>,
    release: Option<JoinHandle<()>>,
}

impl DatasetContext {
    pub fn new(
        name: &'static str,
        config: PipelineConfig,
        reader: Arc<dyn RecordReader>,
        messenger: Option<Arc<dyn InterRankMessenger>>,
    ) -> Self {
        let rank = messenger.as_ref().map_or(0, |m| m.rank()) as u64;
        let rng = match config.shuffle.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(rank)),
            None => StdRng::seed_from_u64(rand::random::<u64>()),
        };
        let files = Arc::new(FileCursor::new(config.dataset.filelist.clone()));
        Self {
            name,
            config,
            reader,
            messenger,
            files,
            features: Arc::new(FeatureCounter::new()),
            input: make_channel(),
            pools: PipelinePools::new(),
            readers: Vec::new(),
            rng,
            phase: PipelinePhase::Idle,
            preload: Vec::new(),
            release: None,
        }
    }

    pub fn phase(&self) -> PipelinePhase {
        self.phase
    }

    pub fn enter(&mut self, phase: PipelinePhase) {
        if self.phase != phase {
            tracing::debug!(dataset = self.name, from = ?self.phase, to = ?phase, "phase transition");
            self.phase = phase;
        }
    }

    pub fn thread_num(&self) -> usize {
        self.config.dataset.thread_num
    }

    pub fn channel_num(&self) -> usize {
        self.config.dataset.channel_num
    }

    pub fn rank_count(&self) -> usize {
        self.messenger.as_ref().map_or(1, |m| m.rank_count())
    }

    pub fn set_filelist(&mut self, files: Vec<PathBuf>, poll_by_rank: bool) {
        let files = match &self.messenger {
            Some(m) if poll_by_rank && m.rank_count() > 1 => {
                let kept = files_for_rank(&files, m.rank(), m.rank_count());
                tracing::info!(
                    dataset = self.name,
                    rank = m.rank(),
                    total = files.len(),
                    kept = kept.len(),
                    "file list polled across ranks"
                );
                kept
            }
            _ => files,
        };
        self.config.dataset.filelist = files.clone();
        self.files = Arc::new(FileCursor::new(files));
    }

    pub fn check_readers(&self) -> Result<()> {
        self.check_reader_counts(self.thread_num(), self.channel_num())
    }

    /// Validates a reader/channel count pair without applying it.
    pub fn check_reader_counts(&self, thread_num: usize, channel_num: usize) -> Result<()> {
        if thread_num == 0 {
            return Err(PipelineError::dataset(self.name, "thread_num must be greater than 0"));
        }
        if channel_num == 0 {
            return Err(PipelineError::dataset(self.name, "channel_num must be greater than 0"));
        }
        if channel_num > thread_num {
            return Err(PipelineError::dataset(
                self.name,
                format!("channel_num ({channel_num}) must not exceed thread_num ({thread_num})"),
            ));
        }
        Ok(())
    }

    pub fn load_job(&self) -> LoadJob {
        LoadJob {
            reader: Arc::clone(&self.reader),
            files: Arc::clone(&self.files),
            features: Arc::clone(&self.features),
            input: Arc::clone(&self.input),
        }
    }

    /// Waits for a pending release, rewinds the file cursor and reopens the input.
    pub fn prepare_input(&mut self) {
        self.wait_release_done();
        self.files.reset();
        self.input.open();
    }

    /// Loads every file into the input channel and waits for the workers.
    pub fn load(&mut self) -> Result<usize> {
        self.prepare_input();
        self.enter(PipelinePhase::Loading);
        let started = Instant::now();

        let threads = self.thread_num();
        let job = self.load_job();
        let handles = spawn_load_workers(self.pools.load(threads)?, &job, threads);
        let loaded: usize = join_all(handles)?.into_iter().sum();

        self.input.close();
        self.input
            .set_block_size(consumer_block_size(self.input.size(), threads));
        tracing::info!(
            dataset = self.name,
            loaded,
            features = self.features.get(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "load into memory finished"
        );
        Ok(loaded)
    }

    /// Starts load workers in the background.
    pub fn start_preload(&mut self) -> Result<()> {
        if !self.preload.is_empty() {
            return Err(PipelineError::dataset(self.name, "a preload is already running"));
        }
        self.prepare_input();
        self.enter(PipelinePhase::Loading);

        let threads = self.config.preload_threads();
        let job = self.load_job();
        self.preload = spawn_load_workers(self.pools.load(threads)?, &job, threads);
        tracing::info!(dataset = self.name, threads, "preload started");
        Ok(())
    }

    /// Joins a running preload and fixes the input block size.
    pub fn wait_preload(&mut self) -> Result<usize> {
        let handles = std::mem::take(&mut self.preload);
        let loaded: usize = join_all(handles)?.into_iter().sum();
        self.input.close();
        self.input
            .set_block_size(consumer_block_size(self.input.size(), self.thread_num()));
        tracing::info!(dataset = self.name, loaded, "preload finished");
        Ok(loaded)
    }

    /// Drops `payload` on a background thread.
    pub fn release_in_background(&mut self, payload: Box<dyn Any + Send>) {
        self.wait_release_done();
        let name = self.name;
        let spawned = thread::Builder::new()
            .name(format!("{name}-release"))
            .spawn(move || {
                let started = Instant::now();
                drop(payload);
                tracing::info!(
                    dataset = name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "memory released"
                );
            });
        match spawned {
            Ok(handle) => self.release = Some(handle),
            // The payload is dropped here instead when no thread can be spawned.
            Err(e) => tracing::warn!(dataset = name, error = %e, "releasing memory inline"),
        }
        self.features.reset();
        self.enter(PipelinePhase::Idle);
    }

    pub fn wait_release_done(&mut self) {
        if let Some(handle) = self.release.take() {
            if handle.join().is_err() {
                tracing::error!(dataset = self.name, "release thread panicked");
            }
        }
    }
}

impl Drop for DatasetContext {
    fn drop(&mut self) {
        self.wait_release_done();
    }
}
