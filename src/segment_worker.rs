use std::fs;
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, sync_channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use thiserror::Error;
use crate::audio::{self, AudioBuffer, AudioError};
use crate::constants::worker::MAX_PENDING_SEGMENTS;
use crate::segmenter::TextSegment;
use crate::synthesis::{SynthesisError, Synthesizer};
use crate::voice::Voice;

/// Why a single segment could not be turned into audio
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("{0}")]
    Synthesis(#[from] SynthesisError),
    #[error("could not write part file: {0}")]
    PartFile(#[from] io::Error),
    #[error("{0}")]
    Decode(#[from] AudioError),
    #[error("segment conversion panicked: {0}")]
    Panicked(String),
}

/// Result for one segment, tagged with its original position
#[derive(Debug)]
pub struct SegmentOutcome {
    pub index: usize,
    pub result: Result<AudioBuffer, SegmentError>,
}

/// Naming and bookkeeping for the per-segment audio files of one job
///
/// Workers record paths concurrently, so the list sits behind a mutex.
pub struct PartFiles {
    dir: PathBuf,
    stem: String,
    extension: String,
    recorded: Mutex<Vec<PathBuf>>,
}

impl PartFiles {
    pub fn new(dir: impl Into<PathBuf>, stem: impl Into<String>, extension: impl Into<String>) -> Self {
        PartFiles {
            dir: dir.into(),
            stem: stem.into(),
            extension: extension.into(),
            recorded: Mutex::new(Vec::new()),
        }
    }

    /// `<dir>/<stem>_<index>.<extension>`
    pub fn path_for(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}_{}.{}", self.stem, index, self.extension))
    }

    /// Write a part file and remember its path for cleanup
    pub fn write(&self, index: usize, bytes: &[u8]) -> io::Result<PathBuf> {
        let path = self.path_for(index);
        fs::write(&path, bytes)?;
        self.lock().push(path.clone());
        Ok(path)
    }

    /// Recorded paths, sorted by file name
    pub fn recorded(&self) -> Vec<PathBuf> {
        let mut paths = self.lock().clone();
        paths.sort();
        paths
    }

    /// Delete every recorded file, returning the ones that could not be removed
    pub fn remove_all(&self) -> Vec<(PathBuf, io::Error)> {
        let paths = std::mem::take(&mut *self.lock());
        let mut failures = Vec::new();

        for path in paths {
            match fs::remove_file(&path) {
                Ok(()) => tracing::debug!("removed part file {}", path.display()),
                Err(e) => {
                    tracing::warn!("failed to remove part file {}: {}", path.display(), e);
                    failures.push((path, e));
                }
            }
        }

        failures
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PathBuf>> {
        // A worker panicking mid-push leaves the list itself intact
        self.recorded.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Converts segments on a fixed number of worker threads
pub struct SegmentPool<'a> {
    synthesizer: &'a dyn Synthesizer,
    voice: Voice,
    parts: &'a PartFiles,
    workers: usize,
}

impl<'a> SegmentPool<'a> {
    pub fn new(synthesizer: &'a dyn Synthesizer, voice: Voice, parts: &'a PartFiles, workers: usize) -> Self {
        SegmentPool {
            synthesizer,
            voice,
            parts,
            workers: workers.max(1),
        }
    }

    /// Convert every segment and hand each outcome to `on_outcome` as it arrives
    ///
    /// `on_dispatched` fires once the last segment has been queued. Outcomes arrive
    /// in completion order. Returns only after every worker has exited.
    pub fn run(
        &self,
        segments: Vec<TextSegment>,
        on_dispatched: impl FnOnce(),
        mut on_outcome: impl FnMut(SegmentOutcome),
    ) {
        if segments.is_empty() {
            on_dispatched();
            return;
        }

        let workers = self.workers.min(segments.len());
        // Bounded so a huge input does not sit in memory twice
        let (task_tx, task_rx) = sync_channel::<TextSegment>(MAX_PENDING_SEGMENTS);
        let task_rx = Arc::new(Mutex::new(task_rx));
        let (result_tx, result_rx) = channel::<SegmentOutcome>();

        thread::scope(|scope| {
            for worker_id in 0..workers {
                let task_rx = Arc::clone(&task_rx);
                let result_tx = result_tx.clone();
                scope.spawn(move || self.worker_loop(worker_id, &task_rx, result_tx));
            }
            // Workers hold the only remaining result senders and task receivers
            drop(result_tx);
            drop(task_rx);

            for segment in segments {
                if task_tx.send(segment).is_err() {
                    tracing::warn!("all segment workers exited early");
                    break;
                }
            }
            drop(task_tx);
            on_dispatched();

            for outcome in result_rx {
                on_outcome(outcome);
            }
        });
    }

    fn worker_loop(
        &self,
        worker_id: usize,
        task_rx: &Mutex<Receiver<TextSegment>>,
        result_tx: Sender<SegmentOutcome>,
    ) {
        tracing::debug!("segment worker {} started", worker_id);

        loop {
            // Hold the lock only while taking the next task
            let next = {
                let rx = task_rx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                rx.recv()
            };
            let Ok(segment) = next else {
                break;
            };

            let index = segment.index;
            tracing::debug!("worker {} converting segment {} ({} chars)", worker_id, index, segment.text.chars().count());

            // A panic in the backend or decoder costs this segment, not the job
            let result = panic::catch_unwind(AssertUnwindSafe(|| self.convert_segment(&segment)))
                .unwrap_or_else(|payload| Err(SegmentError::Panicked(panic_message(payload.as_ref()))));
            if let Err(e) = &result {
                tracing::warn!("segment {} failed: {}", index, e);
            }

            if result_tx.send(SegmentOutcome { index, result }).is_err() {
                tracing::warn!("segment worker {}: collector disconnected", worker_id);
                break;
            }
        }

        tracing::debug!("segment worker {} stopped", worker_id);
    }

    fn convert_segment(&self, segment: &TextSegment) -> Result<AudioBuffer, SegmentError> {
        let bytes = self.synthesizer.synthesize(&segment.text, self.voice)?;
        let path = self.parts.write(segment.index, &bytes)?;
        let buffer = audio::decode(&bytes, extension_of(&path))?;
        Ok(buffer)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn extension_of(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}
