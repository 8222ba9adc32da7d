/// Conversion job state machine: dispatch, await, assemble, clean up
///
/// A `Converter` owns the settings and the speech backend and runs at most one
/// job at a time. Each job splits its segments across a bounded worker pool,
/// waits for every worker, then concatenates the per-segment audio strictly in
/// original order. Failed segments become one second of silence so the output
/// always has one slot per segment.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use crate::audio::{self, AudioBuffer, AudioError};
use crate::config::Settings;
use crate::constants::audio::{DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE, PLACEHOLDER_SILENCE_MS};
use crate::constants::segmenting::MAX_SEGMENT_LENGTH;
use crate::segment_worker::{PartFiles, SegmentError, SegmentPool};
use crate::segmenter::{self, TextSegment};
use crate::synthesis::Synthesizer;

/// Lifecycle of a conversion job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// No job has run, or the last one was aborted
    Idle,
    /// Segments are being queued for the workers
    Dispatching,
    /// Everything is queued; waiting for the workers to finish
    AwaitingAll,
    /// Concatenating and exporting the final file
    Assembling,
    Completed,
    CompletedWithWarnings,
}

impl JobState {
    /// True while a job holds the converter
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Dispatching | JobState::AwaitingAll | JobState::Assembling)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Idle => "idle",
            JobState::Dispatching => "dispatching",
            JobState::AwaitingAll => "awaiting all segments",
            JobState::Assembling => "assembling",
            JobState::Completed => "completed",
            JobState::CompletedWithWarnings => "completed with warnings",
        };
        f.write_str(name)
    }
}

/// Non-fatal problems reported during a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionWarning {
    /// The segment was replaced by silence
    SegmentFailed { index: usize, reason: String },
    PartFileNotDeleted { path: PathBuf, reason: String },
}

impl fmt::Display for ConversionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionWarning::SegmentFailed { index, reason } => {
                write!(f, "segment {} could not be converted and was replaced by silence: {}", index, reason)
            }
            ConversionWarning::PartFileNotDeleted { path, reason } => {
                write!(f, "could not delete part file {}: {}", path.display(), reason)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("a conversion is already in progress")]
    Busy,
    #[error("there is no text to convert")]
    EmptyText,
    #[error("none of the {segments} segments could be converted")]
    AllSegmentsFailed {
        segments: usize,
        warnings: Vec<ConversionWarning>,
    },
    #[error("cannot use output directory {}: {}", path.display(), source)]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {}: {}", path.display(), source)]
    Export {
        path: PathBuf,
        #[source]
        source: AudioError,
    },
}

/// Progress callbacks, all invoked on the thread that called `convert`
pub trait ConversionObserver {
    fn on_state_changed(&self, _state: JobState) {}

    /// A segment finished, successfully or not; calls arrive in completion order
    fn on_segment_finished(&self, _index: usize, _total: usize, _ok: bool) {}

    fn on_warning(&self, _warning: &ConversionWarning) {}
}

/// Observer that ignores everything
pub struct NoopObserver;

impl ConversionObserver for NoopObserver {}

/// Summary of a finished job
#[derive(Debug, Clone)]
pub struct ConversionReport {
    pub output_path: PathBuf,
    pub segment_count: usize,
    /// Indices of segments replaced by silence, ascending
    pub failed_segments: Vec<usize>,
    pub warnings: Vec<ConversionWarning>,
    /// Every part file written during the job, whether or not it was kept
    pub part_files: Vec<PathBuf>,
    pub duration_ms: u64,
    pub state: JobState,
}

/// Runs conversion jobs, one at a time
pub struct Converter {
    settings: Settings,
    synthesizer: Box<dyn Synthesizer>,
    state: Mutex<JobState>,
}

impl Converter {
    pub fn new(settings: Settings, synthesizer: Box<dyn Synthesizer>) -> Self {
        Converter {
            settings,
            synthesizer,
            state: Mutex::new(JobState::Idle),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self) -> JobState {
        *self.lock_state()
    }

    /// Split `text` into API-sized segments and convert them into one audio file
    pub fn convert(
        &self,
        text: &str,
        observer: &dyn ConversionObserver,
    ) -> Result<ConversionReport, ConvertError> {
        if text.trim().is_empty() {
            return Err(ConvertError::EmptyText);
        }

        self.convert_segments(segmenter::split(text, MAX_SEGMENT_LENGTH), observer)
    }

    /// Convert already-split segments into one audio file, in the order given
    pub fn convert_segments(
        &self,
        segments: Vec<String>,
        observer: &dyn ConversionObserver,
    ) -> Result<ConversionReport, ConvertError> {
        // Blank segments would only buy an empty request and a placeholder
        let segments: Vec<String> = segments
            .into_iter()
            .filter(|s| !s.trim().is_empty())
            .collect();
        if segments.is_empty() {
            return Err(ConvertError::EmptyText);
        }

        let job = JobGuard::begin(&self.state, observer)?;
        let total = segments.len();
        let save_path = self.settings.save_path.clone();

        fs::create_dir_all(&save_path).map_err(|source| ConvertError::OutputDir {
            path: save_path.clone(),
            source,
        })?;

        let output_format = self.settings.output_format;
        let part_extension = self.synthesizer.file_extension();
        let base = format!("output_{}", chrono::Local::now().format("%Y%m%d_%H%M%S"));
        let stem = unique_stem(&save_path, &base, output_format.extension(), part_extension);
        let parts = PartFiles::new(&save_path, stem.as_str(), part_extension);
        tracing::info!("converting {} segments with voice {}", total, self.settings.voice);

        // One slot per segment; None means the worker never reported back
        let mut slots: Vec<Option<Result<AudioBuffer, SegmentError>>> =
            (0..total).map(|_| None).collect();

        let tasks: Vec<TextSegment> = segments
            .into_iter()
            .enumerate()
            .map(|(index, text)| TextSegment { index, text })
            .collect();

        let pool = SegmentPool::new(
            self.synthesizer.as_ref(),
            self.settings.voice,
            &parts,
            self.settings.max_workers,
        );
        pool.run(
            tasks,
            || job.advance(JobState::AwaitingAll),
            |outcome| {
                observer.on_segment_finished(outcome.index, total, outcome.result.is_ok());
                if let Some(slot) = slots.get_mut(outcome.index) {
                    *slot = Some(outcome.result);
                }
            },
        );

        job.advance(JobState::Assembling);

        let mut warnings = Vec::new();
        let mut failed_segments = Vec::new();
        let mut buffers: Vec<Option<AudioBuffer>> = Vec::with_capacity(total);

        for (index, slot) in slots.into_iter().enumerate() {
            match slot {
                Some(Ok(buffer)) => buffers.push(Some(buffer)),
                Some(Err(e)) => {
                    failed_segments.push(index);
                    warnings.push(ConversionWarning::SegmentFailed { index, reason: e.to_string() });
                    buffers.push(None);
                }
                None => {
                    failed_segments.push(index);
                    warnings.push(ConversionWarning::SegmentFailed {
                        index,
                        reason: "worker exited without a result".to_string(),
                    });
                    buffers.push(None);
                }
            }
        }

        // Placeholders take the format of the first segment that did convert
        let Some((sample_rate, channels)) = buffers
            .iter()
            .flatten()
            .next()
            .map(|b| (b.sample_rate, b.channels))
        else {
            if !self.settings.keep_parts {
                warnings.extend(remove_part_files(&parts));
            }
            for warning in &warnings {
                observer.on_warning(warning);
            }
            tracing::warn!("all {} segments failed, no output written", total);
            return Err(ConvertError::AllSegmentsFailed { segments: total, warnings });
        };

        let ordered: Vec<AudioBuffer> = buffers
            .into_iter()
            .map(|b| b.unwrap_or_else(|| AudioBuffer::silent(PLACEHOLDER_SILENCE_MS, sample_rate, channels)))
            .collect();

        let output = audio::concat(&ordered).unwrap_or_else(|| {
            AudioBuffer::silent(0, DEFAULT_SAMPLE_RATE, DEFAULT_CHANNELS)
        });

        let output_path = save_path.join(format!("{}.{}", stem, output_format.extension()));
        output.export(&output_path, output_format).map_err(|source| ConvertError::Export {
            path: output_path.clone(),
            source,
        })?;
        tracing::info!("wrote {} ({} ms)", output_path.display(), output.duration_ms());

        let part_files = parts.recorded();
        if !self.settings.keep_parts {
            warnings.extend(remove_part_files(&parts));
        }

        for warning in &warnings {
            observer.on_warning(warning);
        }

        let state = if warnings.is_empty() {
            JobState::Completed
        } else {
            JobState::CompletedWithWarnings
        };
        job.finish(state);

        Ok(ConversionReport {
            output_path,
            segment_count: total,
            failed_segments,
            warnings,
            part_files,
            duration_ms: output.duration_ms(),
            state,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// `base`, or `base-2`, `base-3`, ... when an earlier job in `dir` already used the name
fn unique_stem(dir: &Path, base: &str, output_extension: &str, part_extension: &str) -> String {
    let taken = |stem: &str| {
        dir.join(format!("{}.{}", stem, output_extension)).exists()
            || dir.join(format!("{}_0.{}", stem, part_extension)).exists()
    };

    if !taken(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}-{}", base, n))
        .find(|stem| !taken(stem))
        .unwrap_or_else(|| base.to_string())
}

fn remove_part_files(parts: &PartFiles) -> Vec<ConversionWarning> {
    parts
        .remove_all()
        .into_iter()
        .map(|(path, e)| ConversionWarning::PartFileNotDeleted { path, reason: e.to_string() })
        .collect()
}

/// Holds the converter's single job slot; returns it to `Idle` if the job ends early
struct JobGuard<'a> {
    state: &'a Mutex<JobState>,
    observer: &'a dyn ConversionObserver,
}

impl<'a> JobGuard<'a> {
    fn begin(
        state: &'a Mutex<JobState>,
        observer: &'a dyn ConversionObserver,
    ) -> Result<Self, ConvertError> {
        {
            let mut current = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if current.is_active() {
                return Err(ConvertError::Busy);
            }
            *current = JobState::Dispatching;
        }
        observer.on_state_changed(JobState::Dispatching);

        Ok(JobGuard { state, observer })
    }

    fn advance(&self, next: JobState) {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
        self.observer.on_state_changed(next);
    }

    fn finish(self, terminal: JobState) {
        self.advance(terminal);
    }
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        let aborted = {
            let mut current = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let aborted = current.is_active();
            if aborted {
                *current = JobState::Idle;
            }
            aborted
        };
        if aborted {
            self.observer.on_state_changed(JobState::Idle);
        }
    }
}
