// End-to-end tests for the conversion job: ordering, placeholders, cleanup and single-flight
//
// The fake synthesizer reads instructions from the segment text:
//   "tone:<value>:<ms>:<delay_ms>"  -> <ms> of constant <value>, returned after <delay_ms>
//   "fail"                          -> an HTTP 500 error
//   "garbage"                       -> bytes that are not audio
//   "panic"                         -> the backend panics
//   anything else                   -> one ms of audio per character

use std::cell::RefCell;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tts_batch::audio::{self, OutputFormat};
use tts_batch::config::Settings;
use tts_batch::conversion::{
    ConversionObserver, ConversionWarning, ConvertError, Converter, JobState, NoopObserver,
};
use tts_batch::synthesis::{SynthesisError, Synthesizer};
use tts_batch::voice::Voice;

const RATE: u32 = 8000;

struct FakeSynthesizer;

impl FakeSynthesizer {
    fn wav(value: i16, duration_ms: u64) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let frames = RATE as u64 * duration_ms / 1000;
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..frames {
                writer.write_sample(value).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }
}

impl Synthesizer for FakeSynthesizer {
    fn synthesize(&self, text: &str, _voice: Voice) -> Result<Vec<u8>, SynthesisError> {
        match text {
            "fail" => return Err(SynthesisError::Status(500)),
            "garbage" => return Ok(b"<html>502 Bad Gateway</html>".to_vec()),
            "panic" => panic!("backend crashed on segment text"),
            _ => {}
        }

        if let Some(spec) = text.strip_prefix("tone:") {
            let fields: Vec<u64> = spec.split(':').map(|f| f.parse().unwrap()).collect();
            thread::sleep(Duration::from_millis(fields[2]));
            return Ok(Self::wav(fields[0] as i16, fields[1]));
        }

        let chars = text.chars().count() as u64;
        Ok(Self::wav(1, chars))
    }

    fn file_extension(&self) -> &str {
        "wav"
    }
}

#[derive(Default)]
struct RecordingObserver {
    finished: RefCell<Vec<usize>>,
    states: RefCell<Vec<JobState>>,
    warnings: RefCell<Vec<ConversionWarning>>,
}

impl ConversionObserver for RecordingObserver {
    fn on_state_changed(&self, state: JobState) {
        self.states.borrow_mut().push(state);
    }

    fn on_segment_finished(&self, index: usize, _total: usize, _ok: bool) {
        self.finished.borrow_mut().push(index);
    }

    fn on_warning(&self, warning: &ConversionWarning) {
        self.warnings.borrow_mut().push(warning.clone());
    }
}

fn settings_in(dir: &Path, workers: usize, keep_parts: bool) -> Settings {
    Settings {
        save_path: dir.to_path_buf(),
        max_workers: workers,
        keep_parts,
        output_format: OutputFormat::Wav,
        ..Settings::default()
    }
}

fn tone(value: i16, ms: u64, delay_ms: u64) -> String {
    format!("tone:{}:{}:{}", value, ms, delay_ms)
}

fn read_wav(path: &Path) -> Vec<i16> {
    let reader = hound::WavReader::open(path).unwrap();
    assert_eq!(reader.spec().sample_rate, RATE);
    reader.into_samples::<i16>().map(|s| s.unwrap()).collect()
}

fn files_in(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir).unwrap().flatten().map(|e| e.path()).collect();
    files.sort();
    files
}

fn wav_files(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("wav"))
        .collect()
}

#[test]
fn test_assembles_in_index_order_despite_completion_order() {
    let dir = tempfile::tempdir().unwrap();
    let converter = Converter::new(settings_in(dir.path(), 4, false), Box::new(FakeSynthesizer));
    let observer = RecordingObserver::default();

    // Later segments return first
    let segments: Vec<String> = (0..4)
        .map(|i| tone(10 * (i as i16 + 1), 100, (4 - i) * 60))
        .collect();

    let report = converter.convert_segments(segments, &observer).unwrap();

    let finished = observer.finished.borrow().clone();
    assert_eq!(finished.len(), 4);
    assert_ne!(finished, vec![0, 1, 2, 3], "fake delays should reorder completion");

    let samples = read_wav(&report.output_path);
    assert_eq!(samples.len(), 4 * 800);
    for (i, chunk) in samples.chunks(800).enumerate() {
        let expected = 10 * (i as i16 + 1);
        assert!(chunk.iter().all(|&s| s == expected), "segment {} out of place", i);
    }

    assert_eq!(report.state, JobState::Completed);
    assert!(report.warnings.is_empty());
    assert_eq!(report.duration_ms, 400);
}

#[test]
fn test_failed_first_segment_becomes_one_second_of_silence() {
    let dir = tempfile::tempdir().unwrap();
    let converter = Converter::new(settings_in(dir.path(), 2, false), Box::new(FakeSynthesizer));
    let observer = RecordingObserver::default();

    let report = converter
        .convert_segments(vec!["fail".to_string(), tone(1000, 500, 0)], &observer)
        .unwrap();

    let samples = read_wav(&report.output_path);
    assert_eq!(samples.len(), 8000 + 4000);
    assert!(samples[..8000].iter().all(|&s| s == 0));
    assert!(samples[8000..].iter().all(|&s| s == 1000));

    assert_eq!(report.failed_segments, vec![0]);
    assert_eq!(report.warnings.len(), 1);
    assert!(matches!(report.warnings[0], ConversionWarning::SegmentFailed { index: 0, .. }));
    assert_eq!(observer.warnings.borrow().len(), 1);
    assert_eq!(report.state, JobState::CompletedWithWarnings);
    assert_eq!(converter.state(), JobState::CompletedWithWarnings);
}

#[test]
fn test_middle_failure_keeps_every_slot() {
    let dir = tempfile::tempdir().unwrap();
    let converter = Converter::new(settings_in(dir.path(), 3, false), Box::new(FakeSynthesizer));

    let report = converter
        .convert_segments(vec![tone(5, 200, 0), "fail".to_string(), tone(7, 300, 0)], &NoopObserver)
        .unwrap();

    assert_eq!(report.segment_count, 3);
    assert_eq!(report.duration_ms, 200 + 1000 + 300);

    let samples = read_wav(&report.output_path);
    assert!(samples[..1600].iter().all(|&s| s == 5));
    assert!(samples[1600..9600].iter().all(|&s| s == 0));
    assert!(samples[9600..].iter().all(|&s| s == 7));
}

#[test]
fn test_all_segments_failed_writes_no_output() {
    let dir = tempfile::tempdir().unwrap();
    let converter = Converter::new(settings_in(dir.path(), 2, false), Box::new(FakeSynthesizer));
    let observer = RecordingObserver::default();

    let result = converter.convert_segments(vec!["fail".to_string(), "fail".to_string()], &observer);

    match result {
        Err(ConvertError::AllSegmentsFailed { segments, warnings }) => {
            assert_eq!(segments, 2);
            assert_eq!(warnings.len(), 2);
        }
        other => panic!("Expected AllSegmentsFailed, got {:?}", other),
    }
    assert!(wav_files(dir.path()).is_empty());
    assert_eq!(converter.state(), JobState::Idle);
    assert_eq!(observer.states.borrow().last(), Some(&JobState::Idle));
}

#[test]
fn test_part_files_deleted_after_assembly() {
    let dir = tempfile::tempdir().unwrap();
    let converter = Converter::new(settings_in(dir.path(), 2, false), Box::new(FakeSynthesizer));

    let report = converter
        .convert_segments(vec![tone(1, 50, 0), tone(2, 50, 0), tone(3, 50, 0)], &NoopObserver)
        .unwrap();

    assert_eq!(report.part_files.len(), 3);
    assert!(report.part_files.iter().all(|p| !p.exists()));
    assert!(report.output_path.exists());
}

#[test]
fn test_part_files_kept_when_requested() {
    let dir = tempfile::tempdir().unwrap();
    let converter = Converter::new(settings_in(dir.path(), 2, true), Box::new(FakeSynthesizer));

    let report = converter
        .convert_segments(vec![tone(1, 50, 0), tone(2, 50, 0)], &NoopObserver)
        .unwrap();

    assert_eq!(report.part_files.len(), 2);
    assert!(report.part_files.iter().all(|p| p.exists()));
    // Part files share the output's timestamp and carry their index
    let stem = report.output_path.file_stem().unwrap().to_str().unwrap().to_string();
    assert!(stem.starts_with("output_"));
    assert!(report.part_files.contains(&dir.path().join(format!("{}_0.wav", stem))));
    assert!(report.part_files.contains(&dir.path().join(format!("{}_1.wav", stem))));
}

#[test]
fn test_state_walks_through_job_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let converter = Converter::new(settings_in(dir.path(), 1, false), Box::new(FakeSynthesizer));
    let observer = RecordingObserver::default();

    assert_eq!(converter.state(), JobState::Idle);
    converter.convert_segments(vec![tone(1, 20, 0)], &observer).unwrap();

    assert_eq!(
        *observer.states.borrow(),
        vec![
            JobState::Dispatching,
            JobState::AwaitingAll,
            JobState::Assembling,
            JobState::Completed,
        ]
    );
}

#[test]
fn test_second_conversion_rejected_while_busy() {
    let dir = tempfile::tempdir().unwrap();
    let converter = Converter::new(settings_in(dir.path(), 1, false), Box::new(FakeSynthesizer));

    thread::scope(|scope| {
        let first = scope.spawn(|| converter.convert_segments(vec![tone(1, 50, 500)], &NoopObserver));

        let start = Instant::now();
        while !converter.state().is_active() {
            assert!(start.elapsed() < Duration::from_secs(5), "first job never started");
            thread::sleep(Duration::from_millis(5));
        }

        let second = converter.convert_segments(vec![tone(2, 50, 0)], &NoopObserver);
        assert!(matches!(second, Err(ConvertError::Busy)));

        assert!(first.join().unwrap().is_ok());
    });

    assert_eq!(converter.state(), JobState::Completed);
}

#[test]
fn test_blank_text_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let converter = Converter::new(settings_in(dir.path(), 1, false), Box::new(FakeSynthesizer));

    assert!(matches!(converter.convert("", &NoopObserver), Err(ConvertError::EmptyText)));
    assert!(matches!(converter.convert(" \n\t", &NoopObserver), Err(ConvertError::EmptyText)));
    assert_eq!(converter.state(), JobState::Idle);
}

#[test]
fn test_long_text_is_split_before_conversion() {
    let dir = tempfile::tempdir().unwrap();
    let converter = Converter::new(settings_in(dir.path(), 3, false), Box::new(FakeSynthesizer));

    let paragraph = format!("{}\n", "x".repeat(499));
    let text = paragraph.repeat(18);
    assert_eq!(text.chars().count(), 9000);

    let report = converter.convert(&text, &NoopObserver).unwrap();

    assert_eq!(report.segment_count, 3);
    // Fake audio is one ms per character: 3999 + 3999 + 1000
    assert_eq!(report.duration_ms, 8998);
}

#[test]
fn test_panicking_segment_becomes_silence() {
    let dir = tempfile::tempdir().unwrap();
    let converter = Converter::new(settings_in(dir.path(), 2, false), Box::new(FakeSynthesizer));
    let observer = RecordingObserver::default();

    let report = converter
        .convert_segments(vec![tone(9, 250, 0), "panic".to_string()], &observer)
        .unwrap();

    let samples = read_wav(&report.output_path);
    assert_eq!(samples.len(), 2000 + 8000);
    assert!(samples[..2000].iter().all(|&s| s == 9));
    assert!(samples[2000..].iter().all(|&s| s == 0));

    assert_eq!(report.failed_segments, vec![1]);
    match &report.warnings[..] {
        [ConversionWarning::SegmentFailed { index: 1, reason }] => assert!(reason.contains("panicked")),
        other => panic!("Expected one SegmentFailed warning, got {:?}", other),
    }
    assert_eq!(converter.state(), JobState::CompletedWithWarnings);
    // Only the assembled file is left behind
    assert_eq!(files_in(dir.path()), vec![report.output_path.clone()]);
}

#[test]
fn test_undecodable_response_becomes_silence() {
    let dir = tempfile::tempdir().unwrap();
    let converter = Converter::new(settings_in(dir.path(), 2, false), Box::new(FakeSynthesizer));

    let report = converter
        .convert_segments(vec!["garbage".to_string(), tone(4, 100, 0)], &NoopObserver)
        .unwrap();

    let samples = read_wav(&report.output_path);
    assert_eq!(samples.len(), 8000 + 800);
    assert!(samples[..8000].iter().all(|&s| s == 0));
    assert!(samples[8000..].iter().all(|&s| s == 4));

    assert_eq!(report.failed_segments, vec![0]);
    assert!(matches!(report.warnings[..], [ConversionWarning::SegmentFailed { index: 0, .. }]));
    assert_eq!(report.state, JobState::CompletedWithWarnings);
}

/// Deletes each part file as soon as its segment reports back, so cleanup finds nothing
struct PartFileThief {
    dir: PathBuf,
}

impl ConversionObserver for PartFileThief {
    fn on_segment_finished(&self, index: usize, _total: usize, _ok: bool) {
        let suffix = format!("_{}.wav", index);
        for path in files_in(&self.dir) {
            let name = path.file_name().unwrap().to_str().unwrap().to_string();
            if name.starts_with("output_") && name.ends_with(&suffix) {
                fs::remove_file(&path).unwrap();
            }
        }
    }
}

#[test]
fn test_undeletable_part_file_is_a_warning() {
    let dir = tempfile::tempdir().unwrap();
    let converter = Converter::new(settings_in(dir.path(), 1, false), Box::new(FakeSynthesizer));
    let observer = PartFileThief { dir: dir.path().to_path_buf() };

    let report = converter
        .convert_segments(vec![tone(3, 100, 0), tone(6, 100, 0)], &observer)
        .unwrap();

    assert!(report.failed_segments.is_empty());
    assert_eq!(report.warnings.len(), 2);
    assert!(report
        .warnings
        .iter()
        .all(|w| matches!(w, ConversionWarning::PartFileNotDeleted { .. })));
    assert_eq!(report.state, JobState::CompletedWithWarnings);
    assert_eq!(converter.state(), JobState::CompletedWithWarnings);
    assert_eq!(read_wav(&report.output_path).len(), 1600);
}

#[test]
fn test_blank_segments_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let converter = Converter::new(settings_in(dir.path(), 2, false), Box::new(FakeSynthesizer));

    let report = converter
        .convert_segments(vec![String::new(), tone(2, 100, 0), " \n ".to_string()], &NoopObserver)
        .unwrap();

    assert_eq!(report.segment_count, 1);
    assert!(report.warnings.is_empty());
    assert_eq!(report.state, JobState::Completed);
    assert_eq!(report.duration_ms, 100);
}

#[test]
fn test_back_to_back_jobs_do_not_overwrite_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let converter = Converter::new(settings_in(dir.path(), 1, true), Box::new(FakeSynthesizer));

    let first = converter.convert_segments(vec![tone(1, 50, 0)], &NoopObserver).unwrap();
    let second = converter.convert_segments(vec![tone(2, 50, 0)], &NoopObserver).unwrap();

    assert_ne!(first.output_path, second.output_path);
    assert_ne!(first.part_files, second.part_files);
    assert!(read_wav(&first.output_path).iter().all(|&s| s == 1));
    assert!(read_wav(&second.output_path).iter().all(|&s| s == 2));
    assert!(first.part_files.iter().chain(&second.part_files).all(|p| p.exists()));
}

#[test]
fn test_default_output_is_mp3() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        output_format: OutputFormat::default(),
        ..settings_in(dir.path(), 2, false)
    };
    let converter = Converter::new(settings, Box::new(FakeSynthesizer));

    let report = converter
        .convert_segments(vec![tone(500, 300, 0), tone(-500, 300, 0)], &NoopObserver)
        .unwrap();

    assert_eq!(report.output_path.extension().and_then(|e| e.to_str()), Some("mp3"));
    assert_eq!(report.duration_ms, 600);

    let decoded = audio::decode(&fs::read(&report.output_path).unwrap(), Some("mp3")).unwrap();
    assert_eq!(decoded.sample_rate, 44_100);
    assert!(decoded.duration_ms() >= 600);
    assert_eq!(files_in(dir.path()), vec![report.output_path.clone()]);
}
