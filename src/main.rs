use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use std::cell::Cell;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use tts_batch::config::Settings;
use tts_batch::constants::api::API_KEY_ENV;
use tts_batch::conversion::{ConversionObserver, ConversionWarning, Converter, JobState};
use tts_batch::estimate::TextStats;
use tts_batch::playback;
use tts_batch::synthesis::OpenAiSynthesizer;
use tts_batch::voice::Voice;

#[derive(Parser)]
#[command(name = "tts-batch")]
#[command(about = "Convert long text into a single speech audio file", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert text to speech (the default when no command is given)
    Convert(ConvertArgs),
    /// Show word count, character count and estimated price of a text
    Estimate {
        /// Text file to read; "-" or nothing reads stdin
        input: Option<PathBuf>,
    },
    /// Show or change settings in ~/.tts-batch/settings.yaml
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// List available voices
    Voices,
    /// Open an audio file with the default player
    Play {
        file: PathBuf,
    },
}

#[derive(Args, Default)]
struct ConvertArgs {
    /// Text file to convert; "-" or nothing reads stdin
    input: Option<PathBuf>,
    /// Voice to use instead of the configured one
    #[arg(short, long)]
    voice: Option<Voice>,
    /// Directory for the output and part files instead of the configured one
    #[arg(short, long)]
    output_dir: Option<PathBuf>,
    /// Keep the per-segment part files
    #[arg(long)]
    keep_parts: bool,
    /// Open the result with the default player when done
    #[arg(long)]
    play: bool,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the current settings
    Show,
    /// Print the settings file location
    Path,
    /// Change one setting, e.g. `config set voice nova`
    Set {
        key: String,
        value: String,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Convert(args)) => convert_command(args),
        Some(Commands::Estimate { input }) => estimate_command(input.as_deref()),
        Some(Commands::Config { action }) => config_command(action),
        Some(Commands::Voices) => voices_command(),
        Some(Commands::Play { file }) => playback::open_with_default_player(&file),
        None => convert_command(ConvertArgs::default()),
    }
}

fn init_tracing() {
    // Library diagnostics go to stderr; RUST_LOG=tts_batch=debug shows per-segment detail
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

/// Prints job progress to the terminal
#[derive(Default)]
struct ConsoleObserver {
    finished: Cell<usize>,
}

impl ConversionObserver for ConsoleObserver {
    fn on_state_changed(&self, state: JobState) {
        match state {
            JobState::Dispatching => println!("🚀 Sending segments to the speech API..."),
            JobState::AwaitingAll => println!("⏳ All segments queued, waiting for results..."),
            JobState::Assembling => println!("🧩 Assembling audio..."),
            JobState::Idle => println!("⏹️  Conversion aborted"),
            JobState::Completed | JobState::CompletedWithWarnings => {}
        }
    }

    fn on_segment_finished(&self, index: usize, total: usize, ok: bool) {
        let finished = self.finished.get() + 1;
        self.finished.set(finished);
        if ok {
            println!("   ✓ Segment {} done ({}/{})", index, finished, total);
        } else {
            println!("   ✗ Segment {} failed ({}/{})", index, finished, total);
        }
    }

    fn on_warning(&self, warning: &ConversionWarning) {
        eprintln!("⚠️  {}", warning);
    }
}

fn convert_command(args: ConvertArgs) -> Result<()> {
    let mut settings = Settings::load()?;
    if let Some(voice) = args.voice {
        settings.voice = voice;
    }
    if let Some(dir) = args.output_dir {
        settings.save_path = dir;
    }
    if args.keep_parts {
        settings.keep_parts = true;
    }

    let text = read_input(args.input.as_deref())?;
    println!("📝 {}", TextStats::from_text(&text, settings.price_per_thousand_chars));

    if settings.resolved_api_key().is_none() {
        bail!(
            "No API key configured. Run `tts-batch config set api_key <KEY>` or set {}",
            API_KEY_ENV
        );
    }

    let synthesizer = OpenAiSynthesizer::from_settings(&settings);
    let converter = Converter::new(settings, Box::new(synthesizer));
    let observer = ConsoleObserver::default();

    let report = converter.convert(&text, &observer)?;

    println!();
    println!(
        "✓ Saved {} ({:.1}s, {} segments)",
        report.output_path.display(),
        report.duration_ms as f64 / 1000.0,
        report.segment_count
    );
    if !report.failed_segments.is_empty() {
        eprintln!(
            "⚠️  {} of {} segments were replaced by silence",
            report.failed_segments.len(),
            report.segment_count
        );
    }
    if converter.settings().keep_parts {
        println!("💾 Kept {} part files in {}", report.part_files.len(), converter.settings().save_path.display());
    }

    if args.play {
        playback::open_with_default_player(&report.output_path)?;
    }

    Ok(())
}

fn estimate_command(input: Option<&Path>) -> Result<()> {
    let settings = Settings::load()?;
    let text = read_input(input)?;
    println!("{}", TextStats::from_text(&text, settings.price_per_thousand_chars));
    Ok(())
}

fn config_command(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let mut settings = Settings::load()?;
            settings.api_key = mask_api_key(&settings.api_key);
            let yaml = serde_yaml::to_string(&settings).context("Failed to serialize settings")?;
            print!("{}", yaml);
        }
        ConfigAction::Path => {
            println!("{}", Settings::config_path()?.display());
        }
        ConfigAction::Set { key, value } => {
            let mut settings = Settings::load()?;
            settings.set_field(&key, &value)?;
            settings.save()?;
            println!("✓ Updated {} in {}", key, Settings::config_path()?.display());
        }
    }
    Ok(())
}

fn voices_command() -> Result<()> {
    let settings = Settings::load()?;
    println!("Available voices:");
    for voice in Voice::ALL {
        let marker = if voice == settings.voice { "→" } else { " " };
        println!("  {} {}", marker, voice);
    }
    Ok(())
}

fn read_input(input: Option<&Path>) -> Result<String> {
    match input {
        Some(path) if path != Path::new("-") => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display())),
        _ => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("Failed to read text from stdin")?;
            Ok(text)
        }
    }
}

fn mask_api_key(key: &str) -> String {
    if key.is_empty() {
        return String::new();
    }
    let visible: String = key.chars().take(3).collect();
    format!("{}****", visible)
}
