use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::EnvFilter;

use vesper_voice::audio::{AudioFrame, CaptureSource, MicSource, PlaybackSink, SpeakerSink};
use vesper_voice::memory::{JsonlSink, MemorySink};
use vesper_voice::tools::LocalTimeTool;
use vesper_voice::{
    Command as SessionCommand, Config, EchoConnector, SessionController, SessionRegistry,
    ToolRegistry,
};

/// Vesper - hands-free voice assistant session daemon
#[derive(Parser)]
#[command(name = "vesper", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Start idle instead of activating a session immediately
    #[arg(long)]
    idle: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Save the recording as a WAV file
        #[arg(short, long)]
        save: Option<std::path::PathBuf>,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,vesper_voice=info",
        1 => "info,vesper_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration, save } => test_mic(duration, save).await,
            Command::TestSpeaker => test_speaker().await,
        };
    }

    let config = Config::load()?;
    tracing::info!(
        voice = %config.voice,
        data_dir = %config.data_dir.display(),
        "starting vesper daemon"
    );

    let registry = Arc::new(SessionRegistry::new());
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(LocalTimeTool));

    let capture = Arc::new(MicSource::new(config.audio.input_sample_rate));
    let playback = Arc::new(SpeakerSink::new(config.audio.output_sample_rate));
    let memory: Arc<dyn MemorySink> = Arc::new(JsonlSink::new(&config.data_dir));

    let (controller, handle) = SessionController::new(
        config,
        Arc::new(EchoConnector),
        registry,
        Arc::new(tools),
        capture,
        playback,
        memory,
    );
    let controller_task = tokio::spawn(controller.run());

    if !cli.idle {
        handle.send(SessionCommand::Activate).await?;
    }

    tracing::info!("vesper ready - commands: activate, interrupt, stop, shutdown");

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt signal, shutting down");
                let _ = handle.send(SessionCommand::Shutdown).await;
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    let _ = handle.send(SessionCommand::Shutdown).await;
                    break;
                };
                match line.trim().to_lowercase().as_str() {
                    "" => {}
                    "activate" | "start" => handle.send(SessionCommand::Activate).await?,
                    "interrupt" => handle.send(SessionCommand::Interrupt).await?,
                    "stop" => handle.send(SessionCommand::Stop).await?,
                    "shutdown" | "quit" | "exit" => {
                        handle.send(SessionCommand::Shutdown).await?;
                        break;
                    }
                    "state" => println!("{}", handle.state()),
                    other => println!("unknown command: {other}"),
                }
            }
        }
    }

    controller_task.await?;
    Ok(())
}

/// Test microphone input
async fn test_mic(duration: u64, save: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let capture = MicSource::new(16_000);
    capture.start()?;
    println!("Sample rate: 16000 Hz");
    println!("---");

    let mut recording: Vec<i16> = Vec::new();

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = capture.take_samples();
        if save.is_some() {
            recording.extend_from_slice(&samples);
        }
        let frame = AudioFrame::new(samples, 16_000);
        let energy = frame.rms();
        let peak = frame
            .samples()
            .iter()
            .map(|s| f32::from(s.saturating_abs()) / 32768.0)
            .fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    capture.stop();

    if let Some(path) = save {
        let wav = vesper_voice::audio::frame::samples_to_wav(&recording, 16_000)?;
        std::fs::write(&path, wav)?;
        println!("\nSaved recording to {}", path.display());
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = 24_000_u32;
    let frequency = 440.0_f32;
    let duration_secs = 2.0_f32;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let num_samples = (sample_rate as f32 * duration_secs) as usize;

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let samples: Vec<i16> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            let value = (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3; // 30% volume
            (value * 32767.0) as i16
        })
        .collect();

    let playback = SpeakerSink::new(sample_rate);
    playback.start()?;
    println!("Playing {} samples at {} Hz...", samples.len(), sample_rate);
    playback.write(&samples);

    while playback.pending() > 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    playback.stop();

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}
