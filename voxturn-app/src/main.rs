//! voxturn headless host.
//!
//! Wires the engine to real collaborators (cpal or WAV audio, offline or HTTP
//! services, SQLite history) and runs one call from the terminal. Call events
//! are printed to stdout as JSON lines; logs go to stderr.

mod settings;
mod storage;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use settings::{default_settings_path, load_settings, save_settings, AppSettings, ServiceBackend};
use storage::SqliteStore;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use voxturn_core::{
    audio::{device, CpalPlayer, WavFrameSource, WavPlayer},
    services::{
        EchoInference, OllamaInference, OpenAiSynthesizer, OpenAiTranscriber, StubTranscriber,
        ToneSynthesizer,
    },
    AudioDeviceProvider, CallEngine, CallEventKind, Collaborators, ConversationStore,
    CpalDeviceProvider, FactoryDeviceProvider, FrameSource, InferenceService, MemoryStore, Player,
    SynthesisService, TranscriptionService,
};

#[derive(Debug, Parser)]
#[command(name = "voxturn", version, about = "Turn-based voice dialogue from the terminal")]
struct Cli {
    /// Settings file. Defaults to the per-user data directory.
    #[arg(long, global = true, env = "VOXTURN_SETTINGS")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one call until hangup, device loss or Ctrl-C.
    Call(CallArgs),
    /// List audio input and output devices.
    Devices,
    /// List recent calls from the conversation store.
    Sessions {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Print the turns of one stored call.
    Show {
        /// Session id or a unique prefix of one.
        id: String,
    },
    /// Print the effective settings; `--write` saves them to the settings file.
    Settings {
        #[arg(long)]
        write: bool,
    },
}

#[derive(Debug, Args)]
struct CallArgs {
    /// Persona key from the settings file.
    #[arg(long)]
    persona: Option<String>,
    /// Synthesis voice id.
    #[arg(long)]
    voice: Option<String>,
    /// Read the caller from a WAV file instead of the microphone.
    #[arg(long, value_name = "FILE")]
    input_wav: Option<PathBuf>,
    /// Write replies as WAV files into this directory instead of playing them.
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,
    /// Override the configured service backend.
    #[arg(long, value_enum)]
    services: Option<BackendArg>,
    /// Keep history in memory only.
    #[arg(long)]
    no_store: bool,
    /// Do not print call events.
    #[arg(long)]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Stub,
    Http,
}

impl From<BackendArg> for ServiceBackend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Stub => ServiceBackend::Stub,
            BackendArg::Http => ServiceBackend::Http,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("voxturn=info")),
        )
        .init();

    let cli = Cli::parse();
    let settings_path = cli.settings.clone().unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&settings_path);
    settings.apply_env_overrides();
    settings.normalize();

    match cli.command {
        Command::Call(args) => run_call(settings, args).await,
        Command::Devices => {
            print_devices();
            Ok(())
        }
        Command::Sessions { limit } => {
            let store = SqliteStore::new(settings.store_path())?;
            for summary in store.recent_sessions(limit)? {
                println!("{}", serde_json::to_string(&summary)?);
            }
            Ok(())
        }
        Command::Show { id } => {
            let store = SqliteStore::new(settings.store_path())?;
            let Some(session) = store.find_session(&id)? else {
                bail!("no unique stored call matches '{id}'");
            };
            for turn in store.session_turns(session)? {
                println!("{}", serde_json::to_string(&turn)?);
            }
            Ok(())
        }
        Command::Settings { write } => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            if write {
                save_settings(&settings_path, &settings)
                    .with_context(|| format!("writing {}", settings_path.display()))?;
                info!(path = %settings_path.display(), "settings saved");
            }
            Ok(())
        }
    }
}

async fn run_call(mut settings: AppSettings, args: CallArgs) -> Result<()> {
    if let Some(backend) = args.services {
        settings.services.backend = backend.into();
    }
    let config = settings.engine_config();
    let persona = settings.persona_for(args.persona.as_deref())?;
    let voice = settings.voice_for(args.voice.as_deref());

    let player: Arc<dyn Player> = match &args.output_dir {
        Some(dir) => Arc::new(WavPlayer::new(dir)?.realtime(true)),
        None => Arc::new(CpalPlayer::new(settings.output_device.clone())),
    };
    let devices: Arc<dyn AudioDeviceProvider> = match args.input_wav.clone() {
        Some(path) => Arc::new(FactoryDeviceProvider::new(
            move |spec| {
                let source = WavFrameSource::open(&path, spec)?
                    .paced(true)
                    .hold_open(true);
                Ok(Box::new(source) as Box<dyn FrameSource>)
            },
            player,
        )),
        None => Arc::new(
            CpalDeviceProvider::new(
                settings.input_device.clone(),
                settings.output_device.clone(),
                config.source_stall_timeout,
            )
            .with_player(player),
        ),
    };

    let (transcriber, inference, synthesizer) = build_services(&settings, config.frame.sample_rate)?;

    let store: Arc<dyn ConversationStore> = if args.no_store {
        Arc::new(MemoryStore::new())
    } else {
        let path = settings.store_path();
        let store = SqliteStore::new(path.clone())
            .with_context(|| format!("opening {}", path.display()))?
            .with_history(settings.history_enabled);
        match store.prune(settings.retention_days) {
            Ok(0) => {}
            Ok(n) => info!(removed = n, "pruned old calls"),
            Err(e) => warn!(error = %e, "failed to prune call history"),
        }
        Arc::new(store)
    };

    let engine = CallEngine::new(
        config,
        Collaborators {
            devices,
            classifier: None,
            transcriber,
            inference,
            synthesizer,
            store,
        },
    );

    let mut events = engine.subscribe();
    let id = engine
        .start_call(persona, voice)
        .await
        .context("starting call")?;
    info!(session_id = %id, "call running, Ctrl-C to hang up");

    let quiet = args.quiet;
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.session_id == id => {
                    let ended = matches!(
                        &event.kind,
                        CallEventKind::StateChanged { to, .. } if to.is_terminal()
                    );
                    if !quiet {
                        match serde_json::to_string(&event) {
                            Ok(line) => println!("{line}"),
                            Err(e) => warn!(error = %e, "failed to encode event"),
                        }
                    }
                    if ended {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let session = tokio::select! {
        session = engine.wait_call(id) => session?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, hanging up");
            engine.stop_call(id)?;
            engine.wait_call(id).await?
        }
    };

    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        warn!("event printer did not finish");
    }
    if let Ok(diag) = engine.capture_diagnostics(id) {
        info!(?diag, "capture diagnostics");
    }
    info!(
        session_id = %id,
        reason = session.end_reason.map(|r| r.as_str()).unwrap_or("unknown"),
        completed = session.turns_completed,
        failed = session.turns_failed,
        "call ended"
    );
    Ok(())
}

type Services = (
    Arc<dyn TranscriptionService>,
    Arc<dyn InferenceService>,
    Arc<dyn SynthesisService>,
);

fn build_services(settings: &AppSettings, sample_rate: u32) -> Result<Services> {
    match settings.services.backend {
        ServiceBackend::Stub => Ok((
            Arc::new(StubTranscriber),
            Arc::new(EchoInference),
            Arc::new(ToneSynthesizer {
                sample_rate,
                ..ToneSynthesizer::default()
            }),
        )),
        ServiceBackend::Http => {
            let services = &settings.services;
            let mut transcriber = OpenAiTranscriber::new(services.transcription.clone())?;
            if let Some(threshold) = services.min_transcript_confidence {
                transcriber = transcriber.with_min_confidence(threshold);
            }
            info!(
                inference = %services.inference.base_url,
                model = %services.inference.model,
                "using http services"
            );
            Ok((
                Arc::new(transcriber),
                Arc::new(OllamaInference::new(services.inference.clone())?),
                Arc::new(OpenAiSynthesizer::new(services.synthesis.clone())?),
            ))
        }
    }
}

fn print_devices() {
    let inputs = device::list_input_devices();
    let outputs = device::list_output_devices();
    if inputs.is_empty() && outputs.is_empty() {
        warn!("no audio devices found");
    }
    for info in inputs.iter().chain(outputs.iter()) {
        match serde_json::to_string(info) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "failed to encode device"),
        }
    }
}
