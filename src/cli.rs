//! CLI interface for the voice gateway daemon.

use crate::analytics::Recorder;
use crate::clients::hangup::HttpHangupClient;
use crate::clients::{HttpLlmClient, HttpSttClient, HttpTtsClient};
use crate::config::GatewayConfig;
use crate::conversation::KnowledgeSnapshot;
use crate::dashboard::Broadcaster;
use crate::pipeline::PipelineContext;
use crate::scheduler::location::LoggingLocationSender;
use crate::server;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "voice-gateway")]
#[command(about = "Real-time voice-agent gateway for telephony", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway (carrier media stream + dashboard feed)
    Serve {
        /// Override the carrier bind address (host:port)
        #[arg(long)]
        carrier_bind: Option<String>,
        /// Override the dashboard bind address (host:port)
        #[arg(long)]
        dashboard_bind: Option<String>,
    },
    /// Inspect or mutate the live-parameter configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Inspect recorded call analytics
    Analytics {
        #[command(subcommand)]
        command: AnalyticsCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the resolved startup configuration and live parameters
    Show,
    /// Set a single live parameter by dotted path (e.g. audio.silence_duration_ms)
    Set {
        path: String,
        value: String,
    },
}

#[derive(Subcommand)]
enum AnalyticsCommands {
    /// List recorded calls, most recent first
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show the recorded events/turns/summary for one call
    Show {
        call_id: String,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Serve { .. }) => {
            let mut config = GatewayConfig::load()?;
            if let Some(Commands::Serve {
                carrier_bind,
                dashboard_bind,
            }) = cli.command
            {
                if let Some(bind) = carrier_bind {
                    config.carrier_bind = bind;
                }
                if let Some(bind) = dashboard_bind {
                    config.dashboard_bind = bind;
                }
            }
            run_serve(config).await
        }
        Some(Commands::Config { command }) => match command {
            ConfigCommands::Show => {
                let config = GatewayConfig::load()?;
                println!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
            ConfigCommands::Set { path, value } => {
                let mut config = GatewayConfig::load()?;
                let store = std::sync::RwLock::new(config.live.clone());
                server::apply_live_param(&store, &path, &value, "cli")?;
                config.live = store.read().unwrap().clone();
                config.save()?;
                println!("{path} = {value}");
                Ok(())
            }
        },
        Some(Commands::Analytics { command }) => match command {
            AnalyticsCommands::List { limit } => {
                let config = GatewayConfig::load()?;
                let broadcaster = Arc::new(Broadcaster::new());
                let recorder = Recorder::new(config.analytics_root.clone(), broadcaster);
                let mut calls = recorder.list_calls().await?;
                calls.truncate(limit);
                for summary in &calls {
                    println!(
                        "{}  turns={}  avg_total_ms={:.0?}  flags={:?}",
                        summary.call_id,
                        summary.total_turns,
                        summary.avg_total_ms.unwrap_or(0.0),
                        summary.flags_summary
                    );
                }
                Ok(())
            }
            AnalyticsCommands::Show { call_id } => {
                let config = GatewayConfig::load()?;
                let broadcaster = Arc::new(Broadcaster::new());
                let recorder = Recorder::new(config.analytics_root.clone(), broadcaster);
                let (events, turns, summary) = recorder.read_call(&call_id).await?;
                println!("== summary ==\n{}", serde_json::to_string_pretty(&summary)?);
                println!("== turns ({}) ==", turns.len());
                for turn in &turns {
                    println!(
                        "  #{} [{:?}] {} (conf={:?})",
                        turn.turn_index, turn.speaker, turn.text, turn.confidence
                    );
                }
                println!("== events ({}) ==", events.len());
                Ok(())
            }
        },
    }
}

async fn run_serve(config: GatewayConfig) -> Result<()> {
    let stt_key = std::env::var("VOICE_GATEWAY_STT_API_KEY").unwrap_or_default();
    let llm_key = std::env::var("VOICE_GATEWAY_LLM_API_KEY").unwrap_or_default();
    let tts_key = std::env::var("VOICE_GATEWAY_TTS_API_KEY").unwrap_or_default();
    let carrier_account = std::env::var("VOICE_GATEWAY_CARRIER_ACCOUNT_SID").unwrap_or_default();
    let carrier_token = std::env::var("VOICE_GATEWAY_CARRIER_AUTH_TOKEN").unwrap_or_default();

    let broadcaster = Arc::new(Broadcaster::new());
    let pipeline = PipelineContext {
        stt: Arc::new(HttpSttClient::new(config.stt_base_url.clone(), stt_key)),
        llm: Arc::new(HttpLlmClient::new(
            config.llm_base_url.clone(),
            llm_key,
            config.live.llm_model.clone(),
        )),
        tts: Arc::new(HttpTtsClient::new(config.tts_base_url.clone(), tts_key)),
        recorder: Arc::new(Recorder::new(config.analytics_root.clone(), broadcaster.clone())),
        broadcaster,
    };

    let hangup = Arc::new(HttpHangupClient::new(
        config.carrier_base_url.clone(),
        carrier_account,
        carrier_token,
    ));

    let knowledge = KnowledgeSnapshot::default();
    let greeting = "Buongiorno, come posso aiutarla?".to_string();

    let carrier_bind = config.carrier_bind.clone();
    let dashboard_bind = config.dashboard_bind.clone();

    let state = server::build_state(
        config,
        pipeline,
        hangup,
        Arc::new(LoggingLocationSender),
        knowledge,
        greeting,
    );

    let carrier_app = server::carrier_router(state.clone());
    let dashboard_app = server::dashboard_router(state);

    let carrier_listener = tokio::net::TcpListener::bind(&carrier_bind)
        .await
        .with_context(|| format!("failed to bind carrier listener on {carrier_bind}"))?;
    let dashboard_listener = tokio::net::TcpListener::bind(&dashboard_bind)
        .await
        .with_context(|| format!("failed to bind dashboard listener on {dashboard_bind}"))?;

    tracing::info!(carrier_bind, dashboard_bind, "voice gateway listening");

    let carrier_server = axum::serve(carrier_listener, carrier_app);
    let dashboard_server = axum::serve(dashboard_listener, dashboard_app);

    tokio::try_join!(
        async { carrier_server.await.context("carrier server exited") },
        async { dashboard_server.await.context("dashboard server exited") },
    )?;

    Ok(())
}
