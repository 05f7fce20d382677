use anyhow::{bail, Context, Result};
use clap::Parser;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info};
use voice_notify::campaign::archive::NotifyArchive;
use voice_notify::campaign::types::{NotifyStatus, ResultCode};
use voice_notify::campaign::{ChannelSink, EventSink, NotifyClient, NotifyEvent, TracingSink};
use voice_notify::config::{Cli, Commands};
use voice_notify::transport::AriTransport;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_notify=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.clone().into_config()?;

    info!(
        server = %config.base_url(),
        max_retries = config.max_retries,
        "Voice notify starting"
    );

    let transport = Arc::new(AriTransport::new(&config)?);
    let (sink, mut events) = ChannelSink::new();
    let sink = Arc::new(sink);

    let client = match &config.archive_path {
        Some(path) => {
            let path = path
                .to_str()
                .context("Archive path is not valid UTF-8")?;
            let archive = Arc::new(NotifyArchive::open(path)?);
            NotifyClient::with_archive(config.clone(), transport, sink, archive)
        }
        None => NotifyClient::new(config.clone(), transport, sink),
    };

    let campaign = match &cli.command {
        Commands::Predefined {
            context,
            extension,
            campaign,
        } => {
            let request_id = request_id_for(&campaign.request_id);
            client.create_predefined_notify(context, extension, &request_id)?;
            (request_id, campaign)
        }
        Commands::Custom { media, campaign } => {
            let request_id = request_id_for(&campaign.request_id);
            client.create_custom_notify(media.clone(), &request_id)?;
            (request_id, campaign)
        }
    };
    let (request_id, args) = campaign;

    let mut pending = HashSet::new();
    for (index, phone) in args.phones.iter().enumerate() {
        let notify_id = format!("{}-{}", request_id, index + 1);
        client.add_target(&request_id, phone, &notify_id)?;
        pending.insert(notify_id);
    }

    if !client.send_request(&request_id) {
        bail!("Request {} could not be sent", request_id);
    }

    let max_attempts = config.max_retries.saturating_add(1);
    let mut attempts: HashMap<String, u32> = HashMap::new();
    let log = TracingSink;
    while !pending.is_empty() {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(NotifyEvent::Finished { request_id, result }) => {
                        log.finished(&request_id, result);
                        if result != ResultCode::CommandAccepted {
                            error!(request_id = %request_id, "Submission rejected by server");
                            client.shutdown().await;
                            bail!("Submission failed: {}", result.as_str());
                        }
                    }
                    Some(NotifyEvent::Status { notify_id, status }) => {
                        log.notify_status(&notify_id, status);
                        let attempt = attempts.entry(notify_id.clone()).or_insert(0);
                        if status == NotifyStatus::NotifyInProcess {
                            *attempt += 1;
                        }
                        if settles(status, *attempt, max_attempts) {
                            pending.remove(&notify_id);
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, stopping gracefully...");
                break;
            }
        }
    }

    client.shutdown().await;
    info!("Voice notify stopped");
    Ok(())
}

/// Whether `status` is the last event of a target that has started `attempt` calls
fn settles(status: NotifyStatus, attempt: u32, max_attempts: u32) -> bool {
    match status {
        NotifyStatus::Failed => attempt >= max_attempts,
        other => other.is_terminal(),
    }
}

fn request_id_for(requested: &Option<String>) -> String {
    requested
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}
