use std::sync::Arc;

use screen_proctor::api;
use screen_proctor::config::Config;
use screen_proctor::logging;
use screen_proctor::recording::{CaptureSettings, GstEncoderFactory, RecordingManager};
use screen_proctor::roster::BackendClient;
use screen_proctor::session::{ConnectionRegistry, NegotiationRole, RtcSessionFactory};
use screen_proctor::signaling::{OrderedDispatcher, SignalingTransport, WebSocketTransport};
use screen_proctor::{Coordinator, Result};

#[tokio::main]
async fn main() {
    logging::init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "Coordinator exited with error");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;
    let coordinator_id = config.signaling.coordinator_id.clone();

    let roster = match &config.backend.url {
        Some(url) => BackendClient::new(url.clone())?.fetch_roster(&coordinator_id).await?,
        None => config.backend.roster.clone(),
    };

    let (transport, events) = WebSocketTransport::connect(&config.signaling.url).await?;

    let factory = Arc::new(RtcSessionFactory::new(&config.ice)?);
    let registry = ConnectionRegistry::new(
        coordinator_id.clone(),
        NegotiationRole::Answerer,
        factory,
        transport.clone(),
    );
    registry.start_event_processing();

    let recorder = Arc::new(RecordingManager::new(
        registry.clone(),
        Arc::new(GstEncoderFactory::new(config.recording.flush_timeout)),
        CaptureSettings::from_config(&config.recording),
    ));

    let coordinator = Coordinator::new(
        transport.clone(),
        registry,
        recorder,
        config.recording.output_dir.clone(),
    );

    let dispatcher = OrderedDispatcher::new(coordinator.clone());
    tokio::spawn(dispatcher.run(events));

    let room_name = coordinator
        .open_room(config.signaling.room_name.clone(), roster)
        .await?;

    let routes = api::control_routes(coordinator.clone());
    let (addr, server) =
        warp::serve(routes).bind_with_graceful_shutdown(config.bind_address(), async {
            let _ = tokio::signal::ctrl_c().await;
        });

    tracing::info!(
        addr = %addr,
        room_name = %room_name,
        coordinator = %coordinator_id,
        "Coordinator ready"
    );

    server.await;

    tracing::info!("Shutting down");

    if !coordinator.recorder().snapshots().await.is_empty() {
        match coordinator.finish_recording().await {
            Ok((archive, path)) => tracing::info!(
                path = %path.display(),
                entries = archive.entries.len(),
                "Final archive written"
            ),
            Err(e) if e.is_fatal() => tracing::error!(error = %e, "Final export failed"),
            Err(e) => tracing::warn!(error = %e, "Final export incomplete"),
        }
    }

    if let Err(e) = coordinator.close_room().await {
        tracing::debug!(error = %e, "Room already closed");
    }
    transport.disconnect().await;

    Ok(())
}
