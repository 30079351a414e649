//! vpuflow demo: drives the decode pipeline against the simulated engine

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, warn};

use vpuflow::engine::sim::{SimOptions, SimulatedFactory};
use vpuflow::pipeline::StreamHints;
use vpuflow::{Codec, Config, Pipeline, Release};

const FRAMES: i64 = 120;
const FRAME_INTERVAL_US: i64 = 40_000;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("vpuflow=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("vpuflow launching...");

    // Load configuration
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;

    let factory = SimulatedFactory::new(SimOptions {
        component: Some("OMX.sim.avc.decoder".into()),
        decode_delay: Duration::from_millis(2),
        ..Default::default()
    });
    let memory = factory.memory();

    let hints = StreamHints::new(Codec::H264, 1280, 720);
    let pipeline = Arc::new(Pipeline::open(&factory, &hints, &config, None)?);

    // Producer: feed compressed frames, backing off when the engine is full
    let producer = {
        let pipeline = pipeline.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            for n in 0..FRAMES {
                let payload = format!("access-unit-{n}");
                let pts = n * FRAME_INTERVAL_US;
                let mut status = pipeline.submit(payload.as_bytes(), None, Some(pts))?;
                while !status.ready_for_input {
                    status = pipeline.submit(&[], None, None)?;
                }
            }
            Ok(())
        })
    };

    // Consumer: present pictures as they arrive
    let mut presented = 0;
    let mut interval = tokio::time::interval(Duration::from_millis(1));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    while presented < FRAMES {
        tokio::select! {
            _ = interval.tick() => {
                while let Some(picture) = pipeline.acquire_picture() {
                    if let Some(buffer) = picture.buffer() {
                        info!(
                            pts = picture.pts,
                            phys = format_args!("{:#x}", buffer.physical_address()),
                            width = picture.display_width,
                            height = picture.display_height,
                            "presenting picture"
                        );
                    }
                    let pts = picture.pts;
                    if pipeline.clear_picture(picture) == Release::NotTracked {
                        warn!(pts, "cleared picture was not tracked by the registry");
                    }
                    presented += 1;
                }
            }
            _ = &mut shutdown => {
                warn!("interrupted");
                break;
            }
        }
    }

    let stats = pipeline.stats();
    info!(
        submitted = stats.frames_submitted,
        decoded = stats.frames_decoded,
        dropped = stats.frames_dropped,
        delivered = stats.frames_delivered,
        "pipeline statistics"
    );

    // Disposing also unblocks a producer still waiting for room
    pipeline.dispose();
    match producer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("producer failed: {}", e),
        Err(e) => return Err(eyre!("producer task panicked: {}", e)),
    }

    info!(live_blocks = memory.live(), "shutdown complete");
    Ok(())
}
