//! Camera stream server binary.
//!
use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{atomic::Ordering, Arc},
};

use anyhow::Result;
use camera::{default_backends, CameraBackend, CameraSession, CaptureSettings, Synthetic};
use clap::Parser;
use env_logger::TimestampPrecision;
use sign_server::{
    annotator::FrameAnnotator,
    detector::{spawn_model_loader, ModelArgs, ModelSlot},
    endpoints::{shutdown_signal, stream_router, StreamContext},
    stats::{spawn_stats_logger, StreamingStats},
    stream::StreamResources,
};

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address to listen on
    #[clap(long, env = "HOST", default_value = "0.0.0.0")]
    address: String,

    /// Port to listen on
    #[clap(long, env = "PORT", default_value = "8003")]
    port: u16,

    /// TrueType font for labels, labels are left out if it cannot be loaded
    #[clap(
        long,
        env = "SIGN_FONT_PATH",
        default_value = "resources/DejaVuSansMono.ttf"
    )]
    font_path: PathBuf,

    /// Camera opened by start_camera until another one is selected
    #[clap(long, default_value = "0")]
    camera_id: u32,

    /// Use generated test frames instead of V4L2 devices
    #[clap(long)]
    synthetic_camera: bool,

    /// Close the camera after this many failed reads in a row, 0 to retry forever
    #[clap(long, default_value = "30")]
    max_read_failures: u32,

    /// Open the camera at startup
    #[clap(long)]
    autostart: bool,

    #[clap(flatten)]
    model: ModelArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let model = Arc::new(ModelSlot::new());
    spawn_model_loader(args.model.clone(), model.clone());

    let backends: Vec<Box<dyn CameraBackend>> = match args.synthetic_camera {
        true => vec![Box::new(Synthetic::new(2))],
        false => default_backends(),
    };
    let stats = Arc::new(StreamingStats::new());
    stats.set_camera(false, args.camera_id);
    spawn_stats_logger(stats.clone());

    let session = CameraSession::new(backends, CaptureSettings::default())
        .with_camera_id(args.camera_id)
        .with_observer(stats.clone());

    let resources = StreamResources {
        session: Arc::new(session),
        model,
        annotator: Arc::new(FrameAnnotator::with_font_file(&args.font_path)),
        stats,
    };
    let ctx = Arc::new(StreamContext::new(resources, args.max_read_failures));

    if args.autostart {
        let control = ctx.control.clone();
        let response = tokio::task::spawn_blocking(move || control.start()).await?;
        log::info!("Autostart: {}", response.message);
    }

    let app = stream_router(ctx.clone());

    let addr: SocketAddr = format!("{}:{}", args.address, args.port).parse()?;
    log::info!("Stream server listening on {}", addr);
    let shutdown = ctx.shutdown.clone();
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.store(true, Ordering::Relaxed);
        })
        .await?;

    let control = ctx.control.clone();
    tokio::task::spawn_blocking(move || control.shutdown()).await?;

    Ok(())
}
