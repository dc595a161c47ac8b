//! Single-shot detection server binary.
//!
use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use clap::Parser;
use env_logger::TimestampPrecision;
use sign_server::{
    detector::{spawn_model_loader, ModelArgs, ModelSlot},
    endpoints::{detect_router, shutdown_signal, DetectContext},
};

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address to listen on
    #[clap(long, env = "HOST", default_value = "0.0.0.0")]
    address: String,

    /// Port to listen on
    #[clap(long, env = "PORT", default_value = "8002")]
    port: u16,

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

    // The server accepts requests while the model is still loading
    let model = Arc::new(ModelSlot::new());
    spawn_model_loader(args.model.clone(), model.clone());

    let ctx = Arc::new(DetectContext::new(
        model,
        args.model.model_path.display().to_string(),
    ));
    let app = detect_router(ctx);

    let addr: SocketAddr = format!("{}:{}", args.address, args.port).parse()?;
    log::info!("Detection server listening on {}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
