//! Two sessions over an in-memory pair exchanging a ping.
//!
//! Run with: cargo run --example ping_pong

use std::time::Duration;

use tether_session::memory::MemoryTransport;
use tether_session::{Extension, Payload, Session, SessionOptions};

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(run())
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let topic = [42u8; 32];
    let (near, far) = MemoryTransport::pair();

    // The responder maps ping to pong.
    let responder = Session::new(far, SessionOptions::default());
    responder.set_extension(
        Extension::builder("echo")
            .timeout(Duration::from_secs(1))
            .on_message(|_session, payload, _options| async move {
                let bytes = payload.as_bytes().unwrap_or_default();
                println!("responder received {:?}", String::from_utf8_lossy(bytes));
                Ok(Some(Payload::Bytes(b"pong".to_vec())))
            })
            .build(),
    );
    responder.init(Some(topic));

    // The initiator sends the ping.
    let initiator = Session::new(near, SessionOptions::default());
    initiator.set_extension(
        Extension::builder("echo")
            .timeout(Duration::from_secs(1))
            .build(),
    );
    initiator.init(Some(topic));

    initiator.ready().await?;
    responder.ready().await?;
    println!("both sessions running");

    let echo = initiator.extension("echo").expect("registered above");
    let response = echo.call(&b"ping"[..]).await?;
    println!(
        "initiator received {:?}",
        String::from_utf8_lossy(response.as_bytes().unwrap_or_default())
    );

    initiator.close().await;
    responder.close().await;
    println!("Done!");
    Ok(())
}
