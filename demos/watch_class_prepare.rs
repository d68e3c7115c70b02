// Print every class the target VM prepares
//
// Usage: watch_class_prepare <host> <port> [class-pattern]
// The target must run with -agentlib:jdwp=transport=dt_socket,server=y,address=<port>

use anyhow::{Context, Result};
use jdwp_core::{Session, SuspendPolicy};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("jdwp_core=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "localhost".to_string());
    let port: u16 = args
        .next()
        .unwrap_or_else(|| "5005".to_string())
        .parse()
        .context("port must be a number")?;
    let pattern = args.next();

    let session = Session::connect(&host, port).await?;
    let version = session.version().await?;
    info!("Attached to {} ({})", version.vm_name, version.vm_version);

    let manager = session.event_request_manager();
    let request = manager.create_class_prepare_request();
    if let Some(pattern) = &pattern {
        request.add_class_match_filter(pattern).await?;
    }
    request.set_suspend_policy(SuspendPolicy::EventThread).await?;
    request
        .set_handler(|event| async move {
            if let Some(name) = event.class_name() {
                println!("prepared {}", name);
            }
            true
        })
        .await?;
    request.enable().await?;

    let shutdown = session.shutdown_token();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = shutdown.cancelled() => info!("Target went away"),
    }

    if !session.is_closed() {
        manager.delete_event_request(&request).await?;
        session.dispose().await?;
    }
    Ok(())
}
