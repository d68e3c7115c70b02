// Set a breakpoint at the start of a method and report the first few hits
//
// Usage: breakpoint_hits <host> <port> <class> <method> [hits]
// e.g.   breakpoint_hits localhost 5005 com.example.Main run 3

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use jdwp_core::types::Location;
use jdwp_core::Session;
use tokio::sync::Notify;
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

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 4 {
        bail!("usage: breakpoint_hits <host> <port> <class> <method> [hits]");
    }
    let port: u16 = args[1].parse().context("port must be a number")?;
    let class = &args[2];
    let method = &args[3];
    let hits: usize = match args.get(4) {
        Some(n) => n.parse().context("hits must be a number")?,
        None => 1,
    };

    let session = Session::connect(&args[0], port).await?;

    let signature = format!("L{};", class.replace('.', "/"));
    let classes = session.classes_by_signature(&signature).await?;
    let class_info = classes
        .first()
        .ok_or_else(|| anyhow!("class {} is not loaded", class))?;
    let methods = session.get_methods(class_info.type_id).await?;
    let method_info = methods
        .iter()
        .find(|m| &m.name == method)
        .ok_or_else(|| anyhow!("no method {} in {}", method, class))?;

    let location = Location {
        type_tag: class_info.ref_type_tag as u8,
        class_id: class_info.type_id,
        method_id: method_info.method_id,
        index: 0,
    };

    let done = Arc::new(Notify::new());
    let seen = Arc::new(AtomicUsize::new(0));
    let manager = session.event_request_manager();
    let request = manager.create_breakpoint_request(location);
    {
        let done = done.clone();
        request
            .set_handler(move |event| {
                let done = done.clone();
                let seen = seen.clone();
                async move {
                    let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
                    let thread = match event.thread().await {
                        Ok(Some(thread)) => thread.name,
                        _ => "?".to_string(),
                    };
                    let line = event.line_number().await.ok().flatten();
                    match event.location().await {
                        Ok(Some(at)) => println!("hit {} on {} at {} line {:?}", n, thread, at, line),
                        Ok(None) => println!("hit {} on {}", n, thread),
                        Err(e) => println!("hit {} on {} (location unavailable: {})", n, thread, e),
                    }
                    if n >= hits {
                        done.notify_one();
                        return false;
                    }
                    true
                }
            })
            .await?;
    }
    request.enable().await?;
    info!("Waiting for {} hits in {}.{}", hits, class, method);

    let shutdown = session.shutdown_token();
    tokio::select! {
        _ = done.notified() => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = shutdown.cancelled() => info!("Target went away"),
    }

    if !session.is_closed() {
        manager.delete_event_request(&request).await?;
        session.dispose().await?;
    }
    Ok(())
}
