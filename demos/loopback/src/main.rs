//! Streams payloads over an in-process link and shows supersession.
//!
//! Run with: cargo run -p loopback-demo
//!
//! Set `RUST_LOG=debug` to follow both ends of the link.

use std::{sync::Arc, time::Duration};

use gzstream_core::{CoordinatorConfig, StreamError};
use gzstream_receiver::{Dispatcher, RemoteArgs};
use gzstream_session::StreamCoordinator;
use gzstream_transport::{LinkOptions, connect};
use serde_json::{Value, json};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Remote operation: receive the stream and report its size.
fn dispatcher() -> Dispatcher {
    let mut dispatcher = Dispatcher::new();
    dispatcher.register("ingest", |mut args: RemoteArgs| async move {
        let stream = args
            .take_stream()
            .ok_or_else(|| anyhow::anyhow!("ingest expects a stream argument"))?;
        let label = args.values().next().cloned().unwrap_or(Value::Null);
        let rows: Vec<Value> = stream.get_data().await?;
        tracing::info!(%label, rows = rows.len(), "ingested");
        Ok::<_, anyhow::Error>(json!({ "label": label, "rows": rows.len() }))
    });
    dispatcher
}

fn rows(count: usize) -> Vec<Value> {
    (0..count)
        .map(|i| json!({ "id": i, "name": format!("item-{i}") }))
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let options = LinkOptions::default()
        .with_chunk_size(256)
        .with_chunk_interval(Duration::from_millis(2));
    let transport = Arc::new(connect(dispatcher(), options));
    let coordinator = Arc::new(StreamCoordinator::new(
        Arc::clone(&transport),
        CoordinatorConfig::default(),
    ));

    // A transfer that runs to completion.
    let result: Value = coordinator
        .send("ingest", rows(3), vec![json!("small")])
        .await?;
    tracing::info!(%result, "first transfer done");

    // A large transfer superseded by a small one.
    let large = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move {
            coordinator
                .send::<_, Value>("ingest", rows(20_000), vec![json!("large")])
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let result: Value = coordinator
        .send("ingest", rows(10), vec![json!("replacement")])
        .await?;
    tracing::info!(%result, "replacement transfer done");

    match large.await? {
        Err(StreamError::Cancelled) => tracing::info!("large transfer was superseded"),
        Ok(result) => tracing::info!(%result, "large transfer finished before it was superseded"),
        Err(e) => return Err(e.into()),
    }

    coordinator.dispose();
    tokio::time::sleep(Duration::from_millis(50)).await;
    tracing::info!(
        receiving = transport.registry().len(),
        buffered = transport.open_streams(),
        "link drained"
    );
    Ok(())
}
