//! Two "processes" sharing a conversation through a directory.
//!
//! Each writer opens its own `JsonFileStore` and `FileLockBackend` on the
//! same directories, exactly as separate processes on one host would. The
//! lock directory serializes their writes; the final count proves nothing
//! was lost. Run it twice to see the conversation survive restarts until
//! the key TTL elapses.
//!
//! # Run
//!
//! ```bash
//! cargo run --example shared_directory -- /tmp/membudget-demo
//! ```

use membudget::prelude::*;
use membudget::{CharRatioCounter, FileLockBackend, JsonFileStore, LockConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

async fn open(root: &Path, resource: &MemoryResource) -> anyhow::Result<MemoryInstance> {
    let store = JsonFileStore::open(root.join("data")).await?;
    let locks = FileLockBackend::open(root.join("locks")).await?;
    let key = StorageKey::scoped("workflow", "order 1138")?;
    let memory = MemoryInstance::builder(key, resource.clone())
        .store(Arc::new(store))
        .lock_backend(Arc::new(locks))
        .token_counter(Arc::new(CharRatioCounter::default()))
        .config(InstanceConfig {
            lock: LockConfig {
                max_retries: 500,
                retry_base_ms: 1,
                retry_max_ms: 20,
                ..Default::default()
            },
            ..Default::default()
        })
        .build()?;
    Ok(memory)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("membudget=info")),
        )
        .init();

    let root = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("membudget-demo"));
    println!("Using {}", root.display());

    let mut resource = MemoryResource::with_max_tokens("workflow", 2_000);
    resource.max_messages = Some(200);

    let cancel = CancellationToken::new();
    let before = open(&root, &resource).await?.len(&cancel).await?;
    println!("Messages from earlier runs: {}", before);

    let start = Instant::now();
    let mut writers = Vec::new();
    for writer in 0..2 {
        let memory = open(&root, &resource).await?;
        let cancel = cancel.clone();
        writers.push(tokio::spawn(async move {
            for step in 0..25 {
                memory
                    .append(
                        Message::assistant(format!("writer {} finished step {}", writer, step)),
                        &cancel,
                    )
                    .await?;
            }
            memory.wait_for_flushes().await;
            Ok::<_, MemoryError>(())
        }));
    }
    for writer in writers {
        writer.await??;
    }

    let reader = open(&root, &resource).await?;
    let health = reader.health(&cancel).await?;
    println!(
        "After {:?}: {} messages, {} tokens (limit {})",
        start.elapsed(),
        health.message_count,
        health.token_count,
        reader.token_limit()
    );
    if let Some(last) = reader.read(&cancel).await?.last() {
        println!("Newest: {}", last.content);
    }
    Ok(())
}
