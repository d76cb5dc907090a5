//! Concurrent agents sharing one conversation memory.
//!
//! Four agent tasks append to the same storage key while a token budget of
//! 600 keeps the conversation bounded. Appends past the tenth message
//! schedule background flushes that summarize the oldest turns and evict
//! what still does not fit. The system prompt is never evicted.
//!
//! # Run
//!
//! ```bash
//! RUST_LOG=membudget=debug cargo run --example concurrent_agents
//! ```

use membudget::prelude::*;
use membudget::{CharRatioCounter, LockConfig, MemoryEvent};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("membudget=info")),
        )
        .init();

    let resource = MemoryResource::from_json(
        r#"{
            "id": "support_chat",
            "max_tokens": 600,
            "eviction_policy": "priority",
            "priority_blocks": [
                { "priority": 0, "content_types": ["system"] },
                { "priority": 3, "content_types": ["tool"], "max_tokens": 120 }
            ],
            "flushing_strategy": {
                "type": "hybrid_summary",
                "threshold": 0.8,
                "summary_tokens": 150,
                "summarize_oldest_percent": 30
            }
        }"#,
    )?;

    // Four characters per token keeps the demo free of tokenizer downloads.
    let memory = MemoryInstance::builder(StorageKey::new("demo:support:42")?, resource)
        .token_counter(Arc::new(CharRatioCounter::default()))
        .config(InstanceConfig {
            lock: LockConfig {
                max_retries: 200,
                retry_base_ms: 2,
                retry_max_ms: 50,
                ..Default::default()
            },
            ..Default::default()
        })
        .build()?;

    let mut events = memory.subscribe();
    let watcher = tokio::spawn(async move {
        let mut flushes = 0;
        while let Ok(event) = events.recv().await {
            if let MemoryEvent::Flushed {
                summarized,
                evicted,
                tokens_before,
                tokens_after,
                ..
            } = event
            {
                flushes += 1;
                println!(
                    "   flush #{}: summarized {}, evicted {}, tokens {} -> {}",
                    flushes, summarized, evicted, tokens_before, tokens_after
                );
            }
        }
    });

    let cancel = CancellationToken::new();
    memory
        .append(
            Message::system("You are a billing support agent. Be concise and polite."),
            &cancel,
        )
        .await?;

    println!("\n== Four agents writing concurrently ==");
    let mut agents = Vec::new();
    for agent in 0..4 {
        let memory = memory.clone();
        let cancel = cancel.clone();
        agents.push(tokio::spawn(async move {
            for turn in 0..12 {
                let message = match turn % 3 {
                    0 => Message::user(format!(
                        "[agent {}] customer asks about invoice #{} and a duplicate charge",
                        agent, turn
                    )),
                    1 => Message::tool(format!(
                        "[agent {}] lookup result: invoice #{} amount 42.00 status paid twice",
                        agent, turn
                    )),
                    _ => Message::assistant(format!(
                        "[agent {}] refund for invoice #{} has been issued",
                        agent, turn
                    )),
                };
                memory.append(message, &cancel).await?;
            }
            Ok::<_, MemoryError>(())
        }));
    }
    for agent in agents {
        agent.await??;
    }

    memory.wait_for_flushes().await;
    let final_flush = memory.flush(&cancel).await?;

    let health = memory.health(&cancel).await?;
    let messages = memory.read(&cancel).await?;
    println!("\n== Final state ==");
    println!("   messages:      {}", health.message_count);
    println!("   tokens:        {} / {}", health.token_count, memory.token_limit());
    println!("   last flush:    {:?}", health.last_flush);
    println!("   final flush:   evicted {}", final_flush.evicted_count);
    println!("   first message: {:?}", messages.first().map(|m| m.role));
    println!("   stats:         {:?}", memory.stats());

    memory.shutdown().await;
    drop(memory);
    watcher.abort();
    Ok(())
}
