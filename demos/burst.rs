//! Submits a burst of mixed-priority work through a fake transport.
//!
//! Run with `RUST_LOG=sluice=debug cargo run --example burst` to watch the
//! queue pace dispatches and the retrier back off from a simulated 429.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use sluice::queue::QueueConfig;
use sluice::{FileStore, ModelClient, ModelRequest, RequestQueue, TransportError};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = QueueConfig::default().min_delay(Duration::from_millis(500));
    let store = Arc::new(FileStore::new(std::env::temp_dir().join("sluice-burst.json")));
    let queue = RequestQueue::new(config, store);

    // The first call is throttled, everything after succeeds.
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let transport = move |req: ModelRequest| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if n == 0 {
                return Err(TransportError::from_value(&json!({
                    "error": { "code": 429, "status": "RESOURCE_EXHAUSTED", "message": "slow down" }
                })));
            }
            Ok(json!({ "call": n, "operation": req.operation }))
        }
    };
    let client = ModelClient::new(queue, transport);

    let words = ["ink", "receipt", "tide"].map(|word| {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .analyze_word(json!({ "word": word }), json!({ "word": word, "definition": null }))
                .await
        })
    });
    let image = client.analyze_image(json!({ "image": "base64…" }));
    let fragments = client.generate_fragments(json!({ "count": 4 }));

    let (image, fragments) = tokio::join!(image, fragments);
    println!("image analysis: {}", image?);
    println!("fragments:      {}", fragments?);
    for handle in words {
        let word: Value = handle.await?;
        println!("word lookup:    {word}");
    }
    println!("transport calls: {}", calls.load(Ordering::SeqCst));
    Ok(())
}
