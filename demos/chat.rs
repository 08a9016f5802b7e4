//! Subscribes to a channel and publishes every line read from stdin to it.
//!
//! ```text
//! PUSHMQ_BASE_URL=http://localhost:8080 cargo run --example chat -- lobby
//! ```

use std::io::BufRead;

use pushmq_http::{ClientOptions, PushMqClient};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let channel = std::env::args().nth(1).unwrap_or_else(|| "lobby".to_owned());
    let base_url = std::env::var("PUSHMQ_BASE_URL")?;
    let options = ClientOptions {
        debug_logging: true,
        ..ClientOptions::from_env()?
    };

    let client = PushMqClient::new(base_url, |channel: &str, payload: &str| {
        println!("[{channel}] {payload}");
        Ok::<(), std::io::Error>(())
    })
    .with_options(options);

    let subscription = client.subscribe(channel.clone());

    let (lines_tx, mut lines_rx) = tokio::sync::mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if lines_tx.send(line).is_err() {
                break;
            }
        }
    });

    while let Some(line) = lines_rx.recv().await {
        if line.trim() == "/quit" {
            break;
        }
        client.publish(channel.clone(), line);
    }

    // A poll held open by the server is not interrupted; the loop exits
    // once it returns or times out.
    client.close(&channel, false);
    println!("closed {}", subscription.channel());
    Ok(())
}
