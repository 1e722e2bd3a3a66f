//! Chat client example
//!
//! Loads settings, fetches a (simulated) player profile through the call
//! registry, then joins the real-time channel and sends one chat message.
//!
//! Run with: `cargo run -p herolink --example chat_client -- ws://127.0.0.1:9001/game`

use std::time::Duration;

use herolink::{
    CallError, CallKey, CallOptions, CallRegistry, ChannelMessage, ConnectionConfig,
    ConnectionManager, SettingsStore, websocket::MessageType,
};
use serde_json::{Value, json};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Honors RUST_LOG
    tracing_subscriber::fmt::init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:9001/game".to_string());

    // Settings
    let settings = SettingsStore::new(std::env::temp_dir()).load()?;
    println!("volume={} muted={}", settings.volume, settings.muted);

    // Keyed call with retries and a cached fetch
    let registry: CallRegistry<Value> = CallRegistry::new();
    let profile_key = CallKey::new("profile")?;
    let _profile_sub = registry.subscribe(&profile_key, |state| {
        println!("profile call: {:?}", state.status);
    });

    let cache = registry.cache().clone();
    let profile = registry
        .execute(
            &profile_key,
            move || {
                let cache = cache.clone();
                async move {
                    cache
                        .get_or_fetch("profile", || async {
                            Ok::<_, CallError>(json!({ "name": "Aria", "level": 12 }))
                        })
                        .await
                }
            },
            CallOptions::new().max_retries(2),
        )
        .await?;
    println!("profile: {profile}");

    // Real-time channel
    let manager = ConnectionManager::new(ConnectionConfig::new(url))?;
    let _status_sub = manager.on_status_change(|status| println!("channel: {status}"));
    let _chat_sub = manager.on("chat", |message| {
        println!("chat: {}", message.payload.clone().unwrap_or(Value::Null));
    })?;

    let chat = MessageType::new("chat")?;
    manager.send(ChannelMessage::new(
        &chat,
        Some(json!({ "text": "hello from herolink" })),
    ));

    match manager.connect().await {
        Ok(()) => {
            tokio::time::sleep(Duration::from_secs(10)).await;
            manager.disconnect();
        }
        Err(err) => eprintln!("connect failed: {err}"),
    }

    Ok(())
}
