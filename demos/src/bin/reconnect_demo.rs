//! Demo 2: Auto-Reconnect Demo
//!
//! Showcases: Connection events, exponential backoff, subscription restore
//!
//! Run: cargo run --bin reconnect_demo

use colored::*;
use kucoin_ws::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kucoin_ws=info")),
        )
        .init();

    println!("{}", "═".repeat(65).cyan());
    println!("{}", "  AUTO-RECONNECT DEMO".cyan().bold());
    println!("{}", "  KuCoin Streams Demo - Resilient Connection Handling".cyan());
    println!("{}", "═".repeat(65).cyan());
    println!();

    // Keep retrying through an outage that outlasts the demo run
    let reconnect = ReconnectConfig::new().with_max_token_failures(100);

    println!("{}", "  RECONNECTION CONFIGURATION".white().bold());
    println!("  {}", "─".repeat(50));
    println!("  Initial Delay:      {} ms", reconnect.initial_delay.as_millis().to_string().cyan());
    println!("  Max Delay:          {} seconds", reconnect.max_delay.as_secs().to_string().cyan());
    println!("  Backoff Multiplier: {}", format!("{}x", reconnect.multiplier).cyan());
    println!("  Token Failures:     {} before giving up", reconnect.max_token_failures.to_string().cyan());
    println!();

    println!("{}", "  EXPONENTIAL BACKOFF PROGRESSION".white().bold());
    println!("  {}", "─".repeat(50));
    for attempt in 1..=8 {
        let delay = reconnect.backoff(attempt);
        let bar_len = (delay.as_millis() / 1000).min(40) as usize;
        println!(
            "  Attempt {:>2}: {:>6} ms  {}",
            attempt,
            delay.as_millis(),
            "█".repeat(bar_len).yellow()
        );
    }

    println!();
    println!("{}", "  LIVE CONNECTION TEST".white().bold());
    println!("  {}", "─".repeat(50));
    println!(
        "  {} Disable the network for a while to watch the client back off and recover",
        "Tip:".dimmed()
    );

    let provider = Arc::new(BulletTokenProvider::from_env()?);
    let manager = SocketManager::new(provider, StreamConfig::new().with_reconnect(reconnect));
    let mut events = manager.take_event_receiver().ok_or("Events already taken")?;

    manager.subscribe("/market/ticker:BTC-USDT", |_| {})?;
    manager.subscribe("/market/snapshot:BTC", |_| {})?;

    let start = Instant::now();
    let deadline = tokio::time::sleep(Duration::from_secs(120));
    tokio::pin!(deadline);

    loop {
        let event = tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
        let stamp = format!("[{}]", timestamp).dimmed();

        match event {
            Event::Connection(ConnectionEvent::Connected { endpoint, .. }) => {
                println!("  {} {} Connected to {}", stamp, "●".green(), endpoint.green());
            }
            Event::Connection(ConnectionEvent::Disconnected { reason }) => {
                println!("  {} {} Disconnected: {:?}", stamp, "●".red(), reason);
            }
            Event::Connection(ConnectionEvent::Reconnecting { attempt, delay }) => {
                println!(
                    "  {} {} Reconnect attempt {} in {} ms",
                    stamp,
                    "●".yellow(),
                    attempt,
                    delay.as_millis()
                );
            }
            Event::Connection(ConnectionEvent::SubscriptionsRestored { count }) => {
                println!("  {} {} Restored {} subscriptions", stamp, "●".blue(), count);
            }
            Event::Connection(ConnectionEvent::ReconnectFailed { error }) => {
                println!("  {} {} Gave up: {}", stamp, "●".red(), error);
            }
            Event::Connection(ConnectionEvent::Closed) => break,
            Event::Subscription(SubscriptionEvent::Acknowledged { topic }) => {
                println!("  {} {} Subscribed {}", stamp, "●".blue(), topic.cyan());
            }
            Event::Subscription(SubscriptionEvent::Unsubscribed { topic }) => {
                println!("  {} {} Unsubscribed {}", stamp, "●".blue(), topic);
            }
            Event::Error(error) => {
                println!("  {} {} {}", stamp, "●".red(), error);
            }
        }
    }

    manager.close().await;
    println!();
    println!(
        "  {} ran for {}s, final state {:?}",
        "Done:".dimmed(),
        start.elapsed().as_secs(),
        manager.state()
    );

    Ok(())
}
