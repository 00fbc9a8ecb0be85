//! Demo 1: Live Ticker Stream
//!
//! Showcases: Token fetch, exact and wildcard subscriptions, typed payloads
//!
//! Run: cargo run --bin ticker_stream -- BTC-USDT ETH-USDT

use colored::*;
use kucoin_types::{TickerData, TradeMatch};
use kucoin_ws::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let mut symbols: Vec<String> = std::env::args().skip(1).collect();
    if symbols.is_empty() {
        symbols = vec!["BTC-USDT".to_string(), "ETH-USDT".to_string()];
    }

    println!("{}", "═".repeat(60).cyan());
    println!("{}", "  LIVE TICKER STREAM".cyan().bold());
    println!("{}", "  KuCoin Streams Demo - One socket, many topics".cyan());
    println!("{}", "═".repeat(60).cyan());
    println!();

    let provider = Arc::new(BulletTokenProvider::from_env()?);
    let manager = SocketManager::create(provider, false).await?;
    println!("{} Connected to KuCoin push API", "✓".green());

    let topic = format!("/market/ticker:{}", symbols.join(","));
    let handle = manager.subscribe(topic.clone(), |msg| {
        let Ok(ticker) = msg.decode::<TickerData>() else {
            return;
        };
        println!(
            "  {:<10} {} {:>12}  {} {:>12}  {} {:>12}  {} {}",
            msg.symbol().unwrap_or("?").cyan(),
            "LAST:".yellow(),
            ticker.price,
            "BID:".yellow(),
            ticker.best_bid,
            "ASK:".yellow(),
            ticker.best_ask,
            "SPREAD:".green(),
            ticker.spread()
        );
    })?;

    let trades = Arc::new(AtomicU64::new(0));
    let counter = trades.clone();
    manager.subscribe("/market/match:all", move |msg| {
        if msg.decode::<TradeMatch>().is_ok() {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    })?;

    if tokio::time::timeout(Duration::from_secs(10), handle.acknowledged()).await == Ok(true) {
        println!("{} Subscribed to {}\n", "✓".green(), topic);
    } else {
        println!("{} No acknowledgement for {}\n", "!".red(), topic);
    }

    let start = Instant::now();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = tokio::time::sleep(Duration::from_secs(30)) => {}
    }

    let elapsed = start.elapsed().as_secs().max(1);
    let total = trades.load(Ordering::Relaxed);
    println!();
    println!(
        "  {} {} trades across all symbols ({}/s)",
        "Matches:".dimmed(),
        total,
        total / elapsed
    );

    manager.close().await;
    println!("{} Connection closed", "✓".green());

    Ok(())
}
