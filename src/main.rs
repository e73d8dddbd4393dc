use anyhow::Context;
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use signal_flow::core::Config;
use signal_flow::events::{Event, EventBus, SignalPayload};
use signal_flow::execution::{OrderManager, OrderRegistry};
use signal_flow::risk::FixedSizer;
use signal_flow::sim::{PaperBroker, PositionLedger};

fn main() -> anyhow::Result<()> {
    // 1. Logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,signal_flow=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    tracing::info!("signal-flow starting");

    // 2. Config: explicit path or default search
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(Path::new(&path))
            .with_context(|| format!("loading config from {}", path))?,
        None => Config::load_default(),
    };

    // 3. One bus per run, injected everywhere
    let bus = Arc::new(EventBus::new(config.bus.clone())?);
    let registry = Arc::new(OrderRegistry::new(Arc::clone(&bus)));
    let broker = Arc::new(PaperBroker::new(Arc::clone(&bus), &config.broker));
    let ledger = Arc::new(PositionLedger::new(Arc::clone(&bus)));
    let manager = Arc::new(OrderManager::new(
        Arc::clone(&bus),
        Arc::clone(&registry),
        Box::new(FixedSizer::from_config(&config.orders)),
        config.orders.clone(),
    ));

    registry.attach();
    broker.attach();
    ledger.attach();
    manager.attach();

    tracing::info!(
        "Pipeline wired (dedup: {:?}, cap: {} per symbol)",
        bus.strategy(),
        config.orders.max_orders_per_symbol
    );

    // 4. Scripted session
    let script = [
        ("BTC", 1.0, 65_000, "btc-1"),
        ("BTC", 1.0, 65_000, "btc-1"), // replayed decision
        ("ETH", -0.7, 3_100, "eth-1"),
        ("SOL", 0.0, 150, "sol-1"), // neutral
        ("BTC", -1.0, 65_400, "btc-2"),
    ];
    for (symbol, value, price, rule) in script {
        let handled = bus.publish(Event::signal(
            &SignalPayload::new(symbol, value, Decimal::from(price)).with_rule_id(rule),
        ));
        tracing::debug!("SIGNAL {} ({}) -> {} handler(s)", rule, symbol, handled);
    }

    // Queued signals are released together
    bus.start_batch();
    for (i, symbol) in ["ETH", "SOL"].iter().enumerate() {
        bus.publish(Event::signal(
            &SignalPayload::new(*symbol, 1.0, Decimal::from(100 + i as i64))
                .with_rule_id(format!("batch-{}", i)),
        ));
    }
    let released = bus.end_batch();
    tracing::info!("Batch released {} handler invocation(s)", released);

    // Broker offline: orders rest, the cap holds, then the resting order is pulled
    broker.detach();
    let resting = manager.submit_signal(
        &SignalPayload::new("ADA", 1.0, Decimal::new(45, 2)).with_rule_id("ada-1"),
    );
    manager.submit_signal(&SignalPayload::new("ADA", 1.0, Decimal::new(46, 2)).with_rule_id("ada-2"));
    if let Some(order_id) = resting {
        manager.cancel_order(&order_id, "broker offline")?;
    }
    broker.attach();

    // 5. Report
    println!("bus:      {}", serde_json::to_string_pretty(&bus.metrics())?);
    println!("registry: {}", serde_json::to_string_pretty(&registry.get_stats())?);
    println!("manager:  {}", serde_json::to_string_pretty(&manager.get_stats())?);
    println!("broker:   {}", serde_json::to_string_pretty(&broker.get_stats())?);
    println!("ledger:   {}", serde_json::to_string_pretty(&ledger.positions())?);

    manager.detach();
    ledger.detach();
    broker.detach();
    registry.detach();
    Ok(())
}
