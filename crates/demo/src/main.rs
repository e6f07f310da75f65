//! Runs the order workflow on the in-memory transport and prints bus stats.

mod orders;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sagabus_engine::{BusConfig, ServiceBus};
use sagabus_messages::InMemoryTransport;

use orders::{
    CONFIRMED_TOPIC, EXCHANGE, EXPIRED_TOPIC, OrderConfirmed, OrderExpired, OrderPlaced,
    OrderSaga, SERVICE,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BusConfig::load()
        .context("failed to load bus configuration")?
        .with_service_name(SERVICE);
    sagabus_observability::init_with(config.log.format);

    let transport = Arc::new(InMemoryTransport::new());
    let bus = ServiceBus::connect(config, transport.clone())
        .await
        .context("failed to build service bus")?;

    bus.register_saga(OrderSaga {
        payment_window: Duration::from_millis(500),
    })?;
    bus.handle_message(orders::charge_card)?;
    bus.handle_event::<OrderConfirmed, _>(EXCHANGE, CONFIRMED_TOPIC, |_, confirmed| {
        tracing::info!(order_id = confirmed.order_id, "order confirmed");
        Ok(())
    })?;
    bus.handle_event::<OrderExpired, _>(EXCHANGE, EXPIRED_TOPIC, |_, expired| {
        tracing::warn!(order_id = expired.order_id, "order expired before payment");
        Ok(())
    })?;

    bus.start().await?;

    for (order_id, total) in [(1, 250), (2, 900), (3, 5_000)] {
        bus.send(SERVICE, &OrderPlaced { order_id, total }).await?;
    }

    // Order 3 is declined and expires after the payment window.
    tokio::time::sleep(Duration::from_secs(1)).await;

    let stats = bus.stats();
    bus.shutdown().await?;

    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!("{}", serde_json::to_string_pretty(&transport.counts())?);
    Ok(())
}
