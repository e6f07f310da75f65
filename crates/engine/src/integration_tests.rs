//! Integration tests for the full bus pipeline.
//!
//! Tests: Transport → Ingress → Dispatch Engine → Saga Store → Outbox → Transport
//!
//! Verifies:
//! - Starters create instances; handled messages update them; orphans are reported
//! - Concurrent starters for one correlation id leave exactly one instance
//! - Completed instances never transition again
//! - Timeouts fire at most once and are disarmed by completion
//! - Scheduler requests landing out of commit order never override newer ones
//! - Sagas start and continue through exchange + topic event keys
//! - Outbound messages survive a Transport outage through the outbox relay

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    use sagabus_core::{CorrelationId, HandlerError, MessageId};
    use sagabus_messages::{
        FailureKind, InMemoryTransport, Invocation, Message, MessageEnvelope, Saga,
        SagaDeclaration, Transition,
    };

    use crate::bus::ServiceBus;
    use crate::config::BusConfig;
    use crate::dispatch::{DispatchError, DispatchOutcome};
    use crate::saga_store::{
        ArmedTimeout, InMemorySagaStore, OutboxEntry, SagaInstance, SagaStatus, SagaStore,
        SagaStoreError, SagaTransaction,
    };
    use crate::timeouts::timeout_envelope;

    // ---- messages ----------------------------------------------------------

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: u64,
        total: u64,
    }

    impl Message for OrderPlaced {
        fn message_type() -> &'static str {
            "orders.OrderPlaced"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct PaymentReceived {
        order_id: u64,
        amount: u64,
    }

    impl Message for PaymentReceived {
        fn message_type() -> &'static str {
            "payments.PaymentReceived"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct AuditRequested {
        note: String,
    }

    impl Message for AuditRequested {
        fn message_type() -> &'static str {
            "orders.AuditRequested"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ChargeCard {
        order_id: u64,
        amount: u64,
    }

    impl Message for ChargeCard {
        fn message_type() -> &'static str {
            "payments.ChargeCard"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OrderConfirmed {
        order_id: u64,
    }

    impl Message for OrderConfirmed {
        fn message_type() -> &'static str {
            "orders.OrderConfirmed"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OrderExpired {
        order_id: u64,
    }

    impl Message for OrderExpired {
        fn message_type() -> &'static str {
            "orders.OrderExpired"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ExtendHold {
        order_id: u64,
        ms: u64,
    }

    impl Message for ExtendHold {
        fn message_type() -> &'static str {
            "orders.ExtendHold"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ParcelDelivered {
        order_id: u64,
    }

    impl Message for ParcelDelivered {
        fn message_type() -> &'static str {
            "shipping.ParcelDelivered"
        }
    }

    // ---- saga --------------------------------------------------------------

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderState {
        order_id: u64,
        total: u64,
        paid: u64,
        placements: u32,
        expired: bool,
    }

    #[derive(Debug, Clone, Default)]
    struct OrderSaga {
        timeout: Option<Duration>,
    }

    impl OrderSaga {
        fn with_timeout(timeout: Duration) -> Self {
            Self {
                timeout: Some(timeout),
            }
        }
    }

    impl Saga for OrderSaga {
        type State = OrderState;

        fn declare(&self) -> SagaDeclaration {
            let declaration = SagaDeclaration::new("order")
                .started_by::<OrderPlaced>()
                .handles::<PaymentReceived>()
                .handles::<AuditRequested>()
                .handles::<ExtendHold>();
            match self.timeout {
                Some(timeout) => declaration.with_timeout(timeout),
                None => declaration,
            }
        }

        fn correlate(&self, envelope: &MessageEnvelope) -> Option<CorrelationId> {
            envelope
                .payload()
                .get("order_id")
                .and_then(|v| v.as_u64())
                .map(CorrelationId::from)
        }

        fn handle(
            &self,
            mut state: OrderState,
            envelope: &MessageEnvelope,
            invocation: &mut Invocation,
        ) -> Result<Transition<OrderState>, HandlerError> {
            if envelope.is::<OrderPlaced>() {
                let placed = envelope.decode::<OrderPlaced>()?;
                state.order_id = placed.order_id;
                state.total = placed.total;
                state.placements += 1;
                if state.placements == 1 {
                    invocation.send(
                        "payments",
                        &ChargeCard {
                            order_id: placed.order_id,
                            amount: placed.total,
                        },
                    )?;
                }
                return Ok(Transition::next(state));
            }

            if envelope.is::<PaymentReceived>() {
                let payment = envelope.decode::<PaymentReceived>()?;
                state.paid += payment.amount;
                if state.paid >= state.total {
                    invocation.publish(
                        "orders",
                        "confirmed",
                        &OrderConfirmed {
                            order_id: state.order_id,
                        },
                    )?;
                    return Ok(Transition::complete(state));
                }
                return Ok(Transition::next(state));
            }

            if envelope.is::<ExtendHold>() {
                let hold = envelope.decode::<ExtendHold>()?;
                return Ok(Transition::next(state).arm_timeout(Duration::from_millis(hold.ms)));
            }

            Err(HandlerError::rejected(format!(
                "unexpected message {}",
                envelope.message_type()
            )))
        }

        fn timeout(
            &self,
            mut state: OrderState,
            invocation: &mut Invocation,
        ) -> Result<Transition<OrderState>, HandlerError> {
            state.expired = true;
            invocation.publish(
                "orders",
                "expired",
                &OrderExpired {
                    order_id: state.order_id,
                },
            )?;
            Ok(Transition::complete(state))
        }
    }

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct ShipmentState {
        order_id: u64,
        parcels: u32,
        delivered: u32,
    }

    /// Started by a published confirmation, fed by delivery events.
    struct ShipmentSaga;

    impl Saga for ShipmentSaga {
        type State = ShipmentState;

        fn declare(&self) -> SagaDeclaration {
            SagaDeclaration::new("shipment")
                .started_by_event::<OrderConfirmed>("orders", "confirmed")
                .handles_event::<ParcelDelivered>("shipping", "delivered")
        }

        fn correlate(&self, envelope: &MessageEnvelope) -> Option<CorrelationId> {
            envelope
                .payload()
                .get("order_id")
                .and_then(|v| v.as_u64())
                .map(|id| CorrelationId::new(format!("shipment-{id}")))
        }

        fn handle(
            &self,
            mut state: ShipmentState,
            envelope: &MessageEnvelope,
            _invocation: &mut Invocation,
        ) -> Result<Transition<ShipmentState>, HandlerError> {
            if envelope.is::<OrderConfirmed>() {
                state.order_id = envelope.decode::<OrderConfirmed>()?.order_id;
                state.parcels = 2;
                return Ok(Transition::next(state));
            }

            envelope.decode::<ParcelDelivered>()?;
            state.delivered += 1;
            if state.delivered >= state.parcels {
                return Ok(Transition::complete(state));
            }
            Ok(Transition::next(state))
        }
    }

    // ---- late-committing store -------------------------------------------

    /// Delays the return of one chosen commit after it has landed, so the
    /// transitions that follow reach the scheduler first.
    struct LateCommitStore {
        inner: InMemorySagaStore,
        delay_next: Mutex<Option<Duration>>,
    }

    impl LateCommitStore {
        fn new(inner: InMemorySagaStore) -> Self {
            Self {
                inner,
                delay_next: Mutex::new(None),
            }
        }

        fn delay_next_commit(&self, delay: Duration) {
            *self.delay_next.lock().unwrap() = Some(delay);
        }
    }

    #[async_trait]
    impl SagaStore for LateCommitStore {
        async fn begin(&self) -> Result<Box<dyn SagaTransaction>, SagaStoreError> {
            let delay = self.delay_next.lock().unwrap().take();
            Ok(Box::new(LateCommit {
                inner: self.inner.begin().await?,
                delay,
            }))
        }

        async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, SagaStoreError> {
            self.inner.pending_outbox(limit).await
        }

        async fn mark_dispatched(&self, ids: &[MessageId]) -> Result<(), SagaStoreError> {
            self.inner.mark_dispatched(ids).await
        }

        async fn armed_timeouts(&self) -> Result<Vec<ArmedTimeout>, SagaStoreError> {
            self.inner.armed_timeouts().await
        }
    }

    struct LateCommit {
        inner: Box<dyn SagaTransaction>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl SagaTransaction for LateCommit {
        async fn get_instance(&mut self, id: &CorrelationId) -> Result<SagaInstance, SagaStoreError> {
            self.inner.get_instance(id).await
        }

        async fn save_new(&mut self, instance: SagaInstance) -> Result<(), SagaStoreError> {
            self.inner.save_new(instance).await
        }

        async fn update(&mut self, instance: SagaInstance) -> Result<(), SagaStoreError> {
            self.inner.update(instance).await
        }

        async fn stage_outbox(&mut self, envelopes: &[MessageEnvelope]) -> Result<(), SagaStoreError> {
            self.inner.stage_outbox(envelopes).await
        }

        async fn commit(self: Box<Self>) -> Result<(), SagaStoreError> {
            let this = *self;
            this.inner.commit().await?;
            if let Some(delay) = this.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> Result<(), SagaStoreError> {
            self.inner.rollback().await
        }
    }

    // ---- harness -----------------------------------------------------------

    struct Harness {
        bus: Arc<ServiceBus>,
        store: InMemorySagaStore,
        transport: Arc<InMemoryTransport>,
    }

    impl Harness {
        fn state(&self, order_id: u64) -> Option<OrderState> {
            self.store
                .instance(&CorrelationId::from(order_id))
                .map(|i| serde_json::from_value(i.state).unwrap())
        }
    }

    fn config() -> BusConfig {
        let mut config = BusConfig::default()
            .with_service_name("orders")
            .with_workers(4);
        config.outbox.relay_interval_ms = 20;
        config.saga.retry_backoff_ms = 1;
        config.shutdown_grace_ms = 500;
        config
    }

    async fn start_with(
        config: BusConfig,
        store: InMemorySagaStore,
        saga: OrderSaga,
        configure: impl FnOnce(&ServiceBus),
    ) -> Harness {
        let backend: Arc<dyn SagaStore> = Arc::new(store.clone());
        start_on(config, store, backend, saga, configure).await
    }

    /// Start over `backend`, inspecting committed state through `store`.
    async fn start_on(
        config: BusConfig,
        store: InMemorySagaStore,
        backend: Arc<dyn SagaStore>,
        saga: OrderSaga,
        configure: impl FnOnce(&ServiceBus),
    ) -> Harness {
        let transport = Arc::new(InMemoryTransport::new());
        let bus = ServiceBus::new(config, transport.clone(), backend);
        bus.register_saga(saga).unwrap();
        configure(&bus);
        bus.start().await.unwrap();

        Harness {
            bus: Arc::new(bus),
            store,
            transport,
        }
    }

    async fn start(saga: OrderSaga) -> Harness {
        start_with(config(), InMemorySagaStore::new(), saga, |_| {}).await
    }

    fn placed(order_id: u64, total: u64) -> MessageEnvelope {
        MessageEnvelope::command("orders", &OrderPlaced { order_id, total }).unwrap()
    }

    fn payment(order_id: u64, amount: u64) -> MessageEnvelope {
        MessageEnvelope::command("orders", &PaymentReceived { order_id, amount }).unwrap()
    }

    fn extend(order_id: u64, ms: u64) -> MessageEnvelope {
        MessageEnvelope::command("orders", &ExtendHold { order_id, ms }).unwrap()
    }

    /// Harness over a store whose commits can be made to return late.
    async fn start_late() -> (Harness, Arc<LateCommitStore>) {
        let store = InMemorySagaStore::new();
        let late = Arc::new(LateCommitStore::new(store.clone()));
        let h = start_on(config(), store, late.clone(), OrderSaga::default(), |_| {}).await;
        (h, late)
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    // ---- scenarios ---------------------------------------------------------

    #[tokio::test]
    async fn starter_creates_update_continues_orphan_is_reported() {
        let h = start(OrderSaga::default()).await;

        let report = h.bus.dispatch(&placed(1, 100)).await.unwrap();
        assert_eq!(report.outcome, DispatchOutcome::SagaStarted);
        assert_eq!(report.correlation_id, Some(CorrelationId::from(1u64)));
        assert_eq!(report.saga_type.as_deref(), Some("order"));
        assert_eq!(h.store.instances().len(), 1);

        let report = h.bus.dispatch(&payment(1, 40)).await.unwrap();
        assert_eq!(report.outcome, DispatchOutcome::SagaUpdated);
        assert_eq!(h.store.instances().len(), 1);

        let state = h.state(1).unwrap();
        assert_eq!(state.paid, 40);
        assert_eq!(state.placements, 1);

        let err = h.bus.dispatch(&payment(99, 10)).await.unwrap_err();
        assert!(matches!(err, DispatchError::OrphanedCorrelation { .. }));
        assert!(h.state(99).is_none());

        // The starter's command went out after commit.
        let charges = h.transport.sent_of_type("payments.ChargeCard");
        assert_eq!(charges.len(), 1);
        assert_eq!(charges[0].correlation_id(), Some(&CorrelationId::from(1u64)));

        let stats = h.bus.stats();
        assert_eq!(stats.sagas_created, 1);
        assert_eq!(stats.failed, 1);

        h.bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn completion_publishes_and_freezes_the_instance() {
        let h = start(OrderSaga::default()).await;

        h.bus.dispatch(&placed(3, 50)).await.unwrap();
        let report = h.bus.dispatch(&payment(3, 50)).await.unwrap();
        assert_eq!(report.outcome, DispatchOutcome::SagaCompleted);
        assert_eq!(report.outbound, 1);

        let instance = h.store.instance(&CorrelationId::from(3u64)).unwrap();
        assert_eq!(instance.status, SagaStatus::Completed);
        let version = instance.version;

        // Late payment and a redelivered starter: neither reanimates it.
        let late = h.bus.dispatch(&payment(3, 10)).await.unwrap();
        assert_eq!(late.outcome, DispatchOutcome::Ignored);
        let restart = h.bus.dispatch(&placed(3, 50)).await.unwrap();
        assert_eq!(restart.outcome, DispatchOutcome::Ignored);

        let instance = h.store.instance(&CorrelationId::from(3u64)).unwrap();
        assert_eq!(instance.version, version);
        assert_eq!(h.state(3).unwrap().paid, 50);
        assert_eq!(h.transport.sent_of_type("orders.OrderConfirmed").len(), 1);
        assert_eq!(h.bus.stats().ignored, 2);

        h.bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn redelivered_message_is_applied_once() {
        let h = start(OrderSaga::default()).await;
        h.bus.dispatch(&placed(4, 100)).await.unwrap();

        let pay = payment(4, 25);
        assert_eq!(
            h.bus.dispatch(&pay).await.unwrap().outcome,
            DispatchOutcome::SagaUpdated
        );
        assert_eq!(
            h.bus.dispatch(&pay).await.unwrap().outcome,
            DispatchOutcome::Duplicate
        );

        assert_eq!(h.state(4).unwrap().paid, 25);
        assert_eq!(h.bus.stats().duplicates, 1);

        h.bus.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starters_leave_one_instance() {
        let h = start(OrderSaga::default()).await;

        let first = placed(2, 80);
        let second = placed(2, 80);
        let (a, b) = tokio::join!(
            {
                let bus = h.bus.clone();
                tokio::spawn(async move { bus.dispatch(&first).await })
            },
            {
                let bus = h.bus.clone();
                tokio::spawn(async move { bus.dispatch(&second).await })
            }
        );

        let mut outcomes = vec![a.unwrap().unwrap().outcome, b.unwrap().unwrap().outcome];
        outcomes.sort_by_key(|o| *o == DispatchOutcome::SagaUpdated);
        assert_eq!(
            outcomes,
            vec![DispatchOutcome::SagaStarted, DispatchOutcome::SagaUpdated]
        );

        assert_eq!(h.store.instances().len(), 1);
        let state = h.state(2).unwrap();
        assert_eq!(state.placements, 2);
        assert_eq!(h.transport.sent_of_type("payments.ChargeCard").len(), 1);
        assert_eq!(h.bus.stats().sagas_created, 1);

        h.bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn completion_disarms_pending_timeout() {
        let h = start(OrderSaga::with_timeout(Duration::from_millis(60))).await;
        let id = CorrelationId::from(5u64);

        h.bus.dispatch(&placed(5, 10)).await.unwrap();
        assert!(h.bus.timeouts().deadline(&id).is_some());
        assert!(h.store.instance(&id).unwrap().timeout_deadline.is_some());

        h.bus.dispatch(&payment(5, 10)).await.unwrap();
        assert!(h.bus.timeouts().deadline(&id).is_none());
        assert!(h.store.instance(&id).unwrap().timeout_deadline.is_none());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.bus.timeouts().fired(), 0);
        assert_eq!(h.bus.stats().timeouts_fired, 0);
        assert!(h.transport.sent_of_type("orders.OrderExpired").is_empty());
        assert!(!h.state(5).unwrap().expired);

        h.bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn timeout_fires_once_through_the_ingress() {
        let h = start(OrderSaga::with_timeout(Duration::from_millis(30))).await;
        let id = CorrelationId::from(6u64);

        h.bus.dispatch(&placed(6, 10)).await.unwrap();
        assert!(eventually(|| h.bus.stats().timeouts_fired == 1).await);

        let instance = h.store.instance(&id).unwrap();
        assert_eq!(instance.status, SagaStatus::Completed);
        assert!(instance.timeout_deadline.is_none());
        assert!(h.state(6).unwrap().expired);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.bus.timeouts().fired(), 1);
        assert_eq!(h.transport.sent_of_type("orders.OrderExpired").len(), 1);

        h.bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn timeout_trigger_applies_once_and_stale_ones_are_ignored() {
        let h = start(OrderSaga::with_timeout(Duration::from_secs(60))).await;
        let id = CorrelationId::from(7u64);

        h.bus.dispatch(&placed(7, 10)).await.unwrap();
        let deadline = h.store.instance(&id).unwrap().timeout_deadline.unwrap();

        let stale = timeout_envelope(&id, "order", deadline - chrono::Duration::seconds(1));
        assert_eq!(
            h.bus.dispatch(&stale).await.unwrap().outcome,
            DispatchOutcome::Ignored
        );

        let trigger = timeout_envelope(&id, "order", deadline);
        assert_eq!(
            h.bus.dispatch(&trigger).await.unwrap().outcome,
            DispatchOutcome::SagaCompleted
        );
        assert_eq!(
            h.bus.dispatch(&trigger).await.unwrap().outcome,
            DispatchOutcome::Duplicate
        );
        let again = timeout_envelope(&id, "order", deadline);
        assert_eq!(
            h.bus.dispatch(&again).await.unwrap().outcome,
            DispatchOutcome::Ignored
        );

        assert_eq!(h.bus.timeouts().armed(), 0);
        assert_eq!(h.bus.stats().timeouts_fired, 1);

        let unknown = timeout_envelope(&CorrelationId::from("nope"), "order", deadline);
        assert_eq!(
            h.bus.dispatch(&unknown).await.unwrap().outcome,
            DispatchOutcome::Ignored
        );
        let wrong_saga = timeout_envelope(&id, "shipment", deadline);
        assert!(matches!(
            h.bus.dispatch(&wrong_saga).await,
            Err(DispatchError::Unroutable(_))
        ));

        h.bus.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn late_arm_from_an_older_commit_keeps_the_newer_deadline() {
        let (h, late) = start_late().await;
        let id = CorrelationId::from(21u64);
        h.bus.dispatch(&placed(21, 10)).await.unwrap();

        late.delay_next_commit(Duration::from_millis(300));
        let earlier = {
            let bus = h.bus.clone();
            tokio::spawn(async move { bus.dispatch(&extend(21, 100)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Commits after the earlier one but reaches the scheduler first.
        let later = h.bus.dispatch(&extend(21, 1000)).await.unwrap();
        assert_eq!(later.outcome, DispatchOutcome::SagaUpdated);
        let persisted = h.store.instance(&id).unwrap().timeout_deadline.unwrap();

        assert_eq!(earlier.await.unwrap().unwrap().outcome, DispatchOutcome::SagaUpdated);
        assert_eq!(h.bus.timeouts().deadline(&id), Some(persisted));

        assert!(eventually(|| h.bus.stats().timeouts_fired == 1).await);
        assert!(h.state(21).unwrap().expired);
        assert_eq!(h.bus.timeouts().fired(), 1);

        h.bus.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn late_arm_cannot_revive_a_completed_instance() {
        let (h, late) = start_late().await;
        let id = CorrelationId::from(22u64);
        h.bus.dispatch(&placed(22, 10)).await.unwrap();

        late.delay_next_commit(Duration::from_millis(300));
        let earlier = {
            let bus = h.bus.clone();
            tokio::spawn(async move { bus.dispatch(&extend(22, 50)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let done = h.bus.dispatch(&payment(22, 10)).await.unwrap();
        assert_eq!(done.outcome, DispatchOutcome::SagaCompleted);
        earlier.await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.bus.timeouts().armed(), 0);
        assert_eq!(h.bus.timeouts().fired(), 0);
        assert_eq!(h.bus.stats().timeouts_fired, 0);
        assert!(!h.state(22).unwrap().expired);
        assert_eq!(h.store.instance(&id).unwrap().status, SagaStatus::Completed);

        h.bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn stale_trigger_rearms_the_persisted_deadline() {
        let h = start(OrderSaga::default()).await;
        let id = CorrelationId::from(23u64);

        h.bus.dispatch(&placed(23, 10)).await.unwrap();
        h.bus.dispatch(&extend(23, 60_000)).await.unwrap();
        let persisted = h.store.instance(&id).unwrap().timeout_deadline.unwrap();
        h.bus.timeouts().shutdown();
        assert_eq!(h.bus.timeouts().deadline(&id), None);

        let stale = timeout_envelope(&id, "order", persisted - chrono::Duration::seconds(1));
        assert_eq!(
            h.bus.dispatch(&stale).await.unwrap().outcome,
            DispatchOutcome::Ignored
        );
        assert_eq!(h.bus.timeouts().deadline(&id), Some(persisted));

        h.bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn event_keyed_saga_starts_and_continues_by_topic() {
        let h = start_with(config(), InMemorySagaStore::new(), OrderSaga::default(), |bus| {
            bus.register_saga(ShipmentSaga).unwrap();
        })
        .await;
        let id = CorrelationId::from("shipment-30");

        let confirmed = MessageEnvelope::event("orders", "confirmed", &OrderConfirmed { order_id: 30 }).unwrap();
        let started = h.bus.dispatch(&confirmed).await.unwrap();
        assert_eq!(started.outcome, DispatchOutcome::SagaStarted);
        assert_eq!(started.saga_type.as_deref(), Some("shipment"));
        assert_eq!(started.correlation_id, Some(id.clone()));

        let delivered = || MessageEnvelope::event("shipping", "delivered", &ParcelDelivered { order_id: 30 }).unwrap();
        assert_eq!(
            h.bus.dispatch(&delivered()).await.unwrap().outcome,
            DispatchOutcome::SagaUpdated
        );

        // Same message type on another topic, or sent as a command, has no route.
        let lost = MessageEnvelope::event("shipping", "lost", &ParcelDelivered { order_id: 30 }).unwrap();
        assert!(matches!(
            h.bus.dispatch(&lost).await,
            Err(DispatchError::Unroutable(_))
        ));
        let direct = MessageEnvelope::command("shipping", &ParcelDelivered { order_id: 30 }).unwrap();
        assert!(matches!(
            h.bus.dispatch(&direct).await,
            Err(DispatchError::Unroutable(_))
        ));

        assert_eq!(
            h.bus.dispatch(&delivered()).await.unwrap().outcome,
            DispatchOutcome::SagaCompleted
        );
        let instance = h.store.instance(&id).unwrap();
        assert_eq!(instance.saga_type, "shipment");
        assert_eq!(instance.status, SagaStatus::Completed);
        let state: ShipmentState = serde_json::from_value(instance.state).unwrap();
        assert_eq!(state.delivered, 2);
        assert_eq!(state.order_id, 30);

        h.bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn plain_handler_failure_leaves_saga_untouched() {
        let audited = Arc::new(AtomicUsize::new(0));
        let seen = audited.clone();
        let h = start_with(config(), InMemorySagaStore::new(), OrderSaga::default(), |bus| {
            bus.handle_message::<PaymentReceived, _>(move |_, payment| {
                if payment.amount == 0 {
                    return Err(HandlerError::validation("zero payment"));
                }
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        })
        .await;

        h.bus.dispatch(&placed(8, 100)).await.unwrap();
        let version = h.store.instance(&CorrelationId::from(8u64)).unwrap().version;

        let err = h.bus.dispatch(&payment(8, 0)).await.unwrap_err();
        assert_eq!(err, DispatchError::Handler(HandlerError::validation("zero payment")));
        assert_eq!(
            h.store.instance(&CorrelationId::from(8u64)).unwrap().version,
            version
        );

        h.bus.dispatch(&payment(8, 30)).await.unwrap();
        assert_eq!(audited.load(Ordering::SeqCst), 1);
        assert_eq!(h.state(8).unwrap().paid, 30);

        h.bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unroutable_and_uncorrelated_messages_are_reported() {
        let h = start(OrderSaga::default()).await;

        let confirmed = MessageEnvelope::command("orders", &OrderConfirmed { order_id: 1 }).unwrap();
        assert!(matches!(
            h.bus.dispatch(&confirmed).await,
            Err(DispatchError::Unroutable(_))
        ));

        let audit = MessageEnvelope::command(
            "orders",
            &AuditRequested {
                note: "who paid?".to_string(),
            },
        )
        .unwrap();
        let err = h.bus.dispatch(&audit).await.unwrap_err();
        assert!(matches!(err, DispatchError::MissingCorrelation(_)));
        assert_eq!(err.kind(), FailureKind::MissingCorrelation);

        h.bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn ingest_reports_failures_to_the_submitter() {
        let h = start(OrderSaga::default()).await;

        h.bus.ingest(placed(9, 20)).await.unwrap();
        let failure = h.bus.ingest(payment(99, 5)).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Orphaned);

        let stats = h.bus.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);

        h.bus.shutdown().await.unwrap();
        let failure = h.bus.ingest(placed(10, 20)).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::ShuttingDown);
    }

    #[tokio::test]
    async fn published_events_loop_back_to_local_subscribers() {
        let confirmations = Arc::new(AtomicUsize::new(0));
        let counter = confirmations.clone();
        let h = start_with(config(), InMemorySagaStore::new(), OrderSaga::default(), |bus| {
            bus.handle_event::<OrderConfirmed, _>("orders", "confirmed", move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        })
        .await;

        h.bus.dispatch(&placed(11, 5)).await.unwrap();
        h.bus.dispatch(&payment(11, 5)).await.unwrap();

        assert!(eventually(|| confirmations.load(Ordering::SeqCst) == 1).await);
        assert!(h.transport.failures().is_empty());

        h.bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn outbox_relay_delivers_after_transport_outage() {
        let h = start(OrderSaga::default()).await;

        h.transport.fail_next(1);
        let report = h.bus.dispatch(&placed(12, 70)).await.unwrap();
        assert_eq!(report.outcome, DispatchOutcome::SagaStarted);
        assert!(h.state(12).is_some());

        assert!(eventually(|| h.transport.sent_of_type("payments.ChargeCard").len() == 1).await);
        assert!(eventually(|| h.bus.stats().outbox_relayed == 1).await);
        assert!(h.store.pending_outbox(10).await.unwrap().is_empty());

        h.bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn restart_rearms_persisted_timeouts() {
        let store = InMemorySagaStore::new();
        let saga = OrderSaga::with_timeout(Duration::from_millis(80));

        let first = start_with(config(), store.clone(), saga.clone(), |_| {}).await;
        first.bus.dispatch(&placed(13, 10)).await.unwrap();
        first.bus.shutdown().await.unwrap();
        assert_eq!(first.bus.timeouts().armed(), 0);

        let second = start_with(config(), store, saga, |_| {}).await;
        assert!(eventually(|| second.bus.stats().timeouts_fired == 1).await);
        assert!(second.state(13).unwrap().expired);
        assert_eq!(second.transport.sent_of_type("orders.OrderExpired").len(), 1);

        second.bus.shutdown().await.unwrap();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn concurrent_payments_fold_into_one_state(amounts in prop::collection::vec(1u64..50, 1..8)) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();

            let expected: u64 = amounts.iter().sum();
            let count = amounts.len();
            let (paid, applied) = runtime.block_on(async move {
                let mut config = config();
                config.saga.max_attempts = 100;
                let h = start_with(config, InMemorySagaStore::new(), OrderSaga::default(), |_| {}).await;
                h.bus.dispatch(&placed(42, u64::MAX)).await.unwrap();

                let tasks: Vec<_> = amounts
                    .into_iter()
                    .map(|amount| {
                        let bus = h.bus.clone();
                        tokio::spawn(async move { bus.dispatch(&payment(42, amount)).await })
                    })
                    .collect();
                for task in tasks {
                    task.await.unwrap().unwrap();
                }

                let instance = h.store.instance(&CorrelationId::from(42u64)).unwrap();
                h.bus.shutdown().await.unwrap();
                let state: OrderState = serde_json::from_value(instance.state).unwrap();
                (state.paid, instance.applied_messages.len())
            });

            prop_assert_eq!(paid, expected);
            prop_assert_eq!(applied, count + 1);
        }
    }
}
