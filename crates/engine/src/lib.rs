//! Bus runtime: registry, saga store, timeouts, dispatch and the façade.

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod outbox;
pub mod registry;
pub mod saga_store;
pub mod stats;
pub mod timeouts;
pub mod worker;

mod integration_tests;

pub use bus::{BusError, ServiceBus};
pub use config::{BusConfig, LogFormat, StoreBackend};
pub use dispatch::{DispatchError, DispatchOutcome, DispatchReport, DispatchSettings, Dispatcher};
pub use registry::{HandlerRegistry, RegistryError, RoutingTable};
pub use saga_store::{
    InMemorySagaStore, PostgresSagaStore, SagaInstance, SagaStatus, SagaStore, SagaStoreError,
    SagaTransaction,
};
pub use stats::{BusStats, BusStatsSnapshot};
pub use timeouts::TimeoutScheduler;
