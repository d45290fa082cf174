use std::sync::Arc;

use crate::domain::settings::MonitorSettings;
use crate::infra::clock::Clock;
use crate::infra::events::JobEventBus;
use crate::infra::metrics::Metrics;
use crate::infra::store::JobStore;

/// ポーラーとリカバリが共有する依存一式
#[derive(Clone)]
pub struct MonitorContext {
    pub store: Arc<dyn JobStore>,
    pub clock: Arc<dyn Clock>,
    pub bus: JobEventBus,
    pub metrics: Arc<Metrics>,
    pub settings: MonitorSettings,
}

impl MonitorContext {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, settings: MonitorSettings) -> Self {
        Self {
            store,
            clock,
            bus: JobEventBus::default(),
            metrics: Arc::new(Metrics::new()),
            settings,
        }
    }
}
