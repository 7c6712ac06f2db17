// Attempt-level cost accounting. Shared by the orchestrator workers, so all
// mutation goes through one mutex; summaries are computed on demand.

use std::sync::Mutex;
use crate::data_structures::CostSummary;

#[derive(Debug, Clone)]
struct CostEvent {
    batch_id: String,
    operation: String,
    provider: String,
    cost_usd: f64,
}

#[derive(Default)]
pub struct CostAccountant {
    events: Mutex<Vec<CostEvent>>,
}

impl CostAccountant {
    pub fn new() -> Self {
        CostAccountant::default()
    }

    /// Record one cost event. Failed attempts are recorded too: failure is
    /// not free.
    pub fn record(&self, batch_id: &str, operation: &str, provider: &str, cost_usd: f64) {
        let mut events = self.events.lock().unwrap();
        events.push(CostEvent {
            batch_id: batch_id.to_string(),
            operation: operation.to_string(),
            provider: provider.to_string(),
            cost_usd,
        });
    }

    pub fn summary(&self, batch_id: &str) -> CostSummary {
        let events = self.events.lock().unwrap();
        let mut summary = CostSummary::default();
        for event in events.iter().filter(|e| e.batch_id == batch_id) {
            summary.total_usd += event.cost_usd;
            *summary.by_operation.entry(event.operation.clone()).or_insert(0.0) +=
                event.cost_usd;
            *summary.by_provider.entry(event.provider.clone()).or_insert(0.0) +=
                event.cost_usd;
            summary.count += 1;
        }
        summary
    }

    /// Drop all events for a finished batch so the accountant does not grow
    /// without bound in daemon mode.
    pub fn forget(&self, batch_id: &str) {
        let mut events = self.events.lock().unwrap();
        events.retain(|e| e.batch_id != batch_id);
    }
}
