//! Cost ledger fed by the marketplace's payment feed.

use std::collections::HashMap;

use provbench_core::{CostUpdate, PaymentEvent, ProviderId, RunId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Costs accumulated over one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunLedger {
    total: f64,
    costs: HashMap<ProviderId, Option<f64>>,
}

impl RunLedger {
    /// Apply one payment. The provider's entry takes the latest amount; the
    /// total adds it. An unparsable amount leaves the entry undefined.
    pub fn record(&mut self, event: &PaymentEvent) {
        match event.parse_amount() {
            Ok(amount) => {
                self.total += amount;
                self.costs.insert(event.provider_id.clone(), Some(amount));
                debug!(provider_id = %event.provider_id, amount, total = self.total, "Payment accepted");
            }
            Err(e) => {
                warn!(provider_id = %event.provider_id, error = %e, "Payment with unusable amount");
                self.costs.insert(event.provider_id.clone(), None);
            }
        }
    }

    /// Sum of every parsed payment.
    pub fn total(&self) -> f64 {
        self.total
    }

    /// Latest cost of a provider. `Some(None)` if the provider was paid an
    /// unusable amount.
    pub fn cost(&self, provider_id: &ProviderId) -> Option<Option<f64>> {
        self.costs.get(provider_id).copied()
    }

    /// Number of providers with an entry.
    pub fn len(&self) -> usize {
        self.costs.len()
    }

    /// Returns true if no payment was seen.
    pub fn is_empty(&self) -> bool {
        self.costs.is_empty()
    }

    /// One update per provider with a defined cost, ordered by provider.
    /// Undefined costs are logged and left out.
    pub fn bulk_updates(&self, run_id: &RunId) -> Vec<CostUpdate> {
        let mut updates: Vec<CostUpdate> = self
            .costs
            .iter()
            .filter_map(|(provider_id, cost)| match cost {
                Some(cost) => Some(CostUpdate {
                    run_id: run_id.clone(),
                    provider_id: provider_id.clone(),
                    cost: *cost,
                }),
                None => {
                    error!(provider_id = %provider_id, "Cost undefined - leaving provider out of cost updates");
                    None
                }
            })
            .collect();
        updates.sort_by(|a, b| a.provider_id.as_str().cmp(b.provider_id.as_str()));
        updates
    }
}

/// Single consumer of the payment feed.
///
/// The ledger runs in its own task until the feed closes or [`stop`] is
/// called. Events already queued when stopping are still applied.
///
/// [`stop`]: CostLedger::stop
pub struct CostLedger {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<RunLedger>,
}

impl CostLedger {
    /// Start consuming the feed.
    pub fn spawn(mut feed: mpsc::Receiver<PaymentEvent>) -> Self {
        let (stop, mut stopped) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ledger = RunLedger::default();
            loop {
                tokio::select! {
                    event = feed.recv() => match event {
                        Some(event) => ledger.record(&event),
                        None => {
                            debug!("Payment feed closed");
                            break;
                        }
                    },
                    _ = &mut stopped => {
                        while let Ok(event) = feed.try_recv() {
                            ledger.record(&event);
                        }
                        break;
                    }
                }
            }
            ledger
        });
        Self { stop, handle }
    }

    /// Stop consuming and return the accumulated costs.
    pub async fn stop(self) -> RunLedger {
        // The ledger task may already be done if the feed closed.
        let _ = self.stop.send(());
        match self.handle.await {
            Ok(ledger) => {
                info!(total_cost = ledger.total(), providers = ledger.len(), "Cost ledger stopped");
                ledger
            }
            Err(e) => {
                error!(error = %e, "Cost ledger task failed - costs lost");
                RunLedger::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paid(provider: &str, amount: &str) -> PaymentEvent {
        PaymentEvent::new(ProviderId::new(provider), amount)
    }

    #[test]
    fn test_last_write_wins_and_total_sums() {
        let mut ledger = RunLedger::default();
        ledger.record(&paid("p1", "0.5"));
        ledger.record(&paid("p1", "0.25"));
        ledger.record(&paid("p2", "1"));

        assert_eq!(ledger.cost(&ProviderId::new("p1")), Some(Some(0.25)));
        assert!((ledger.total() - 1.75).abs() < 1e-9);
    }

    #[test]
    fn test_undefined_cost_is_left_out() {
        let mut ledger = RunLedger::default();
        ledger.record(&paid("p2", "0.1"));
        ledger.record(&paid("p1", "not-a-number"));

        let updates = ledger.bulk_updates(&RunId::new("7"));
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].provider_id, ProviderId::new("p2"));
        assert_eq!(updates[0].run_id, RunId::new("7"));
        assert_eq!(ledger.cost(&ProviderId::new("p1")), Some(None));
    }

    #[tokio::test]
    async fn test_stop_applies_queued_events() {
        let (tx, rx) = mpsc::channel(16);
        let ledger = CostLedger::spawn(rx);

        tx.send(paid("p1", "0.1")).await.unwrap();
        tx.send(paid("p1", "0.2")).await.unwrap();
        tx.send(paid("p2", "0.3")).await.unwrap();

        let ledger = ledger.stop().await;
        assert_eq!(ledger.len(), 2);
        assert!((ledger.total() - 0.6).abs() < 1e-9);
        assert_eq!(ledger.cost(&ProviderId::new("p1")), Some(Some(0.2)));
    }

    #[tokio::test]
    async fn test_closed_feed_ends_ledger() {
        let (tx, rx) = mpsc::channel(4);
        let ledger = CostLedger::spawn(rx);
        tx.send(paid("p1", "2")).await.unwrap();
        drop(tx);

        let ledger = ledger.stop().await;
        assert_eq!(ledger.total(), 2.0);
    }
}
