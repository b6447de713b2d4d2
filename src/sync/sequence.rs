//! Human-readable document numbers (invoices, purchase orders).
//!
//! Numbers come from an atomic counter transaction and are dense while the
//! backend cooperates. Under persistent contention or backend failure the
//! generator degrades to a timestamp+random identifier with an `ERR` marker
//! instead of failing the surrounding operation; callers must not assume
//! sequence numbers are gap-free.

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use tokio::time::{sleep, Duration};
use tracing::warn;

use crate::store::{collections, DocumentStore};

// Numbers are zero-padded to 6 digits after the prefix.
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_MS: u64 = 50;

/// Well-known sequence names.
pub const SEQ_INVOICE: &str = "invoice";
pub const SEQ_PURCHASE_ORDER: &str = "purchase-order";

fn prefix_for(sequence: &str) -> String {
    match sequence {
        SEQ_INVOICE => "I".to_string(),
        SEQ_PURCHASE_ORDER => "PO".to_string(),
        other => other
            .chars()
            .next()
            .map(|c| c.to_ascii_uppercase().to_string())
            .unwrap_or_else(|| "X".to_string()),
    }
}

#[derive(Clone)]
pub struct SequenceGenerator {
    store: Arc<dyn DocumentStore>,
}

impl SequenceGenerator {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Next formatted number for `sequence`, e.g. `I000042`.
    ///
    /// Transient counter failures are retried a few times with backoff; after
    /// that the call returns a degraded identifier (`I ERR yymmddhhmmss rrr`,
    /// without the spaces) rather than an error.
    pub async fn next(&self, sequence: &str) -> String {
        let prefix = prefix_for(sequence);
        for attempt in 1..=MAX_ATTEMPTS {
            match self
                .store
                .fetch_and_increment(collections::COUNTERS, sequence)
                .await
            {
                Ok(n) => return format!("{prefix}{n:06}"),
                Err(e) => {
                    warn!(
                        sequence,
                        attempt,
                        error = %e,
                        "counter transaction failed"
                    );
                    if attempt < MAX_ATTEMPTS {
                        sleep(Duration::from_millis(RETRY_BASE_MS * attempt as u64)).await;
                    }
                }
            }
        }

        let stamp = Utc::now().format("%y%m%d%H%M%S");
        let salt: u16 = rand::thread_rng().gen_range(0..1000);
        let fallback = format!("{prefix}ERR{stamp}{salt:03}");
        warn!(sequence, fallback, "degrading to non-sequential identifier");
        fallback
    }
}
