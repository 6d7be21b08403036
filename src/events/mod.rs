use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a sender together with its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends a notification for an operation that has already committed.
    /// A closed channel only produces a warning.
    pub async fn send_or_log(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.send(event).await {
            warn!(event = name, error = %e, "Dropping domain notification");
        }
    }
}

/// Domain notifications raised by the allocation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// Quantity dropped to or below the row's low-stock threshold.
    LowStock {
        inventory_id: i64,
        product_variant_id: Option<i64>,
        store_id: i64,
        quantity: i32,
        threshold: i32,
    },
    StockExhausted {
        inventory_id: i64,
        product_variant_id: Option<i64>,
        store_id: i64,
    },
    /// A single movement reached the configured anomaly size.
    AnomalyDetected {
        inventory_id: i64,
        product_variant_id: Option<i64>,
        store_id: i64,
        quantity: i32,
        movement: i32,
        detail: String,
    },
    BackordersAllocated {
        purchase_item_id: Option<i64>,
        product_variant_id: i64,
        total_allocated: i32,
        order_item_ids: Vec<i64>,
    },
    TransferRequested {
        transfer_id: i64,
        order_item_id: Option<i64>,
        from_store_id: i64,
        to_store_id: i64,
        quantity: i32,
    },
    PriorityScoreAdjusted {
        order_item_id: i64,
        old_score: Option<f64>,
        new_score: f64,
        adjusted_by: Uuid,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::LowStock { .. } => "low_stock",
            Event::StockExhausted { .. } => "stock_exhausted",
            Event::AnomalyDetected { .. } => "anomaly_detected",
            Event::BackordersAllocated { .. } => "backorders_allocated",
            Event::TransferRequested { .. } => "transfer_requested",
            Event::PriorityScoreAdjusted { .. } => "priority_score_adjusted",
        }
    }
}

/// An event as it leaves the engine, stamped with its emission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: Event,
    pub emitted_at: DateTime<Utc>,
}

impl From<Event> for EventEnvelope {
    fn from(event: Event) -> Self {
        Self {
            event,
            emitted_at: Utc::now(),
        }
    }
}

/// Drains the notification channel and logs each event. External alerting
/// hooks in by consuming the receiver itself instead of calling this.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::LowStock {
                store_id,
                product_variant_id,
                quantity,
                threshold,
                ..
            } => {
                warn!(
                    store_id,
                    product_variant_id = ?product_variant_id,
                    quantity,
                    threshold,
                    "Low stock"
                );
            }
            Event::StockExhausted {
                store_id,
                product_variant_id,
                ..
            } => {
                warn!(store_id, product_variant_id = ?product_variant_id, "Stock exhausted");
            }
            Event::AnomalyDetected { detail, .. } => {
                warn!(detail = %detail, "Inventory anomaly detected");
            }
            other => {
                let envelope = EventEnvelope::from(other.clone());
                match serde_json::to_string(&envelope) {
                    Ok(json) => info!(event = other.name(), payload = %json, "Domain event"),
                    Err(_) => info!(event = other.name(), "Domain event"),
                }
            }
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_or_log_survives_a_closed_channel() {
        let (sender, rx) = EventSender::channel(1);
        drop(rx);
        sender
            .send_or_log(Event::StockExhausted {
                inventory_id: 1,
                product_variant_id: Some(1),
                store_id: 1,
            })
            .await;
        assert!(sender
            .send(Event::StockExhausted {
                inventory_id: 1,
                product_variant_id: None,
                store_id: 1,
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (sender, mut rx) = EventSender::channel(4);
        sender
            .send(Event::LowStock {
                inventory_id: 1,
                product_variant_id: Some(2),
                store_id: 3,
                quantity: 1,
                threshold: 5,
            })
            .await
            .unwrap();
        sender
            .send(Event::StockExhausted {
                inventory_id: 1,
                product_variant_id: Some(2),
                store_id: 3,
            })
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().name(), "low_stock");
        assert_eq!(rx.recv().await.unwrap().name(), "stock_exhausted");
    }
}
