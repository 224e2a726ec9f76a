use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
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

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is closed.
    /// Event delivery is best-effort; the durable record is the database.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("Event dropped: {}", e);
        }
    }
}

// The events this core emits. Consumers hang off the processing loop below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Order lifecycle
    OrderCreated(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    CheckoutCompleted {
        payment_intent_id: String,
        order_ids: Vec<Uuid>,
    },

    // Cart lifecycle
    CartItemAdded {
        owner_key: String,
        product_id: Uuid,
        quantity: i32,
    },
    CartItemUpdated {
        owner_key: String,
        item_id: Uuid,
        quantity: i32,
    },
    CartItemRemoved {
        owner_key: String,
        item_id: Uuid,
    },
    CartCleared {
        owner_key: String,
    },
    ReservationEvicted {
        owner_key: String,
        item_id: Uuid,
        product_id: Uuid,
        reservation_date: String,
        reservation_time: String,
    },
}

// Function to process incoming events and distribute them to interested consumers.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderCreated(order_id) => {
                info!(order_id = %order_id, "order created");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(
                    order_id = %order_id,
                    from = %old_status,
                    to = %new_status,
                    "order status changed"
                );
            }
            Event::CheckoutCompleted {
                payment_intent_id,
                order_ids,
            } => {
                info!(
                    payment_intent_id = %payment_intent_id,
                    order_count = order_ids.len(),
                    "checkout completed"
                );
            }
            Event::ReservationEvicted {
                owner_key,
                product_id,
                reservation_date,
                reservation_time,
                ..
            } => {
                info!(
                    owner_key = %owner_key,
                    product_id = %product_id,
                    date = %reservation_date,
                    time = %reservation_time,
                    "reservation evicted from cart"
                );
            }
            other => {
                info!("Received event: {:?}", other);
            }
        }
    }

    error!("Event channel closed; processing loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers_event() {
        let (tx, mut rx) = mpsc::channel(8);
        let sender = EventSender::new(tx);

        sender.send(Event::OrderCreated(Uuid::new_v4())).await.ok();

        let received = rx.recv().await;
        assert!(matches!(received, Some(Event::OrderCreated(_))));
    }

    #[tokio::test]
    async fn send_or_log_swallows_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);

        // Must not panic or return an error to the caller
        sender
            .send_or_log(Event::CartCleared {
                owner_key: "user-1".into(),
            })
            .await;
    }
}
