use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::checkout::model::PaymentMethod;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a sender together with the receiving end of a bounded channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Queues an event without waiting. A full or closed channel drops the
    /// event with a warning.
    pub fn emit(&self, event: Event) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(?event, "event channel is full, dropping event");
            }
            Err(TrySendError::Closed(event)) => {
                warn!(?event, "event channel is closed, dropping event");
            }
        }
    }
}

/// Checkout lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderPlaced {
        order_ref: String,
        order_number: String,
        method: PaymentMethod,
        total: u64,
        at: DateTime<Utc>,
    },
    CardOrderPending {
        order_ref: String,
        order_number: String,
    },
    BankTransferConfirmed {
        order_ref: String,
        elapsed_seconds: u64,
        optimistic: bool,
    },
    BankTransferTimedOut {
        order_ref: String,
    },
    GatewayCallbackRejected {
        order_ref: Option<String>,
    },
    CardPaymentSucceeded {
        order_ref: String,
        order_number: String,
        transaction_no: Option<String>,
    },
    CardPaymentFailed {
        order_ref: String,
        response_code: String,
    },
    CheckoutAbandoned {
        order_ref: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_survives_closed_receiver() {
        let (sender, rx) = EventSender::channel(1);
        drop(rx);
        sender.emit(Event::CheckoutAbandoned {
            order_ref: "ORD1".into(),
        });
        sender.emit(Event::BankTransferTimedOut {
            order_ref: "ORD1".into(),
        });
    }

    #[test]
    fn emit_drops_events_when_channel_is_full() {
        let (sender, mut rx) = EventSender::channel(1);
        sender.emit(Event::CheckoutAbandoned {
            order_ref: "ORD1".into(),
        });
        sender.emit(Event::CheckoutAbandoned {
            order_ref: "ORD2".into(),
        });

        assert_eq!(
            rx.try_recv().ok(),
            Some(Event::CheckoutAbandoned {
                order_ref: "ORD1".into()
            })
        );
        assert!(rx.try_recv().is_err());
    }
}
