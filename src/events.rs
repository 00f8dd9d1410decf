//! Outbound confirmation event stream
//!
//! Terminal outcomes are published to upstream consumers through
//! subscriptions with at-least-once semantics: one event is outstanding per
//! subscription at a time, the next is delivered only after the previous is
//! acked, and a nack closes the subscription. Publishers only hand events to
//! the dispatcher after the backing row is durably committed.

use crate::error::{EngineError, EngineResult};
use crate::types::{PubTxStatus, TxErrorKind, TxId};

use ethers::types::{Address, H256};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

/// Terminal outcome of a public transaction
#[derive(Debug, Clone)]
pub struct TxOutcomeEvent {
    pub tx_id: TxId,
    pub signer: Address,
    pub nonce: u64,
    pub status: PubTxStatus,
    pub hash: Option<H256>,
    pub block_number: Option<u64>,
    pub error: Option<TxErrorKind>,
}

/// A single delivered event awaiting acknowledgement
pub struct Delivery {
    pub event: TxOutcomeEvent,
    ack_tx: oneshot::Sender<bool>,
}

impl Delivery {
    /// Confirm processing; the subscription will receive the next event
    pub fn ack(self) {
        let _ = self.ack_tx.send(true);
    }

    /// Reject processing; the subscription is closed
    pub fn nack(self) {
        let _ = self.ack_tx.send(false);
    }
}

/// Consumer side of a subscription
pub struct Subscription {
    rx: mpsc::Receiver<Delivery>,
}

impl Subscription {
    /// Receive the next delivery. Returns a closed error once the
    /// subscription has been nacked or the dispatcher has shut down.
    pub async fn recv(&mut self) -> EngineResult<Delivery> {
        self.rx.recv().await.ok_or(EngineError::SubscriptionClosed)
    }
}

struct SubscriberState {
    tx: mpsc::Sender<Delivery>,
    queue: VecDeque<TxOutcomeEvent>,
    // A delivery is in flight and unacked
    busy: bool,
    closed: bool,
}

/// Fan-out dispatcher for terminal transaction outcomes
#[derive(Default)]
pub struct EventDispatcher {
    subscribers: Mutex<Vec<Arc<Mutex<SubscriberState>>>>,
    wake: Notify,
}

impl EventDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a new subscription. Events published afterwards are queued for it.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::channel(1);
        let state = Arc::new(Mutex::new(SubscriberState {
            tx,
            queue: VecDeque::new(),
            busy: false,
            closed: false,
        }));
        self.subscribers.lock().unwrap().push(state.clone());

        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.drive_subscription(state).await;
        });

        Subscription { rx }
    }

    /// Publish an event to every open subscription.
    ///
    /// Callers must only invoke this after the event's backing state is
    /// committed; the dispatcher adds no durability of its own.
    pub fn publish(&self, event: TxOutcomeEvent) {
        let subscribers = self.subscribers.lock().unwrap();
        for sub in subscribers.iter() {
            let mut state = sub.lock().unwrap();
            if !state.closed {
                state.queue.push_back(event.clone());
            }
        }
        drop(subscribers);
        self.wake.notify_waiters();
        debug!(
            "Published outcome event for {} ({})",
            event.tx_id, event.status
        );
    }

    async fn drive_subscription(self: Arc<Self>, state: Arc<Mutex<SubscriberState>>) {
        loop {
            // Register for wakeups before inspecting the queue so a publish
            // racing with the empty check cannot be missed
            let notified = self.wake.notified();
            let next = {
                let mut s = state.lock().unwrap();
                if s.closed {
                    return;
                }
                if s.busy {
                    None
                } else {
                    s.queue.pop_front().map(|event| {
                        s.busy = true;
                        (event, s.tx.clone())
                    })
                }
            };

            match next {
                Some((event, tx)) => {
                    let (ack_tx, ack_rx) = oneshot::channel();
                    let delivery = Delivery { event, ack_tx };

                    if tx.send(delivery).await.is_err() {
                        // Receiver dropped with a delivery outstanding
                        state.lock().unwrap().closed = true;
                        return;
                    }

                    match ack_rx.await {
                        Ok(true) => {
                            state.lock().unwrap().busy = false;
                        }
                        Ok(false) => {
                            warn!("Subscription nacked, closing");
                            state.lock().unwrap().closed = true;
                            return;
                        }
                        Err(_) => {
                            // Delivery dropped without ack: subscriber went
                            // away mid-processing
                            state.lock().unwrap().closed = true;
                            return;
                        }
                    }
                }
                None => {
                    notified.await;
                }
            }
        }
    }
}
