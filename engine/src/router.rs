//! Room Router
//!
//! Fans inbound deliveries out to one worker task per room. Each worker owns
//! its room's state, so readings of a room are handled strictly in arrival
//! order while different rooms progress independently.

use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::reading::{InboundReading, RawReading};
use chrono::{DateTime, Utc};
use roomwatch_io::{Acknowledge, Delivery};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// What [`RoomRouter::route`] did with a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Handed to the room's worker; acknowledged once handled
    Queued,
    /// Undecodable; acknowledged and dropped
    Rejected,
}

struct Job {
    reading: RawReading,
    received_at: DateTime<Utc>,
    ack: Box<dyn Acknowledge>,
}

pub struct RoomRouter {
    dispatcher: Arc<Dispatcher>,
    rooms: HashMap<String, mpsc::UnboundedSender<Job>>,
    workers: JoinSet<()>,
    acks: JoinSet<()>,
    outcome_tx: Option<mpsc::UnboundedSender<DispatchOutcome>>,
}

impl RoomRouter {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            rooms: HashMap::new(),
            workers: JoinSet::new(),
            acks: JoinSet::new(),
            outcome_tx: None,
        }
    }

    /// Router that also reports every handled reading
    pub fn with_outcomes(dispatcher: Arc<Dispatcher>) -> (Self, mpsc::UnboundedReceiver<DispatchOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut router = Self::new(dispatcher);
        router.outcome_tx = Some(tx);
        (router, rx)
    }

    /// Route a delivery stamped with the current time
    pub fn route(&mut self, delivery: Delivery) -> Routed {
        self.route_at(delivery, Utc::now())
    }

    /// Route a delivery with an explicit arrival time.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn route_at(&mut self, delivery: Delivery, received_at: DateTime<Utc>) -> Routed {
        let Delivery { topic, payload, ack } = delivery;
        self.reap_acks();

        let inbound = match InboundReading::decode(&topic, &payload) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!(%topic, "Dropping message: {}", e);
                self.acks.spawn(async move {
                    if let Err(e) = ack.ack().await {
                        tracing::warn!("Failed to acknowledge dropped message: {}", e);
                    }
                });
                return Routed::Rejected;
            }
        };

        let job = Job {
            reading: inbound.reading,
            received_at,
            ack,
        };

        let job = match self.rooms.get(&inbound.room_id) {
            Some(tx) => match tx.send(job) {
                Ok(()) => return Routed::Queued,
                Err(mpsc::error::SendError(job)) => {
                    tracing::error!(room_id = %inbound.room_id, "Room worker gone, restarting");
                    job
                }
            },
            None => job,
        };

        let tx = self.spawn_room(&inbound.room_id);
        if tx.send(job).is_err() {
            tracing::error!(room_id = %inbound.room_id, "Failed to queue reading");
        }
        Routed::Queued
    }

    /// Collect acknowledgment tasks that already finished
    fn reap_acks(&mut self) {
        while let Some(result) = self.acks.try_join_next() {
            if let Err(e) = result {
                tracing::error!("Acknowledgment task failed: {}", e);
            }
        }
    }

    fn spawn_room(&mut self, room_id: &str) -> mpsc::UnboundedSender<Job> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.workers.spawn(run_room(
            self.dispatcher.clone(),
            room_id.to_string(),
            rx,
            self.outcome_tx.clone(),
        ));
        self.rooms.insert(room_id.to_string(), tx.clone());
        tracing::debug!(room_id, "Room worker started");
        tx
    }

    /// Rooms that have received at least one reading
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Stop accepting readings and wait until every queued one is handled
    /// and acknowledged.
    pub async fn shutdown(mut self) {
        self.rooms.clear();
        self.outcome_tx = None;

        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                tracing::error!("Room worker failed: {}", e);
            }
        }
        while let Some(result) = self.acks.join_next().await {
            if let Err(e) = result {
                tracing::error!("Acknowledgment task failed: {}", e);
            }
        }
        tracing::info!("Room router stopped");
    }
}

async fn run_room(
    dispatcher: Arc<Dispatcher>,
    room_id: String,
    mut rx: mpsc::UnboundedReceiver<Job>,
    outcomes: Option<mpsc::UnboundedSender<DispatchOutcome>>,
) {
    let mut state = dispatcher.new_room();

    while let Some(job) = rx.recv().await {
        let outcome = dispatcher
            .handle(&mut state, &room_id, job.reading, job.received_at)
            .await;

        if let Err(e) = job.ack.ack().await {
            tracing::warn!(%room_id, "Failed to acknowledge reading: {}", e);
        }

        if let Some(tx) = &outcomes {
            let _ = tx.send(outcome);
        }
    }

    tracing::debug!(%room_id, "Room worker stopped");
}
