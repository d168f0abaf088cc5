// =============================================================================
// Internal Counterparty — the B-Book side as an opaque collaborator
// =============================================================================
//
// The engine never matches or prices B-Book fills itself; it hands the
// internalized portion to whatever desk implementation was wired in.
// Acceptance is non-blocking: a desk that cannot take the ticket right now
// returns false and the router queues the portion for retry.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::types::Side;

/// The internalized portion of a routed order.
#[derive(Debug, Clone, Serialize)]
pub struct BBookTicket {
    pub order_id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    /// Decision-time indicative price, when one was available.
    pub price: Option<f64>,
}

pub trait InternalDesk: Send + Sync {
    /// Offer a ticket to the desk. Must not block; false means "try later".
    fn try_accept(&self, ticket: BBookTicket) -> bool;

    /// Hedge backpressure notification: the desk should reduce its B-Book
    /// acceptance rate while `active` is true.
    fn notify_backpressure(&self, active: bool);
}

// ---------------------------------------------------------------------------
// Bounded-channel desk
// ---------------------------------------------------------------------------

/// Desk implementation backed by a bounded channel; the consumer half is
/// owned by the counterparty process (or a simulation of it).
pub struct ChannelDesk {
    tx: mpsc::Sender<BBookTicket>,
    backpressure: AtomicBool,
}

impl ChannelDesk {
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<BBookTicket>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Arc::new(Self {
                tx,
                backpressure: AtomicBool::new(false),
            }),
            rx,
        )
    }

    pub fn under_backpressure(&self) -> bool {
        self.backpressure.load(Ordering::Relaxed)
    }
}

impl InternalDesk for ChannelDesk {
    fn try_accept(&self, ticket: BBookTicket) -> bool {
        match self.tx.try_send(ticket) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "internal desk unavailable");
                false
            }
        }
    }

    fn notify_backpressure(&self, active: bool) {
        let was = self.backpressure.swap(active, Ordering::Relaxed);
        if was != active {
            if active {
                warn!("internal desk notified: hedge backpressure ON");
            } else {
                info!("internal desk notified: hedge backpressure OFF");
            }
        } else {
            debug!(active, "backpressure notice (unchanged)");
        }
    }
}

impl std::fmt::Debug for ChannelDesk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelDesk")
            .field("backpressure", &self.under_backpressure())
            .finish()
    }
}
