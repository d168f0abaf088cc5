// =============================================================================
// Decision History — bounded ring of recent routing decisions
// =============================================================================

use std::collections::VecDeque;

use parking_lot::Mutex;

use super::decision::RoutingDecision;

/// Mutex-protected circular buffer; full means drop oldest.
pub struct DecisionHistory {
    ring: Mutex<VecDeque<RoutingDecision>>,
    capacity: usize,
}

impl DecisionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(1_024))),
            capacity,
        }
    }

    pub fn push(&self, decision: RoutingDecision) {
        let mut ring = self.ring.lock();
        ring.push_back(decision);
        while ring.len() > self.capacity {
            ring.pop_front();
        }
    }

    /// The most recent `limit` decisions, newest last.
    pub fn tail(&self, limit: usize) -> Vec<RoutingDecision> {
        let ring = self.ring.lock();
        let skip = ring.len().saturating_sub(limit);
        ring.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }
}

impl std::fmt::Debug for DecisionHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionHistory")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Order, OrderKind, Side};

    fn decision(n: usize) -> RoutingDecision {
        RoutingDecision::draft(&Order {
            id: format!("o{n}"),
            account_id: "A1".into(),
            symbol: "EURUSD".into(),
            side: Side::Buy,
            volume: 1.0,
            price: None,
            kind: OrderKind::Market,
        })
    }

    #[test]
    fn ring_keeps_only_the_most_recent() {
        let history = DecisionHistory::new(100);
        for n in 0..250 {
            history.push(decision(n));
        }
        assert_eq!(history.len(), 100);

        let tail = history.tail(100);
        assert_eq!(tail.first().unwrap().order_id, "o150");
        assert_eq!(tail.last().unwrap().order_id, "o249");
    }

    #[test]
    fn tail_smaller_than_len() {
        let history = DecisionHistory::new(100);
        for n in 0..10 {
            history.push(decision(n));
        }
        let tail = history.tail(3);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].order_id, "o7");
        assert_eq!(tail[2].order_id, "o9");
    }

    #[test]
    fn tail_larger_than_len_returns_all() {
        let history = DecisionHistory::new(100);
        history.push(decision(0));
        assert_eq!(history.tail(50).len(), 1);
    }
}
