// =============================================================================
// Routing Decision — auditable record of every routed order
// =============================================================================
//
// One record per order, created by the pipeline and retained in the history
// ring.  Reasons are ordered: pipeline stages append as they fire, so the
// record reads as a trace of which stages shaped the outcome.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::{Order, RouteAction, Side};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub order_id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub action: RouteAction,
    /// Percent of the volume hedged externally, in [0, 100].
    pub a_book_pct: f64,
    /// Always 100 − a_book_pct.
    pub b_book_pct: f64,
    /// LP chosen for the A-Book portion, when one was selectable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_lp: Option<String>,
    /// Execution session for the target LP.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_handle: Option<String>,
    /// Indicative price the selection was made at.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indicative_price: Option<f64>,
    /// Ordered stage tags explaining the outcome.
    pub reasons: Vec<String>,
    /// ISO 8601 creation timestamp.
    pub decided_at: String,
}

impl RoutingDecision {
    /// Start a decision record for an order; action and percentages are
    /// finalised by the pipeline.
    pub fn draft(order: &Order) -> Self {
        Self {
            order_id: order.id.clone(),
            account_id: order.account_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            volume: order.volume,
            action: RouteAction::BBook,
            a_book_pct: 0.0,
            b_book_pct: 100.0,
            target_lp: None,
            session_handle: None,
            indicative_price: None,
            reasons: Vec::new(),
            decided_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Raise the A-Book percent; pipeline stages never lower it.
    pub fn raise_a_book_pct(&mut self, pct: f64) {
        let pct = pct.clamp(0.0, 100.0);
        if pct > self.a_book_pct {
            self.a_book_pct = pct;
            self.b_book_pct = 100.0 - pct;
        }
    }

    /// Set the A-Book percent outright (base from rules or classification).
    pub fn set_a_book_pct(&mut self, pct: f64) {
        self.a_book_pct = pct.clamp(0.0, 100.0);
        self.b_book_pct = 100.0 - self.a_book_pct;
    }

    pub fn push_reason(&mut self, reason: impl Into<String>) {
        self.reasons.push(reason.into());
    }

    /// Derive the final action from the percentages (unless rejected).
    pub fn finalise_action(&mut self) {
        if self.action == RouteAction::Reject {
            return;
        }
        self.action = if self.a_book_pct >= 100.0 {
            RouteAction::ABook
        } else if self.a_book_pct <= 0.0 {
            RouteAction::BBook
        } else {
            RouteAction::PartialHedge
        };
    }

    /// Volume routed externally, in lots.
    pub fn a_book_volume(&self) -> f64 {
        self.volume * self.a_book_pct / 100.0
    }

    /// Volume internalized, in lots.
    pub fn b_book_volume(&self) -> f64 {
        self.volume * self.b_book_pct / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderKind;

    fn order() -> Order {
        Order {
            id: "o1".into(),
            account_id: "A1".into(),
            symbol: "EURUSD".into(),
            side: Side::Buy,
            volume: 10.0,
            price: None,
            kind: OrderKind::Market,
        }
    }

    #[test]
    fn raise_never_lowers() {
        let mut d = RoutingDecision::draft(&order());
        d.set_a_book_pct(50.0);
        d.raise_a_book_pct(30.0);
        assert!((d.a_book_pct - 50.0).abs() < f64::EPSILON);
        d.raise_a_book_pct(80.0);
        assert!((d.a_book_pct - 80.0).abs() < f64::EPSILON);
        assert!((d.b_book_pct - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn finalise_maps_percent_to_action() {
        let mut d = RoutingDecision::draft(&order());
        d.set_a_book_pct(100.0);
        d.finalise_action();
        assert_eq!(d.action, RouteAction::ABook);

        d.set_a_book_pct(0.0);
        d.finalise_action();
        assert_eq!(d.action, RouteAction::BBook);

        d.set_a_book_pct(40.0);
        d.finalise_action();
        assert_eq!(d.action, RouteAction::PartialHedge);
    }

    #[test]
    fn reject_is_sticky() {
        let mut d = RoutingDecision::draft(&order());
        d.action = RouteAction::Reject;
        d.set_a_book_pct(100.0);
        d.finalise_action();
        assert_eq!(d.action, RouteAction::Reject);
    }

    #[test]
    fn split_volumes() {
        let mut d = RoutingDecision::draft(&order());
        d.set_a_book_pct(10.0);
        assert!((d.a_book_volume() - 1.0).abs() < 1e-12);
        assert!((d.b_book_volume() - 9.0).abs() < 1e-12);
    }
}
