// =============================================================================
// Shared types used across the Meridian routing engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Side of an order or fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "Buy"),
            Self::Sell => write!(f, "Sell"),
        }
    }
}

/// Order kind accepted by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "Market"),
            Self::Limit => write!(f, "Limit"),
            Self::Stop => write!(f, "Stop"),
        }
    }
}

/// A client order as submitted by the gateway. Immutable once received;
/// the engine never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    /// Volume in lots. Must be > 0.
    pub volume: f64,
    /// Limit/stop price. `None` for market orders.
    #[serde(default)]
    pub price: Option<f64>,
    pub kind: OrderKind,
}

impl Order {
    /// Structural validity: positive finite volume, non-empty symbol and
    /// account. Orders failing this are rejected before the pipeline runs.
    pub fn is_valid(&self) -> bool {
        self.volume > 0.0
            && self.volume.is_finite()
            && !self.symbol.is_empty()
            && !self.account_id.is_empty()
    }
}

/// Where an order (or a fraction of it) ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteAction {
    /// Fully hedged externally.
    ABook,
    /// Fully internalized.
    BBook,
    /// Split between external and internal books.
    PartialHedge,
    /// Refused outright.
    Reject,
}

impl std::fmt::Display for RouteAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ABook => write!(f, "ABook"),
            Self::BBook => write!(f, "BBook"),
            Self::PartialHedge => write!(f, "PartialHedge"),
            Self::Reject => write!(f, "Reject"),
        }
    }
}

/// Client classification maintained by the profiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    Retail,
    SemiPro,
    Professional,
    Toxic,
}

impl Default for Classification {
    fn default() -> Self {
        Self::Retail
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retail => write!(f, "Retail"),
            Self::SemiPro => write!(f, "SemiPro"),
            Self::Professional => write!(f, "Professional"),
            Self::Toxic => write!(f, "Toxic"),
        }
    }
}

/// A completed round-trip trade emitted by the fill collaborator and
/// consumed by the profiler. Not stored by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub open_price: f64,
    pub close_price: f64,
    pub pnl: f64,
    /// UNIX milliseconds.
    pub open_ts: i64,
    /// UNIX milliseconds.
    pub close_ts: i64,
}

impl TradeEvent {
    /// Malformed events are dropped by the profiler with a counter.
    pub fn is_well_formed(&self) -> bool {
        !self.account_id.is_empty()
            && !self.symbol.is_empty()
            && self.volume > 0.0
            && self.open_price > 0.0
            && self.close_price > 0.0
            && self.close_ts >= self.open_ts
    }
}

/// Outcome of an LP order, reported back by the adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub lp_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    /// Price the LP filled at. `None` when the order was rejected.
    #[serde(default)]
    pub fill_price: Option<f64>,
    pub rejected: bool,
    /// Round-trip latency of the send, in milliseconds.
    pub latency_ms: f64,
}

impl ExecutionReport {
    pub fn is_fill(&self) -> bool {
        !self.rejected && self.fill_price.is_some()
    }
}

/// Source of an exposure-affecting fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillSource {
    /// A client trade accepted into the B-Book.
    Client,
    /// An external hedge fill offsetting client exposure.
    Hedge,
}

impl std::fmt::Display for FillSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client => write!(f, "Client"),
            Self::Hedge => write!(f, "Hedge"),
        }
    }
}

/// Best-effort alert published on the engine's broadcast bus. Consumers may
/// come and go; sends never block and are dropped when nobody listens.
#[derive(Debug, Clone, Serialize)]
pub enum EngineAlert {
    /// Net exposure for a symbol exceeded its configured max after a fill.
    ExposureBreach {
        symbol: String,
        net: f64,
        max_net: f64,
    },
    /// A hedge exhausted its retry schedule and was abandoned.
    HedgeAbandoned {
        order_id: String,
        symbol: String,
        volume: f64,
    },
}
