// =============================================================================
// Meridian Routing Engine — broker-side order routing core
// =============================================================================
//
// Per client order, the engine decides whether to internalize the risk
// (B-Book), hedge it externally through a liquidity provider (A-Book), or
// split it (partial hedge), based on manual rules, client classification,
// volume, net exposure, and market volatility.
//
// The crate is an embeddable core: the client gateway, fill stream, admin
// surface, and internal counterparty attach through the programmatic
// interfaces re-exported here. The `meridian` binary wires a standalone
// process around the same pieces.
// =============================================================================

pub mod app_state;
pub mod config;
pub mod exposure;
pub mod internal;
pub mod lp;
pub mod profiler;
pub mod repository;
pub mod router;
pub mod sor;
pub mod types;
pub mod volatility;

pub use self::app_state::{EngineSnapshot, EngineState};
pub use self::config::EngineConfig;
pub use self::router::{RoutingDecision, RoutingEngine};
pub use self::types::{Order, OrderKind, RouteAction, Side, TradeEvent};
