//! Strategy engines. Every engine here is a plain synchronous evaluator:
//! same inputs, same outputs, no I/O. The controller and the backtest loop
//! call the exact same code.

pub mod bar_guard;
pub mod decision;
pub mod momentum;
pub mod post_tp1;
pub mod post_tp2;
pub mod regime;
pub mod risk;
pub mod tp_engine;

pub use bar_guard::BarCloseGuard;
pub use decision::{DecisionEngine, DecisionInput, DecisionOutput, DecisionVerdict, FailCode, Stage};
pub use momentum::MarketReader;
pub use post_tp1::{PostTp1Context, PostTp1Engine};
pub use post_tp2::{PostTp2Context, PostTp2Engine};
pub use regime::MarketRegimeEngine;
pub use risk::RiskEngine;
pub use tp_engine::{ExitCheck, MultiLevelTpEngine, TpLevels};
