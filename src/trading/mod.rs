//! Sync engine: feed merging, trade lifecycle, sizing, execution, balance.

mod config;
mod executor;
mod feed_merger;
mod ledger;
mod position_sizer;
mod push;
mod risk;
mod session;
mod state_machine;

pub use config::SyncConfig;
pub use executor::{ReplicationExecutor, ReplicationOrder};
pub use ledger::BalanceLedger;
pub use position_sizer::PositionSizer;
pub use push::{PushEvent, PushSubscription};
pub use risk::{ExposureAdvisor, RiskAdvisor, RiskContext};
pub use session::{Session, SharedSession};
pub use state_machine::{Decision, IngestOutcome};
