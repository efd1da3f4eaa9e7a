//! # CareMind Scheduler
//!
//! Recurring campaign scheduler and dispatch engine: turns declarative
//! recurrence rules (once / daily / weekly / monthly / cron, in any
//! IANA timezone) into "fire now?" decisions, executes due campaigns
//! against their recipients, and records immutable runs that guarantee
//! at most one fire per campaign per period.
//!
//! ## Architecture
//! ```text
//! Scheduler (tokio interval, non-overlapping ticks)
//!   ├── DueEvaluator: recurrence math + run ledger → due?
//!   ├── CampaignExecutor: per-recipient params → dispatch (bounded
//!   │     concurrency) → one Run per recipient
//!   └── retention sweep: prune runs past the horizon
//!
//! RunLedger (SQLite / memory)
//!   └── append-only runs; sole source of "already fired this period"
//! ```
//!
//! The engine owns no listener and no CLI: the host constructs a
//! [`Scheduler`] with injected [`Clock`], [`CampaignStore`],
//! [`RunLedger`] and `MessageDispatcher`, then calls `start()`.

pub mod campaign;
pub mod clock;
pub mod cron;
pub mod due;
pub mod engine;
pub mod executor;
pub mod ledger;
pub mod recurrence;
pub mod run;
pub mod store;

pub use campaign::{Campaign, CampaignStatus, ParamsMode, Recipient, Recurrence};
pub use clock::{Clock, ManualClock, SystemClock};
pub use due::DueEvaluator;
pub use engine::{CampaignOutcome, Scheduler, TickReport};
pub use executor::{CampaignExecutor, ExecutionResult};
pub use ledger::{MemoryRunLedger, RunLedger, SqliteRunLedger};
pub use run::{PeriodKey, Run, RunStatus};
pub use store::{CampaignStore, MemoryCampaignStore, SqliteCampaignStore};
