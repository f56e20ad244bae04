//! Durable execution substrate for multi-step workflows, plus a bounded
//! agentic build loop that produces and verifies them.
//!
//! Every run is an append-only journal of events; everything else is derived
//! from it:
//!
//! - **[`core`]**: pure, deterministic logic (event schema, manifest and build
//!   state reducers, budgets, failure fingerprints, mode policy). No I/O.
//! - **[`io`]**: side effects (journal files, run layout, run index, config,
//!   processes, gates, agents, prompts).
//!
//! Orchestration modules ([`context`], [`reconcile`], [`build`]) combine the
//! two to implement runs, crash recovery and builds. [`bus`] and [`approval`]
//! carry the in-process and connected (async) scheduling models.

pub mod approval;
pub mod build;
pub mod bus;
pub mod context;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod reconcile;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
