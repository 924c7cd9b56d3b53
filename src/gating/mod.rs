//! Content access gating: decides whether a learner may open a module or
//! lesson right now.
//!
//! The pieces, leaf first:
//!
//! - [`sources`]: the Rule Store and Progress Oracle traits the engine reads
//!   through, with in-memory versions in [`memory`].
//! - [`graph`]: prerequisite graph and the cycle check shared by rule writes
//!   and evaluation.
//! - [`evaluators`]: one pure evaluator per rule type.
//! - [`engine`]: loads a course, runs the evaluators, AND-combines and fails
//!   closed.
//! - [`cache`] and [`events`]: per-(user, resource) decision cache with
//!   event-driven invalidation.
//! - [`web`]: the HTTP surface.

pub mod cache;
pub mod clock;
pub mod engine;
pub mod errors;
pub mod evaluators;
pub mod events;
pub mod graph;
pub mod memory;
pub mod sources;
pub mod types;
pub mod web;

pub use cache::{CacheEntry, DecisionCache, InMemoryDecisionCache, InvalidationScope};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{AuditReport, CourseSnapshot, GatingEngine};
pub use errors::{CyclePath, GatingError};
pub use evaluators::{CustomRule, EvalContext, EvaluatorRegistry, RuleEvaluator};
pub use events::{spawn_invalidation_listener, EventBus, GatingEvent};
pub use memory::{InMemoryProgressOracle, InMemoryRuleStore};
pub use sources::{ProgressOracle, RuleStore};
pub use types::*;
