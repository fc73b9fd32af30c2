//! Goal-driven mobile UI testing.
//!
//! A run repeatedly asks the [`planner::Planner`] for one action, has the
//! [`resolver::ActionResolver`] carry it out on the device, observes the
//! result, and finally lets the [`supervisor::Supervisor`] issue a verdict.
//! Successful sequences are remembered in the [`memory::MemoryStore`] and
//! replayed on later runs without consulting the reasoning service. Saved
//! runs can be re-executed step by step with [`replay::EpisodeReplayer`].

pub mod action;
pub mod audit;
pub mod config;
pub mod device;
pub mod errors;
pub mod goal;
pub mod logging;
pub mod memory;
pub mod orchestrator;
pub mod planner;
pub mod reasoning;
pub mod replay;
pub mod resolver;
pub mod retry;
pub mod subgoal;
pub mod suite;
pub mod supervisor;
pub mod util;

pub use action::{Action, ActionKind, Target};
pub use audit::{ActionRecord, JsonRunLog, RunCounters, RunResult, RunSink};
pub use config::QaConfig;
pub use device::{DeviceControl, DeviceOp, ObservableState, Screenshot};
pub use errors::{ErrorKind, RunError};
pub use goal::{ExpectedOutcome, TestGoal, Verdict};
pub use memory::{ContextKey, MemoryStore, Pattern};
pub use orchestrator::Orchestrator;
pub use planner::{Decision, DecisionSource, Planner};
pub use reasoning::{DecisionContext, MeteredReasoning, ReasoningService, VerifyRequest};
pub use replay::{EpisodeReplayer, ReplayReport, ReplayStep};
pub use resolver::{ActionResolver, Resolution, ResolutionTier};
pub use retry::RetryPolicy;
pub use subgoal::{SubgoalProgress, SubgoalRule};
pub use suite::{SuiteRunner, SuiteSummary};
pub use supervisor::{AssertionResult, Supervisor, SupervisorReport};
