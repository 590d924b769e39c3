//! remedyd library - issue detection and guided remediation.
//!
//! The monitor turns samples into issues, the wizard walks an issue through
//! diagnosis, action and validation, and the engine exposes both to the
//! HTTP layer.

pub mod collectors;
pub mod diagnosis;
pub mod engine;
pub mod evaluator;
pub mod executor;
pub mod keyed;
pub mod monitor;
pub mod ports;
pub mod registry;
pub mod routes;
pub mod runner;
pub mod samples;
pub mod server;
pub mod store;
pub mod wizard;

pub use engine::{Collaborators, Engine, EngineHealth, IssueListing};
pub use ports::{CommandRunner, DiagnosisProvider, IssueContext, MetricsSource};
