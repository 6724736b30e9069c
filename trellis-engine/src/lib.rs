//! Trellis reconciliation engine
//!
//! Converges a cloud account toward a declared [`ClusterDefinition`]:
//! discovers what already exists by tag, creates only what is missing and
//! drives every node's instance through its lifecycle.
//!
//! The [`Pipeline`] runs an ordered list of steps against a
//! [`HostingManager`]. Global steps run one at a time; per-node steps fan
//! out over a bounded worker pool.
//!
//! [`ClusterDefinition`]: trellis_core::domain::ClusterDefinition

pub mod config;
pub mod error;
pub mod hosting;
pub mod instance;
pub mod names;
pub mod network;
pub mod partition;
pub mod pipeline;
pub mod placement;
pub mod poller;
pub mod ports;
pub mod progress;
pub mod reconciler;
pub mod registry;
pub mod security;
pub mod table;

pub use config::EngineConfig;
pub use error::PipelineError;
pub use hosting::{CloudHostingManager, HostingManager};
pub use pipeline::{Pipeline, PipelineState, RunSummary};
pub use progress::{ConsoleSink, ProgressEvent, ProgressSink, RecordingSink, StepReporter, TracingSink};
pub use reconciler::{Reconciler, ResourceSpec};
pub use registry::NodeRegistry;
pub use table::ReconciliationTable;
