//! MySQL session collector.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Collector                           │
//! │                                                              │
//! │   ConnectionRegistry ──snapshot──► [(name, handle), ...]     │
//! │                                        │  (concurrent)       │
//! │                                 ┌──────▼───────┐             │
//! │                                 │SessionSampler│ timeout     │
//! │                                 └──────┬───────┘             │
//! │                                        │ SessionRecord       │
//! │                                 ┌──────▼───────┐             │
//! │                                 │ MetricMapper │ GaugeVec    │
//! │                                 └──────────────┘             │
//! └────────────────────────────────────────┼─────────────────────┘
//!                                          │
//!                          ┌───────────────┴───────────────┐
//!                          │       ProcessListSource       │ (trait)
//!                          └───────┬───────────────┬───────┘
//!                           ┌──────▼──────┐ ┌──────▼──────┐
//!                           │MySqlProcess-│ │ MockSource  │
//!                           │List (sqlx)  │ │ (Testing)   │
//!                           └─────────────┘ └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use dbmonitor_core::collector::Collector;
//! use dbmonitor_core::collector::mock::RecordingConnector;
//! use dbmonitor_core::registry::ConnectionRegistry;
//!
//! let registry = Arc::new(ConnectionRegistry::new(RecordingConnector::new()));
//! let collector = Collector::new(registry);
//! assert_eq!(collector.mapper().metric_name(), "mysqlconn");
//! ```

#[allow(clippy::module_inception)]
mod collector;
mod mapper;
pub mod mock;
mod mysql;
mod sampler;

pub use collector::{Collector, DEFAULT_QUERY_TIMEOUT};
pub use mapper::{LABEL_NAMES, MetricEmission, MetricMapper, MetricVariant};
pub use mysql::{MySqlConnector, MySqlProcessList, PROCESSLIST_QUERY};
pub use sampler::{
    ProcessListRow, ProcessListSource, RowSet, SampleError, SessionRecord, SessionSampler,
    SourceError, parse_elapsed, strip_port,
};
