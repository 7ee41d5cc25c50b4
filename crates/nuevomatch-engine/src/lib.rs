//! NuevoMatch Engine
//!
//! Online classification engine for precompiled NuevoMatch classifiers:
//! learned-index packet classification for the data plane of a software
//! switch or stateless firewall.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      SerialNuevoMatch                            │
//! │                                                                  │
//! │  load(blob) ──► subset filter ──► remainder rebuild ──► grouping │
//! │                                                                  │
//! │  ┌────────────────┐   ┌────────────────┐   ┌────────────────┐   │
//! │  │  Worker 0      │   │  Worker 1      │   │  Worker K-1    │   │
//! │  │  (caller unit) │   │  (pinned core) │   │  (pinned core) │   │
//! │  │                │   │ ┌────────────┐ │   │ ┌────────────┐ │   │
//! │  │                │   │ │ SPSC queue │ │   │ │ SPSC queue │ │   │
//! │  │                │   │ └─────┬──────┘ │   │ └─────┬──────┘ │   │
//! │  │       ▼        │   │       ▼        │   │       ▼        │   │
//! │  │ ┌────────────┐ │   │ ┌────────────┐ │   │ ┌────────────┐ │   │
//! │  │ │ iSet       │ │   │ │ iSet       │ │   │ │ iSet       │ │   │
//! │  │ │ pipeline   │ │   │ │ pipeline   │ │   │ │ pipeline   │ │   │
//! │  │ │ + remainder│ │   │ │            │ │   │ │            │ │   │
//! │  │ └─────┬──────┘ │   │ └─────┬──────┘ │   │ └─────┬──────┘ │   │
//! │  │       ▼        │   │       ▼        │   │       ▼        │   │
//! │  │  listeners     │   │  listeners     │   │  listeners     │   │
//! │  └────────────────┘   └────────────────┘   └────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Per batch, a worker runs three stages interleaved across its iSets:
//! model inference, a memory-parallel bounded binary search over the
//! boundary arrays, and full-header validation. The remainder classifier
//! covers every rule no iSet validates and runs last.
//!
//! Building classifiers is done offline by an external toolchain; the engine
//! only loads them.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod classifier;
pub mod config;
pub mod error;
pub mod interval_set;
pub mod model;
pub mod remainder;
pub mod spsc;
pub mod worker;

pub use classifier::SerialNuevoMatch;
pub use config::{NuevoMatchConfig, RemainderType};
pub use error::{ClassifierError, Result};
pub use interval_set::{IntervalSet, IntervalSetInfo, IntervalSetInfoBatch};
pub use model::{ModelOutput, RqrmiModel, SubModel};
pub use remainder::{CutSplit, RemainderClassifier, TupleMerge};
pub use worker::{
    PipelineOptions, Subset, WorkerListener, WorkerParallel, WorkerPerf, WorkerSerial, WorkerStats,
};
