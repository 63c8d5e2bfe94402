//! Trace scheduler and analyzer driver (see `SPEC_FULL.md`): replays
//! recorded per-thread trace shards through a set of analysis tools by
//! multiplexing them onto a fixed number of virtual-core output streams,
//! emulating OS-like scheduling (quanta, blocking, direct switches,
//! migration, rebalancing, region-of-interest replay, recorded-schedule
//! replay).
//!
//! The three components are bottom-up: [`input`] (lazy per-shard record
//! streams), [`scheduler`] (owns inputs/outputs, decides who runs next),
//! and [`analyzer`] (spawns workers, drives each output to completion,
//! dispatches to [`analyzer::Tool`] implementations). Concrete codec
//! backends, individual analysis tools, and a configuration-loading CLI
//! front end are out of scope; this crate exposes the contracts those
//! external pieces plug into.

pub mod analyzer;
pub mod error;
pub mod input;
pub mod intervals;
pub mod kernel_sequences;
pub mod options;
pub mod output;
pub mod record;
pub mod schedule_file;
pub mod scheduler;
pub mod speculator;
pub mod workload;

pub use analyzer::{AnalyzerDriver, IntervalSnapshot, IntervalUnit, RunMode, ShardId, Tool, ToolAction};
pub use error::{SchedulerError, StreamStatus};
pub use input::{discover_shard_files, MemoryShard, RawFileShard, ShardSource};
pub use options::{DependencyMode, MappingMode, QuantumUnit, SchedulerOptions};
pub use record::{MarkerType, Record, RecordKind, ThreadBoundaryKind};
pub use scheduler::Scheduler;
pub use workload::{InputSpec, InstructionRange, TimeRange, Workload, WorkloadInput};
