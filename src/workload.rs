//! Workloads and regions of interest (§3 Data Model, §4.2.6).

use crate::input::ShardSource;

/// A half-open instruction range `[start, stop)` to replay from an input,
/// skipping everything outside it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InstructionRange {
    pub start: u64,
    pub stop: u64,
}

impl InstructionRange {
    pub fn new(start: u64, stop: u64) -> Self {
        debug_assert!(start < stop, "region of interest must be non-empty");
        InstructionRange { start, stop }
    }

    pub fn contains(&self, instr_ordinal: u64) -> bool {
        instr_ordinal >= self.start && instr_ordinal < self.stop
    }
}

/// A wall-clock range of interest, translated at init time (via the
/// recorded cpu_schedule file's per-input timestamp/instruction-ordinal
/// mapping) into an `InstructionRange` on the owning input.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TimeRange {
    pub t0: u64,
    pub t1: u64,
}

/// One recorded shard's scheduling-relevant metadata, as set up before the
/// scheduler takes ownership (§3 "Input").
#[derive(Clone, Debug, Default)]
pub struct InputSpec {
    pub tid: i64,
    pub pid: i64,
    pub priority: i32,
    /// Set of output indices this input may run on; `None` means
    /// unconstrained.
    pub affinity: Option<Vec<usize>>,
    /// Disjoint, ordered regions of interest (§4.2.6). Empty means
    /// "replay the whole shard".
    pub regions_of_interest: Vec<InstructionRange>,
    pub times_of_interest: Vec<TimeRange>,
}

/// One input as handed to `Scheduler::init`: its metadata plus the
/// backend that will actually produce its records.
pub struct WorkloadInput {
    pub spec: InputSpec,
    pub source: Box<dyn ShardSource + Send>,
}

/// A group of inputs, typically all threads of one recorded process
/// (§3 "Workload").
pub struct Workload {
    pub name: String,
    /// Optional cap on how many distinct outputs this workload's inputs
    /// may spread across.
    pub output_count_limit: Option<usize>,
    pub inputs: Vec<WorkloadInput>,
}

impl Workload {
    pub fn new(name: impl Into<String>) -> Self {
        Workload {
            name: name.into(),
            output_count_limit: None,
            inputs: Vec::new(),
        }
    }

    pub fn with_input(mut self, spec: InputSpec, source: Box<dyn ShardSource + Send>) -> Self {
        self.inputs.push(WorkloadInput { spec, source });
        self
    }
}
