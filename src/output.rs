//! The virtual cores the scheduler multiplexes inputs onto (§3 "Output").

use std::collections::VecDeque;

use serde::Serialize;

use crate::record::Record;
use crate::schedule_file::ScheduleEntry;

/// A statistics counter set kept per output, surfaced to tools and tests.
/// Names mirror the original's `SCHED_STAT_*` family (§8 "quantum
/// preemption", §4.2.5 "DIRECT_SWITCH_*"). `Serialize` so the smoke binary
/// can emit a `--json` summary without hand-rolling a writer.
#[derive(Copy, Clone, Debug, Default, Serialize)]
pub struct OutputStats {
    pub instructions: u64,
    pub quantum_preempts: u64,
    pub migrations: u64,
    pub direct_switch_attempts: u64,
    pub direct_switch_successes: u64,
    pub idle_ticks: u64,
    pub waits: u64,
}

/// A single saved speculation frame: the PC the speculator should resume
/// emitting synthetic instructions from, and whether the input that was
/// current when speculation started should remain queued (§4.2 "layered
/// speculation stack").
#[derive(Copy, Clone, Debug)]
pub struct SpeculationFrame {
    pub start_pc: u64,
    pub queued_current_input: Option<usize>,
}

/// One virtual core (§3 "Output").
pub struct Output {
    pub index: usize,
    /// The input currently assigned to run on this output, if any.
    pub cur_input: Option<usize>,
    /// Inputs eligible to run next on this output, ordered per §4.2.10's
    /// tie-break rule at selection time (not maintained sorted; the
    /// scheduler picks the best candidate via a linear scan, matching the
    /// ready-queue's small expected size in the original design).
    pub ready_queue: VecDeque<usize>,
    /// The scheduler's logical clock for this output, advanced by each
    /// delivered record's timestamp or synthesized from instruction counts
    /// (§5 "Timeouts").
    pub cur_time: u64,
    pub idle_count: u64,
    pub active: bool,
    pub speculation_stack: Vec<SpeculationFrame>,
    pub stats: OutputStats,
    /// When `Some`, every `(input, start_instruction, stop_or_duration,
    /// timestamp)` actually delivered on this output is appended here for
    /// schedule recording (§4.2.8).
    pub recorded_schedule: Option<crate::schedule_file::ScheduleWriter>,
    pub base_timestamp: u64,
    pub last_record: Option<Record>,
    /// Instructions (or time units) consumed by the current input since
    /// its quantum started; rewound on non-preemption switches (§4.2.4).
    pub instrs_in_quantum: u64,
    pub time_spent_in_quantum: u64,
    pub quantum_start_time: u64,
    /// `MAP_AS_PREVIOUSLY` playback state for this output: the entries
    /// read from `output.NNNN` and our position in them.
    pub replay: Option<ReplayState>,
    /// Forced next pick set by a successful direct switch (§4.2.5).
    pub forced_next_input: Option<usize>,
    /// Set alongside `forced_next_input` on a successful direct switch:
    /// the currently-running input must yield *this* output right away
    /// rather than wait out its quantum (§8 scenario 4: "B runs
    /// immediately after A's marker record").
    pub force_yield: bool,
    /// The pid last run on this output, used to classify the next
    /// context-switch injection as thread- vs process-switch (§4.2.7).
    pub last_pid: Option<i64>,
}

/// Position within a previously-recorded schedule file being replayed.
pub struct ReplayState {
    pub entries: Vec<ScheduleEntry>,
    pub pos: usize,
}

impl Output {
    pub fn new(index: usize) -> Self {
        Output {
            index,
            cur_input: None,
            ready_queue: VecDeque::new(),
            cur_time: 0,
            idle_count: 0,
            active: true,
            speculation_stack: Vec::new(),
            stats: OutputStats::default(),
            recorded_schedule: None,
            base_timestamp: 0,
            last_record: None,
            instrs_in_quantum: 0,
            time_spent_in_quantum: 0,
            quantum_start_time: 0,
            replay: None,
            forced_next_input: None,
            force_yield: false,
            last_pid: None,
        }
    }

    pub fn is_speculating(&self) -> bool {
        !self.speculation_stack.is_empty()
    }

    /// Derives `cur_time` per §5: "caller-provided or derived from
    /// `output_instruction_ordinal + idle_count + 1`". A zero `cur_time`
    /// supplied by the caller is replaced the same way.
    pub fn derive_time(&self, caller_time: u64) -> u64 {
        if caller_time != 0 {
            return caller_time;
        }
        self.stats.instructions + self.idle_count + 1
    }
}
