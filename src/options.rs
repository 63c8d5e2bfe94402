//! Scheduler configuration (§4.2, §6 "Configuration options the core must
//! accept").
//!
//! Following the teacher's preference for explicit option structs built
//! with struct-literal + `Default` (see `flags.rs`'s `Flags`) rather than a
//! generic config-loading crate: this layer has no file-based config of
//! its own, that belongs to the out-of-scope CLI front end.

use std::path::PathBuf;

/// How inputs are assigned to outputs (§4.2.2).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MappingMode {
    /// Dynamic scheduling across outputs; inputs migrate.
    MapToAnyOutput,
    /// Each output is fixed to one recorded cpu; the recorded cpu_schedule
    /// file selects inputs. Lowered to `MapAsPreviously` internally once
    /// the schedule file has been read.
    MapToRecordedOutput,
    /// Plays back a previously recorded scheduler output verbatim.
    MapAsPreviously,
    /// Static round robin, no migration.
    MapToConsistentOutput,
}

/// Whether cross-output record ordering is constrained by timestamps
/// (§4.2.3).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DependencyMode {
    Ignore,
    Timestamps,
}

/// The unit a quantum is measured in (§4.2.4).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QuantumUnit {
    Instructions,
    Time,
}

/// Full option set accepted by `Scheduler::init` (§6).
#[derive(Clone, Debug)]
pub struct SchedulerOptions {
    pub mapping: MappingMode,
    pub deps: DependencyMode,
    pub quantum_unit: QuantumUnit,
    pub quantum_duration_us: u64,
    pub quantum_duration_instrs: u64,
    pub time_units_per_us: u64,
    pub block_time_multiplier: f64,
    pub block_time_max_us: u64,
    pub syscall_switch_threshold: u64,
    pub blocking_switch_threshold: u64,
    pub migration_threshold_us: u64,
    pub rebalance_period_us: u64,
    pub honor_infinite_timeouts: bool,
    pub honor_direct_switches: bool,
    pub randomize_next_input: bool,
    pub read_inputs_in_init: bool,
    pub single_lockstep_output: bool,
    /// If set, the scheduler reports overall EOF once the fraction of
    /// inputs remaining drops below this value (0.0 disables the check).
    pub exit_if_fraction_inputs_left: f64,
    pub kernel_switch_trace_path: Option<PathBuf>,
    pub kernel_syscall_trace_path: Option<PathBuf>,
    /// When set, a binary schedule-record log is written per output
    /// (§4.2.8). Modeled as a path rather than an arbitrary `Write` to
    /// keep `SchedulerOptions: Clone`; opened lazily by `Scheduler::init`.
    pub schedule_record_dir: Option<PathBuf>,
    /// When set, `MapAsPreviously` replays this previously-recorded
    /// schedule directory instead of `schedule_record_dir`.
    pub schedule_replay_dir: Option<PathBuf>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        SchedulerOptions {
            mapping: MappingMode::MapToAnyOutput,
            deps: DependencyMode::Ignore,
            quantum_unit: QuantumUnit::Instructions,
            quantum_duration_us: 1000,
            quantum_duration_instrs: 10_000_000,
            time_units_per_us: 100,
            block_time_multiplier: 1.0,
            block_time_max_us: 250_000,
            syscall_switch_threshold: 0,
            blocking_switch_threshold: 0,
            migration_threshold_us: 500,
            rebalance_period_us: 50_000,
            honor_infinite_timeouts: true,
            honor_direct_switches: true,
            randomize_next_input: false,
            read_inputs_in_init: false,
            single_lockstep_output: false,
            exit_if_fraction_inputs_left: 0.0,
            kernel_switch_trace_path: None,
            kernel_syscall_trace_path: None,
            schedule_record_dir: None,
            schedule_replay_dir: None,
        }
    }
}

impl SchedulerOptions {
    /// `scale_block_time` (§4.2.5): scales a recorded blocking duration
    /// into the scheduler's logical time units, clamped to
    /// `block_time_max_us` and floored at 1 so a scaled-to-zero duration
    /// is still distinguishable from "infinite timeout" (represented as
    /// `None`).
    pub fn scale_block_time(&self, recorded_value: u64) -> u64 {
        let scaled_us =
            ((recorded_value as f64) * self.block_time_multiplier).min(self.block_time_max_us as f64);
        let scaled_us = scaled_us.max(0.0) as u64;
        let scaled = scaled_us.saturating_mul(self.time_units_per_us);
        scaled.max(1)
    }

    pub fn validate(&self) -> Result<(), crate::error::SchedulerError> {
        use crate::error::SchedulerError as E;
        if self.quantum_unit == QuantumUnit::Instructions && self.quantum_duration_instrs == 0 {
            return Err(E::InvalidParameter(
                "quantum_duration_instrs must be nonzero for QUANTUM_INSTRUCTIONS".into(),
            ));
        }
        if self.quantum_unit == QuantumUnit::Time && self.quantum_duration_us == 0 {
            return Err(E::InvalidParameter(
                "quantum_duration_us must be nonzero for QUANTUM_TIME".into(),
            ));
        }
        if self.mapping == MappingMode::MapAsPreviously && self.schedule_replay_dir.is_none() {
            return Err(E::InvalidParameter(
                "MAP_AS_PREVIOUSLY requires schedule_replay_dir".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.exit_if_fraction_inputs_left) {
            return Err(E::InvalidParameter(
                "exit_if_fraction_inputs_left must be in [0.0, 1.0)".into(),
            ));
        }
        Ok(())
    }
}
