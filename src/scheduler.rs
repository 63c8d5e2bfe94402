//! The scheduler core (§4.2): owns all inputs and outputs, decides which
//! input feeds which output at each step, and enforces quanta, blocking,
//! direct switches, affinity, recorded-schedule replay and rebalancing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use log::debug;
use rand::Rng;

use crate::error::{SchedulerError, StreamStatus};
use crate::input::{Input, InputState};
use crate::kernel_sequences::{patch_branch_target, stamp_for_injection, KernelSequences, TransitionType};
use crate::options::{DependencyMode, MappingMode, QuantumUnit, SchedulerOptions};
use crate::output::Output;
use crate::record::{MarkerType, Record, RecordKind, ThreadBoundaryKind};
use crate::schedule_file::{self, EntryType};
use crate::speculator;
use crate::workload::{InstructionRange, Workload};

/// The owning driver for every input and output stream.
///
/// Lock ordering is always output -> input (§5): any method that needs
/// both locks takes the output's `MutexGuard` as a parameter so the
/// compiler-visible call shape documents which lock is already held.
pub struct Scheduler {
    options: SchedulerOptions,
    /// The mapping mode actually in effect. `MAP_TO_RECORDED_OUTPUT` is
    /// lowered to `MAP_AS_PREVIOUSLY` once the recorded schedule is read
    /// (§4.2.2).
    effective_mapping: MappingMode,
    inputs: Vec<Mutex<Input>>,
    outputs: Vec<Mutex<Output>>,
    tid2input: HashMap<i64, usize>,
    live_input_count: AtomicUsize,
    total_input_count: usize,
    kernel_sequences: KernelSequences,
    /// The latest timestamp emitted by any output so far, used by
    /// `DEPENDENCY_TIMESTAMPS` (§4.2.3).
    last_emitted_timestamp: AtomicU64,
    /// Ticks since the last rebalance pass (§4.2.2).
    ticks_since_rebalance: AtomicU64,
    rebalance_period: u64,
    workload_limits: HashMap<String, usize>,
}

impl Scheduler {
    /// `init` (§4.2.1): reserves inputs from workloads, applies
    /// per-input modifiers, optionally reads ahead, reads kernel
    /// sequence templates, and produces an initial input/output
    /// assignment.
    pub fn init(workloads: Vec<Workload>, output_count: usize, options: SchedulerOptions) -> Result<Scheduler, SchedulerError> {
        options.validate()?;
        if output_count == 0 {
            return Err(SchedulerError::InvalidParameter("output_count must be nonzero".into()));
        }

        let mut workload_limits = HashMap::new();
        let mut inputs = Vec::new();
        let mut tid2input = HashMap::new();

        for workload in workloads {
            if let Some(limit) = workload.output_count_limit {
                workload_limits.insert(workload.name.clone(), limit);
            }
            for winput in workload.inputs {
                let index = inputs.len();
                tid2input.insert(winput.spec.tid, index);
                let mut input = Input::new(
                    index,
                    winput.spec.tid,
                    winput.spec.pid,
                    workload.name.clone(),
                    winput.spec,
                    winput.source,
                );
                input.source.init()?;
                inputs.push(Mutex::new(input));
            }
        }
        let total_input_count = inputs.len();
        if total_input_count == 0 {
            return Err(SchedulerError::InvalidParameter("no inputs supplied".into()));
        }

        let mut kernel_sequences = KernelSequences::new();
        if let Some(dir) = &options.kernel_switch_trace_path {
            kernel_sequences.load_context_switch_dir(dir)?;
        }
        if let Some(dir) = &options.kernel_syscall_trace_path {
            kernel_sequences.load_syscall_dir(dir)?;
        }

        let mut effective_mapping = options.mapping;

        let mut outputs: Vec<Mutex<Output>> = (0..output_count).map(|i| Mutex::new(Output::new(i))).collect();

        match effective_mapping {
            MappingMode::MapToRecordedOutput | MappingMode::MapAsPreviously => {
                let dir = options
                    .schedule_replay_dir
                    .as_ref()
                    .ok_or_else(|| SchedulerError::InvalidParameter("replay mapping requires schedule_replay_dir".into()))?;
                for (i, out_mutex) in outputs.iter_mut().enumerate() {
                    let entries = schedule_file::read_schedule_from_dir(dir, i)?;
                    out_mutex.get_mut().unwrap().replay = Some(crate::output::ReplayState { entries, pos: 0 });
                }
                effective_mapping = MappingMode::MapAsPreviously;
            }
            MappingMode::MapToConsistentOutput => {
                for input_mutex in inputs.iter() {
                    let input = input_mutex.lock().unwrap();
                    let out = input.index % output_count;
                    drop(input);
                    outputs[out].get_mut().unwrap().ready_queue.push_back(input_mutex.lock().unwrap().index);
                }
            }
            MappingMode::MapToAnyOutput => {
                if options.deps == DependencyMode::Timestamps || options.read_inputs_in_init {
                    for input_mutex in inputs.iter() {
                        let mut input = input_mutex.lock().unwrap();
                        input.peek_timestamp()?;
                    }
                }
                for input_mutex in inputs.iter() {
                    let input = input_mutex.lock().unwrap();
                    let out = input.index % output_count;
                    drop(input);
                    outputs[out].get_mut().unwrap().ready_queue.push_back(input_mutex.lock().unwrap().index);
                }
            }
        }

        if let Some(dir) = &options.schedule_replay_dir {
            Self::translate_times_of_interest(&inputs, dir, output_count)?;
        }

        if let Some(dir) = &options.schedule_record_dir {
            std::fs::create_dir_all(dir).map_err(|e| SchedulerError::FileWriteFailed(e.to_string()))?;
            for out_mutex in outputs.iter_mut() {
                out_mutex.get_mut().unwrap().recorded_schedule = Some(schedule_file::ScheduleWriter::new(0));
            }
        }

        let rebalance_period = if options.rebalance_period_us == 0 || options.time_units_per_us == 0 {
            0
        } else {
            options.rebalance_period_us
        };

        Ok(Scheduler {
            options,
            effective_mapping,
            inputs,
            outputs,
            tid2input,
            live_input_count: AtomicUsize::new(total_input_count),
            total_input_count,
            kernel_sequences,
            last_emitted_timestamp: AtomicU64::new(0),
            ticks_since_rebalance: AtomicU64::new(0),
            rebalance_period,
            workload_limits,
        })
    }

    /// Times-of-interest (§4.2.6): translates each input's `[t0, t1]`
    /// wall-clock ranges into instruction ranges appended to
    /// `regions_of_interest`, using the recorded cpu_schedule file at
    /// `schedule_replay_dir` as the interval tree's source data — every
    /// `Default`/`Skip` entry for that input is a (timestamp,
    /// instruction-ordinal) sample. Inputs with no samples (never ran
    /// under the recorded schedule) keep their times-of-interest
    /// untranslated and unused, since there is nothing to map them onto.
    fn translate_times_of_interest(
        inputs: &[Mutex<Input>],
        schedule_replay_dir: &std::path::Path,
        output_count: usize,
    ) -> Result<(), SchedulerError> {
        let any_times_of_interest = inputs
            .iter()
            .any(|m| !m.lock().unwrap().spec.times_of_interest.is_empty());
        if !any_times_of_interest {
            return Ok(());
        }

        let mut samples: HashMap<i32, Vec<(u64, u64)>> = HashMap::new();
        for output_index in 0..output_count {
            let entries = match schedule_file::read_schedule_from_dir(schedule_replay_dir, output_index) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries {
                if entry.input >= 0 && matches!(entry.entry_type, EntryType::Default | EntryType::Skip) {
                    samples.entry(entry.input).or_default().push((entry.timestamp, entry.value_union));
                }
            }
        }
        for list in samples.values_mut() {
            list.sort_by_key(|&(timestamp, _)| timestamp);
        }

        for input_mutex in inputs {
            let mut input = input_mutex.lock().unwrap();
            if input.spec.times_of_interest.is_empty() {
                continue;
            }
            let Some(list) = samples.get(&(input.index as i32)) else {
                continue;
            };
            let ranges = input.spec.times_of_interest.clone();
            for range in ranges {
                let start = Self::interpolate_instruction(list, range.t0);
                let stop = Self::interpolate_instruction(list, range.t1);
                if let (Some(start), Some(stop)) = (start, stop) {
                    if start < stop {
                        input.spec.regions_of_interest.push(InstructionRange::new(start, stop));
                    }
                }
            }
            input.spec.regions_of_interest.sort_by_key(|r| r.start);
        }
        Ok(())
    }

    /// Maps a wall-clock timestamp onto an instruction ordinal by linear
    /// interpolation between the two nearest recorded samples, clamping to
    /// the first/last sample outside their range.
    fn interpolate_instruction(samples: &[(u64, u64)], timestamp: u64) -> Option<u64> {
        if samples.is_empty() {
            return None;
        }
        match samples.binary_search_by_key(&timestamp, |&(ts, _)| ts) {
            Ok(idx) => Some(samples[idx].1),
            Err(0) => Some(samples[0].1),
            Err(idx) if idx >= samples.len() => Some(samples[samples.len() - 1].1),
            Err(idx) => {
                let (t0, i0) = samples[idx - 1];
                let (t1, i1) = samples[idx];
                if t1 == t0 {
                    return Some(i0);
                }
                let frac = (timestamp - t0) as f64 / (t1 - t0) as f64;
                Some(i0 + ((i1 - i0) as f64 * frac).round() as u64)
            }
        }
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// `single_lockstep_output` (§6): when set, the run must be driven by
    /// one thread walking every output in round-robin instead of one
    /// worker thread per output, so record delivery across outputs stays
    /// lockstepped record-for-record rather than racing independently.
    pub fn single_lockstep_output(&self) -> bool {
        self.options.single_lockstep_output
    }

    pub fn input_count(&self) -> usize {
        self.total_input_count
    }

    /// A snapshot of one output's statistics counters, for reporting
    /// (`tracedrive --json`) and for test assertions.
    pub fn output_stats(&self, output: usize) -> crate::output::OutputStats {
        self.outputs[output].lock().unwrap().stats
    }

    /// Finalizes every output's schedule recording (if any) and writes it
    /// to `schedule_record_dir` (§4.2.8).
    pub fn finish_schedule_recording(&self, final_timestamp: u64) -> Result<(), SchedulerError> {
        let Some(dir) = &self.options.schedule_record_dir else {
            return Ok(());
        };
        for (i, out_mutex) in self.outputs.iter().enumerate() {
            let mut out = out_mutex.lock().unwrap();
            if let Some(writer) = out.recorded_schedule.as_mut() {
                writer.finish(final_timestamp);
                writer.write_to_dir(dir, i)?;
            }
        }
        Ok(())
    }

    /// `set_active` (§4.2.1, §5 cancellation): pausing an output releases
    /// its current input back to the pool so other outputs aren't starved.
    pub fn set_active(&self, output: usize, on: bool) {
        let mut out = self.outputs[output].lock().unwrap();
        out.active = on;
        if !on {
            if let Some(input_idx) = out.cur_input.take() {
                let mut input = self.inputs[input_idx].lock().unwrap();
                input.cur_output = None;
                if input.state != InputState::Eof {
                    input.state = InputState::Ready;
                    out.ready_queue.push_back(input_idx);
                }
            }
        }
    }

    /// `start_speculation` (§4.2.1).
    pub fn start_speculation(&self, output: usize, start_pc: u64, queue_current: bool) {
        let mut out = self.outputs[output].lock().unwrap();
        let queued = if queue_current {
            if let Some(cur) = out.cur_input {
                out.ready_queue.push_back(cur);
            }
            None
        } else {
            out.cur_input
        };
        out.cur_input = None;
        out.speculation_stack.push(crate::output::SpeculationFrame {
            start_pc,
            queued_current_input: queued,
        });
    }

    /// `stop_speculation` (§4.2.1).
    pub fn stop_speculation(&self, output: usize) -> Result<(), SchedulerError> {
        let mut out = self.outputs[output].lock().unwrap();
        let frame = out
            .speculation_stack
            .pop()
            .ok_or_else(|| SchedulerError::Invalid("stop_speculation called with empty stack".into()))?;
        if let Some(input_idx) = frame.queued_current_input {
            out.cur_input = Some(input_idx);
        }
        Ok(())
    }

    /// `unread_last_record` (§4.2.1): pushes the last emitted record back
    /// onto its input's pending queue. Always supported in this crate
    /// (only the memref record flavor is implemented; the raw trace-entry
    /// flavor that the spec notes as unsupported is out of scope, §1).
    pub fn unread_last_record(&self, output: usize) -> Result<(), SchedulerError> {
        let mut out = self.outputs[output].lock().unwrap();
        let record = out
            .last_record
            .take()
            .ok_or_else(|| SchedulerError::Invalid("no record to unread".into()))?;
        let input_idx = self
            .tid2input
            .get(&record.tid)
            .copied()
            .ok_or_else(|| SchedulerError::Invalid("unread record's tid has no matching input".into()))?;
        let mut input = self.inputs[input_idx].lock().unwrap();
        input.pending.push_front(record);
        Ok(())
    }

    /// Advances `output` by exactly one visible record (§4.2.1
    /// `next_record`).
    pub fn next_record(&self, output: usize, cur_time: u64) -> Result<(StreamStatus, Option<Record>), SchedulerError> {
        let mut out = self.outputs[output].lock().unwrap();
        if !out.active {
            out.stats.idle_ticks += 1;
            return Ok((StreamStatus::Idle, None));
        }
        let now = out.derive_time(cur_time);
        out.cur_time = now;
        drop(out);

        self.wake_expired_blocked_inputs(now);

        if self.effective_mapping == MappingMode::MapAsPreviously {
            return self.next_record_replay(output, now);
        }

        let mut out = self.outputs[output].lock().unwrap();
        let mut stolen = false;
        if out.cur_input.is_none() {
            match self.pick_next_input(&mut out, now)? {
                PickOutcome::Picked(input_idx) => {
                    self.assign_input_to_output(&mut out, input_idx, now)?;
                }
                PickOutcome::Stolen(input_idx) => {
                    self.assign_input_to_output(&mut out, input_idx, now)?;
                    stolen = true;
                }
                PickOutcome::Wait => {
                    out.stats.waits += 1;
                    // A wait still needs to advance this output's logical
                    // clock (§5 "Timeouts") or a blocked/unscheduled input
                    // with a finite timeout would never be observed as
                    // expired by `wake_expired_blocked_inputs`.
                    out.idle_count += 1;
                    return Ok((StreamStatus::Wait, None));
                }
                PickOutcome::Idle => {
                    out.stats.idle_ticks += 1;
                    out.idle_count += 1;
                    if let Some(writer) = out.recorded_schedule.as_mut() {
                        writer.push_idle(1, now);
                    }
                    return Ok((StreamStatus::Idle, None));
                }
                PickOutcome::Eof => {
                    return Ok((StreamStatus::Eof, None));
                }
            }
        }

        let result = if out.is_speculating() {
            self.next_speculative_record(&mut out, now)
        } else {
            let input_idx = out.cur_input.expect("cur_input set above");
            self.next_real_record(&mut out, input_idx, now)
        }?;

        // A direct-switch pick reports `Stole` (§4.2.1, §7) on the record
        // it actually delivered, rather than `Ok`, so callers can tell a
        // steal happened; it only overrides a plain `Ok` so EOF/idle-style
        // outcomes from the stolen input's very first record still read as
        // themselves.
        if stolen && result.0 == StreamStatus::Ok {
            return Ok((StreamStatus::Stole, result.1));
        }
        Ok(result)
    }

    fn next_speculative_record(&self, out: &mut Output, now: u64) -> Result<(StreamStatus, Option<Record>), SchedulerError> {
        let tid;
        let pid;
        {
            let cur = out.cur_input.map(|i| self.inputs[i].lock().unwrap());
            match cur {
                Some(input) => {
                    tid = input.tid;
                    pid = input.pid;
                }
                None => {
                    tid = -1;
                    pid = -1;
                }
            }
        }
        let frame = out.speculation_stack.last_mut().expect("checked is_speculating");
        let (record, next_pc) = speculator::next_speculative_instruction(tid, pid, now, frame.start_pc);
        frame.start_pc = next_pc;
        out.stats.instructions += 1;
        out.last_record = Some(record.clone());
        Ok((StreamStatus::Ok, Some(record)))
    }

    fn next_real_record(&self, out: &mut Output, input_idx: usize, now: u64) -> Result<(StreamStatus, Option<Record>), SchedulerError> {
        let mut input = self.inputs[input_idx].lock().unwrap();

        if !input.spec.regions_of_interest.is_empty() {
            if let Some(action) = self.roi_transition(&mut input, now)? {
                match action {
                    RoiAction::WindowMarker { window_id, skip } => {
                        let tid = input.tid;
                        let pid = input.pid;
                        drop(input);
                        let mut record = Record::marker(tid, pid, now, MarkerType::WindowId, window_id);
                        record.synthetic = true;
                        return self.finish_delivery(out, input_idx, record, now, skip);
                    }
                    RoiAction::Exit => {
                        let tid = input.tid;
                        let pid = input.pid;
                        input.at_eof = true;
                        input.state = InputState::Eof;
                        input.cur_output = None;
                        self.live_input_count.fetch_sub(1, Ordering::SeqCst);
                        drop(input);
                        out.cur_input = None;
                        let record = Record::thread_exit(tid, pid, now);
                        if let Some(writer) = out.recorded_schedule.as_mut() {
                            writer.push_synthetic_end(input_idx as i32, now);
                        }
                        out.last_record = Some(record.clone());
                        return Ok((StreamStatus::Ok, Some(record)));
                    }
                }
            }
        }

        let record = match input.take_next()? {
            Some(r) => r,
            None => {
                drop(input);
                return self.handle_input_eof(out, input_idx, now);
            }
        };

        self.apply_record_side_effects(out, &mut input, &record, now)?;

        if record.is_instruction() && !input.spec.regions_of_interest.is_empty() {
            if let Some(region) = input.current_roi() {
                if input.source.instruction_ordinal() >= region.stop {
                    input.roi_state = crate::input::RoiState::AtBoundary;
                }
            }
        }

        drop(input);
        self.finish_delivery(out, input_idx, record, now, None)
    }

    /// Handles region-of-interest entry/advance/exit (§4.2.6), returning
    /// `None` when the input is mid-region and a normal read should
    /// proceed.
    fn roi_transition(&self, input: &mut Input, _now: u64) -> Result<Option<RoiAction>, SchedulerError> {
        match input.roi_state {
            crate::input::RoiState::NotStarted => {
                let region = input.spec.regions_of_interest[0];
                let ordinal = input.source.instruction_ordinal();
                let skip = if region.start > ordinal {
                    input.source.skip_instructions(region.start - ordinal)?;
                    Some((ordinal, region.start))
                } else {
                    None
                };
                input.roi_pos = 0;
                input.roi_state = crate::input::RoiState::InRegion;
                Ok(Some(RoiAction::WindowMarker { window_id: 1, skip }))
            }
            crate::input::RoiState::AtBoundary => {
                input.roi_pos += 1;
                match input.spec.regions_of_interest.get(input.roi_pos).copied() {
                    Some(region) => {
                        let ordinal = input.source.instruction_ordinal();
                        let skip = if region.start > ordinal {
                            input.source.skip_instructions(region.start - ordinal)?;
                            Some((ordinal, region.start))
                        } else {
                            None
                        };
                        input.roi_state = crate::input::RoiState::InRegion;
                        Ok(Some(RoiAction::WindowMarker {
                            window_id: (input.roi_pos + 1) as u64,
                            skip,
                        }))
                    }
                    None => {
                        input.roi_state = crate::input::RoiState::Done;
                        Ok(Some(RoiAction::Exit))
                    }
                }
            }
            crate::input::RoiState::InRegion | crate::input::RoiState::Done => Ok(None),
        }
    }

    fn handle_input_eof(&self, out: &mut Output, input_idx: usize, now: u64) -> Result<(StreamStatus, Option<Record>), SchedulerError> {
        let mut input = self.inputs[input_idx].lock().unwrap();
        input.at_eof = true;
        input.state = InputState::Eof;
        input.cur_output = None;
        self.live_input_count.fetch_sub(1, Ordering::SeqCst);
        let exit_record = Record::thread_exit(input.tid, input.pid, now);
        drop(input);
        out.cur_input = None;
        if let Some(writer) = out.recorded_schedule.as_mut() {
            writer.push_synthetic_end(input_idx as i32, now);
        }
        out.last_record = Some(exit_record.clone());
        Ok((StreamStatus::Ok, Some(exit_record)))
    }

    fn apply_record_side_effects(
        &self,
        out: &mut Output,
        input: &mut Input,
        record: &Record,
        now: u64,
    ) -> Result<(), SchedulerError> {
        if record.is_instruction() {
            input.delivered_instr_ordinal += 1;
            out.stats.instructions += 1;
            out.instrs_in_quantum += 1;
            if let RecordKind::Instruction { pc, size } = &record.kind {
                input.last_fallthrough_pc = Some(*pc + *size as u64);
            }
        }
        out.time_spent_in_quantum = now.saturating_sub(out.quantum_start_time);

        if let Some(marker_type) = record.marker_type() {
            let value = record.kind.marker_value().unwrap_or(0);
            match marker_type {
                MarkerType::Blocking => {
                    if value > self.options.blocking_switch_threshold {
                        self.block_input(input, now, value);
                    }
                }
                MarkerType::Syscall => {
                    if value > self.options.syscall_switch_threshold {
                        self.block_input(input, now, value.saturating_sub(self.options.syscall_switch_threshold));
                    }
                    input.pending_syscall_trace = Some(value as i64);
                }
                MarkerType::SyscallUnschedule => {
                    if self.options.honor_direct_switches {
                        let timeout = if self.options.honor_infinite_timeouts {
                            None
                        } else {
                            Some(now + self.options.scale_block_time(self.options.block_time_max_us))
                        };
                        input.state = InputState::Unscheduled { timeout };
                    }
                }
                MarkerType::SyscallSchedule => {
                    self.attempt_direct_switch(out, value as i64);
                }
                MarkerType::SyscallTraceStart | MarkerType::SyscallTraceEnd => {}
                MarkerType::KernelEvent
                | MarkerType::KernelXfer
                | MarkerType::FuncRetval
                | MarkerType::Timestamp => {
                    self.maybe_inject_syscall_sequence(input, now);
                }
                _ => {}
            }
        }

        if let RecordKind::ThreadBoundary {
            kind: ThreadBoundaryKind::ThreadExit,
            ..
        } = &record.kind
        {
            self.maybe_inject_syscall_sequence(input, now);
        }

        Ok(())
    }

    fn maybe_inject_syscall_sequence(&self, input: &mut Input, now: u64) {
        let Some(syscall_number) = input.pending_syscall_trace.take() else {
            return;
        };
        let Some(template) = self.kernel_sequences.syscall_sequence(syscall_number) else {
            return;
        };
        let mut sequence = template.to_vec();
        patch_branch_target(&mut sequence);
        stamp_for_injection(&mut sequence, input.tid, input.pid);
        input
            .pending
            .push_front(Record::injected_marker(input.tid, input.pid, now, MarkerType::SyscallTraceEnd, syscall_number as u64));
        for r in sequence.into_iter().rev() {
            input.pending.push_front(r);
        }
        input
            .pending
            .push_front(Record::injected_marker(input.tid, input.pid, now, MarkerType::SyscallTraceStart, syscall_number as u64));
    }

    fn block_input(&self, input: &mut Input, now: u64, raw_value: u64) {
        let scaled = self.options.scale_block_time(raw_value);
        input.state = InputState::Blocked(Some(now + scaled));
    }

    fn attempt_direct_switch(&self, out: &mut Output, target_tid: i64) {
        let Some(&target_idx) = self.tid2input.get(&target_tid) else {
            out.stats.direct_switch_attempts += 1;
            return;
        };
        let mut target = self.inputs[target_idx].lock().unwrap();
        let eligible = matches!(target.state, InputState::Blocked(_) | InputState::Unscheduled { .. })
            && target.has_affinity_for(out.index);
        out.stats.direct_switch_attempts += 1;
        if eligible {
            target.state = InputState::Ready;
            drop(target);
            out.forced_next_input = Some(target_idx);
            out.force_yield = true;
            out.stats.direct_switch_successes += 1;
        }
    }

    fn finish_delivery(
        &self,
        out: &mut Output,
        input_idx: usize,
        record: Record,
        now: u64,
        skip: Option<(u64, u64)>,
    ) -> Result<(StreamStatus, Option<Record>), SchedulerError> {
        if !record.synthetic {
            self.last_emitted_timestamp.fetch_max(record.timestamp, Ordering::SeqCst);
        }
        out.last_record = Some(record.clone());
        if let Some(writer) = out.recorded_schedule.as_mut() {
            match skip {
                Some((start, stop)) => writer.push_skip(input_idx as i32, start, stop, now),
                None => writer.push_default(input_idx as i32, 0, 0, now),
            }
        }

        // A record that left its input no longer `Running` (blocked,
        // unscheduled) must relinquish the output immediately rather than
        // wait out the remainder of its quantum (§4.2.5); likewise a
        // successful direct switch forces an immediate handoff (§8
        // scenario 4) even mid-quantum.
        let still_running = matches!(self.inputs[input_idx].lock().unwrap().state, InputState::Running);
        let forced_yield = std::mem::take(&mut out.force_yield);
        if !still_running {
            self.release_current(out, now);
        } else if forced_yield || (self.is_quantum_expired(out) && self.effective_mapping != MappingMode::MapAsPreviously) {
            self.preempt_current(out, now);
        }

        self.maybe_rebalance(out, now);

        let status = if skip.is_some() { StreamStatus::Skipped } else { StreamStatus::Ok };
        Ok((status, Some(record)))
    }

    /// Releases `out`'s current input without requeuing it (the input is
    /// blocked, unscheduled, or otherwise not eligible to be picked
    /// again right away).
    fn release_current(&self, out: &mut Output, now: u64) {
        if let Some(idx) = out.cur_input.take() {
            let mut input = self.inputs[idx].lock().unwrap();
            input.cur_output = None;
        }
        out.instrs_in_quantum = 0;
        out.time_spent_in_quantum = 0;
        out.quantum_start_time = now;
    }

    fn is_quantum_expired(&self, out: &Output) -> bool {
        match self.options.quantum_unit {
            QuantumUnit::Instructions => out.instrs_in_quantum >= self.options.quantum_duration_instrs,
            QuantumUnit::Time => {
                out.time_spent_in_quantum >= self.options.quantum_duration_us.saturating_mul(self.options.time_units_per_us)
            }
        }
    }

    fn preempt_current(&self, out: &mut Output, now: u64) {
        let Some(input_idx) = out.cur_input.take() else {
            return;
        };
        let mut input = self.inputs[input_idx].lock().unwrap();
        if input.state == InputState::Running {
            input.state = InputState::Ready;
            input.last_run_time = now;
            input.cur_output = None;
            drop(input);
            out.ready_queue.push_back(input_idx);
            out.stats.quantum_preempts += 1;
        }
        out.instrs_in_quantum = 0;
        out.time_spent_in_quantum = 0;
        out.quantum_start_time = now;
    }

    fn wake_expired_blocked_inputs(&self, now: u64) {
        for input_mutex in &self.inputs {
            let mut input = input_mutex.lock().unwrap();
            let wake = match &input.state {
                InputState::Blocked(Some(until)) => now >= *until,
                InputState::Unscheduled { timeout: Some(until) } => now >= *until,
                _ => false,
            };
            if wake {
                input.state = InputState::Ready;
            }
        }
    }

    fn pick_next_input(&self, out: &mut Output, now: u64) -> Result<PickOutcome, SchedulerError> {
        if self.fraction_exit_reached() {
            return Ok(PickOutcome::Eof);
        }
        if let Some(forced) = out.forced_next_input.take() {
            let mut input = self.inputs[forced].lock().unwrap();
            if input.state == InputState::Ready {
                input.cur_output = Some(out.index);
                drop(input);
                out.ready_queue.retain(|&i| i != forced);
                return Ok(PickOutcome::Stolen(forced));
            }
        }

        // Pull in any inputs that became Ready (woken from blocked/
        // unscheduled) but are not yet reflected in this output's queue.
        for input_mutex in &self.inputs {
            let input = input_mutex.lock().unwrap();
            if input.state == InputState::Ready
                && input.cur_output.is_none()
                && input.has_affinity_for(out.index)
                && !out.ready_queue.contains(&input.index)
                && self.effective_mapping == MappingMode::MapToAnyOutput
            {
                let idx = input.index;
                drop(input);
                out.ready_queue.push_back(idx);
            }
        }

        // Tie-break per §4.2.10: higher priority first, then smaller
        // `last_run_time`, then smaller input index. `randomize_next_input`
        // instead draws uniformly from whatever is eligible, still subject
        // to the timestamp-dependency filter below.
        let mut eligible: Vec<(usize, i32, u64)> = Vec::new();
        for (pos, &idx) in out.ready_queue.iter().enumerate() {
            let mut input = self.inputs[idx].lock().unwrap();
            if input.state != InputState::Ready {
                continue;
            }
            if self.options.deps == DependencyMode::Timestamps {
                let ts = input.peek_timestamp()?;
                if let Some(ts) = ts {
                    if ts < self.last_emitted_timestamp.load(Ordering::SeqCst) {
                        continue;
                    }
                }
            }
            eligible.push((pos, input.spec.priority, input.last_run_time));
        }

        let best_pos = if self.options.randomize_next_input {
            if eligible.is_empty() {
                None
            } else {
                let choice = rand::thread_rng().gen_range(0, eligible.len());
                let (pos, _, _) = eligible[choice];
                Some((pos, out.ready_queue[pos]))
            }
        } else {
            let mut best: Option<(i32, u64, usize)> = None;
            let mut best_pos = None;
            for &(pos, priority, last_run_time) in &eligible {
                let idx = out.ready_queue[pos];
                let candidate = (priority, last_run_time, idx);
                let better = match best {
                    None => true,
                    Some((best_prio, best_lrt, best_idx)) => {
                        candidate.0 > best_prio
                            || (candidate.0 == best_prio && candidate.1 < best_lrt)
                            || (candidate.0 == best_prio && candidate.1 == best_lrt && candidate.2 < best_idx)
                    }
                };
                if better {
                    best = Some(candidate);
                    best_pos = Some((pos, idx));
                }
            }
            best_pos
        };

        match best_pos {
            Some((pos, idx)) => {
                out.ready_queue.remove(pos);
                let mut input = self.inputs[idx].lock().unwrap();
                input.cur_output = Some(out.index);
                Ok(PickOutcome::Picked(idx))
            }
            None => {
                if self.live_input_count.load(Ordering::SeqCst) == 0 {
                    Ok(PickOutcome::Eof)
                } else if self.any_input_blocked_or_unscheduled() {
                    Ok(PickOutcome::Wait)
                } else {
                    Ok(PickOutcome::Idle)
                }
            }
        }
    }

    /// `exit_if_fraction_inputs_left` (§6): once the fraction of inputs
    /// still live drops below this threshold, treat the whole run as done
    /// rather than waiting out the long tail of stragglers. `0.0` (the
    /// default) disables the check.
    fn fraction_exit_reached(&self) -> bool {
        if self.options.exit_if_fraction_inputs_left <= 0.0 {
            return false;
        }
        let live = self.live_input_count.load(Ordering::SeqCst);
        if live == 0 {
            return false;
        }
        let fraction = live as f64 / self.total_input_count as f64;
        fraction <= self.options.exit_if_fraction_inputs_left
    }

    fn any_input_blocked_or_unscheduled(&self) -> bool {
        self.inputs.iter().any(|m| {
            matches!(
                m.lock().unwrap().state,
                InputState::Blocked(_) | InputState::Unscheduled { .. }
            )
        })
    }

    fn assign_input_to_output(&self, out: &mut Output, input_idx: usize, now: u64) -> Result<(), SchedulerError> {
        let mut input = self.inputs[input_idx].lock().unwrap();
        let migrated = input.cur_output != Some(out.index);
        input.cur_output = Some(out.index);
        input.state = InputState::Running;
        if migrated && out.cur_input.is_some() {
            out.stats.migrations += 1;
        }
        let switch_pid = input.pid;
        let prior_pid = out.last_pid;
        out.last_pid = Some(switch_pid);
        out.cur_input = Some(input_idx);
        out.instrs_in_quantum = 0;
        out.time_spent_in_quantum = 0;
        out.quantum_start_time = now;

        if let Some(prior_pid) = prior_pid {
            let transition = if prior_pid == switch_pid {
                TransitionType::ThreadSwitch
            } else {
                TransitionType::ProcessSwitch
            };
            if let Some(template) = self.kernel_sequences.context_switch_sequence(transition) {
                let mut sequence = template.to_vec();
                patch_branch_target(&mut sequence);
                stamp_for_injection(&mut sequence, input.tid, input.pid);
                input
                    .pending
                    .push_front(Record::injected_marker(input.tid, input.pid, now, MarkerType::ContextSwitchEnd, 0));
                for r in sequence.into_iter().rev() {
                    input.pending.push_front(r);
                }
                input
                    .pending
                    .push_front(Record::injected_marker(input.tid, input.pid, now, MarkerType::ContextSwitchStart, 0));
            }
        }
        Ok(())
    }

    /// `cur_out` is the output `finish_delivery` is already holding the
    /// lock for; it is threaded through to `rebalance` rather than
    /// re-locked, since `std::sync::Mutex` is non-reentrant and this output
    /// is frequently also the heaviest or lightest candidate once a run has
    /// been going long enough to trigger a rebalance pass.
    fn maybe_rebalance(&self, cur_out: &mut Output, now: u64) {
        if self.effective_mapping != MappingMode::MapToAnyOutput || self.rebalance_period == 0 {
            return;
        }
        let ticks = self.ticks_since_rebalance.fetch_add(1, Ordering::SeqCst) + 1;
        if ticks < self.rebalance_period {
            return;
        }
        self.ticks_since_rebalance.store(0, Ordering::SeqCst);
        self.rebalance(cur_out, now);
    }

    /// Moves inputs from overloaded output ready queues to underloaded
    /// ones, respecting affinity bindings and workload output-count
    /// limits (§4.2.2). `migration_threshold_us` gates which inputs are
    /// even considered: an input that ran recently is left in place so a
    /// single rebalance pass doesn't thrash it back and forth between two
    /// outputs that are momentarily close in load.
    ///
    /// `cur_out` (the caller's already-locked output) is read/mutated
    /// directly wherever it is the lightest or heaviest candidate, instead
    /// of locking `self.outputs[cur_out.index]` again.
    fn rebalance(&self, cur_out: &mut Output, now: u64) {
        let mut loads: Vec<(usize, usize)> = self
            .outputs
            .iter()
            .enumerate()
            .map(|(i, o)| {
                if i == cur_out.index {
                    (i, cur_out.ready_queue.len())
                } else {
                    (i, o.lock().unwrap().ready_queue.len())
                }
            })
            .collect();
        loads.sort_by_key(|&(_, len)| len);
        if loads.len() < 2 {
            return;
        }
        let (lightest, lightest_len) = loads[0];
        let (heaviest, heaviest_len) = loads[loads.len() - 1];
        if heaviest_len <= lightest_len + 1 {
            return;
        }
        let migration_threshold = self.options.migration_threshold_us.saturating_mul(self.options.time_units_per_us.max(1));
        let find_candidate = |queue: &std::collections::VecDeque<usize>| {
            queue.iter().position(|&idx| {
                let input = self.inputs[idx].lock().unwrap();
                input.has_affinity_for(lightest)
                    && self.workload_allows_output(&input, lightest)
                    && now.saturating_sub(input.last_run_time) >= migration_threshold
            })
        };

        let moved = if heaviest == cur_out.index {
            find_candidate(&cur_out.ready_queue).map(|pos| cur_out.ready_queue.remove(pos).unwrap())
        } else {
            let mut heavy = self.outputs[heaviest].lock().unwrap();
            let candidate_pos = find_candidate(&heavy.ready_queue);
            candidate_pos.map(|pos| heavy.ready_queue.remove(pos).unwrap())
        };

        if let Some(idx) = moved {
            if lightest == cur_out.index {
                cur_out.ready_queue.push_back(idx);
            } else {
                self.outputs[lightest].lock().unwrap().ready_queue.push_back(idx);
            }
            debug!("rebalanced input {} from output {} to output {}", idx, heaviest, lightest);
        }
    }

    /// Whether moving `input` onto `candidate_output` would respect its
    /// workload's `output_count_limit`, if any (§3 "Workload").
    fn workload_allows_output(&self, input: &Input, candidate_output: usize) -> bool {
        let Some(&limit) = self.workload_limits.get(&input.workload_name) else {
            return true;
        };
        let outputs_in_use: std::collections::HashSet<usize> = self
            .inputs
            .iter()
            .filter_map(|m| {
                let other = m.lock().unwrap();
                if other.workload_name == input.workload_name {
                    other.cur_output
                } else {
                    None
                }
            })
            .collect();
        outputs_in_use.contains(&candidate_output) || outputs_in_use.len() < limit
    }

    fn next_record_replay(&self, output: usize, now: u64) -> Result<(StreamStatus, Option<Record>), SchedulerError> {
        let mut out = self.outputs[output].lock().unwrap();
        let replay = out
            .replay
            .as_mut()
            .ok_or_else(|| SchedulerError::Invalid("MAP_AS_PREVIOUSLY output has no replay state".into()))?;
        loop {
            if replay.pos >= replay.entries.len() {
                return Ok((StreamStatus::Eof, None));
            }
            let entry = replay.entries[replay.pos];
            replay.pos += 1;
            match entry.entry_type {
                EntryType::Version => continue,
                EntryType::Footer => return Ok((StreamStatus::Eof, None)),
                EntryType::IdleByCount => {
                    out.idle_count += entry.value_union;
                    out.stats.idle_ticks += entry.value_union;
                    return Ok((StreamStatus::Idle, None));
                }
                EntryType::SyntheticEnd => {
                    let input_idx = entry.input as usize;
                    let (tid, pid) = {
                        let input = self.inputs[input_idx].lock().unwrap();
                        (input.tid, input.pid)
                    };
                    let record = Record::thread_exit(tid, pid, entry.timestamp);
                    out.last_record = Some(record.clone());
                    return Ok((StreamStatus::Ok, Some(record)));
                }
                EntryType::Default | EntryType::Skip => {
                    let input_idx = entry.input as usize;
                    let mut input = self.inputs[input_idx].lock().unwrap();
                    if entry.entry_type == EntryType::Skip {
                        let skip_amount = entry.stop_instruction.saturating_sub(entry.value_union);
                        if skip_amount > 0 {
                            input.source.skip_instructions(skip_amount)?;
                        }
                    }
                    let record = match input.take_next()? {
                        Some(r) => r,
                        None => {
                            input.at_eof = true;
                            input.state = InputState::Eof;
                            drop(input);
                            let record = Record::thread_exit(
                                self.inputs[input_idx].lock().unwrap().tid,
                                self.inputs[input_idx].lock().unwrap().pid,
                                entry.timestamp,
                            );
                            out.last_record = Some(record.clone());
                            return Ok((StreamStatus::Ok, Some(record)));
                        }
                    };
                    if record.is_instruction() {
                        input.delivered_instr_ordinal += 1;
                        out.stats.instructions += 1;
                    }
                    out.last_record = Some(record.clone());
                    return Ok((StreamStatus::Ok, Some(record)));
                }
            }
        }
    }
}

enum PickOutcome {
    Picked(usize),
    /// Picked via a successful direct-switch request (§4.2.5): the output
    /// is handed straight to this input rather than drawing it from the
    /// ready queue in tie-break order, so the record that results reports
    /// `StreamStatus::Stole` instead of `Ok` (§4.2.1, §7).
    Stolen(usize),
    Wait,
    Idle,
    Eof,
}

enum RoiAction {
    /// A region was entered; `skip` is the `(from, to)` instruction-ordinal
    /// range jumped over to reach it, if any, so it can be recorded as a
    /// `Skip` schedule entry instead of a plain `Default` one (§4.2.8).
    WindowMarker { window_id: u64, skip: Option<(u64, u64)> },
    Exit,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::MemoryShard;
    use crate::workload::{InputSpec, Workload};

    fn instr_records(tid: i64, pid: i64, start_pc: u64, count: u64) -> Vec<Record> {
        (0..count)
            .map(|i| Record::instruction(tid, pid, i, start_pc + i * 4, 4))
            .collect()
    }

    fn spec(tid: i64) -> InputSpec {
        InputSpec {
            tid,
            pid: 1,
            ..Default::default()
        }
    }

    /// Drives `output` to completion (or `cap` calls, whichever first),
    /// skipping over `Idle`/`Wait` ticks since tests assert on the
    /// delivered-record sequence, not the scheduler's internal stalls.
    fn drive(scheduler: &Scheduler, output: usize, cap: usize) -> Vec<Record> {
        let mut records = Vec::new();
        for _ in 0..cap {
            let (status, record) = scheduler.next_record(output, 0).unwrap();
            match status {
                StreamStatus::Eof => return records,
                StreamStatus::Ok | StreamStatus::Skipped | StreamStatus::Stole => {
                    if let Some(r) = record {
                        records.push(r);
                    }
                }
                StreamStatus::Idle | StreamStatus::Wait => continue,
                other => panic!("unexpected status {:?}", other),
            }
        }
        panic!("drive() did not reach EOF within {} calls", cap);
    }

    fn tid_run_lengths(records: &[Record]) -> Vec<(i64, usize)> {
        let mut runs = Vec::new();
        for r in records.iter().filter(|r| r.is_instruction()) {
            match runs.last_mut() {
                Some((tid, count)) if *tid == r.tid => *count += 1,
                _ => runs.push((r.tid, 1)),
            }
        }
        runs
    }

    // Scenario 1 (§8): one shard, 100 instructions, single output.
    #[test]
    fn scenario_1_serial_single_input() {
        let workload = Workload::new("w").with_input(spec(1), Box::new(MemoryShard::new(instr_records(1, 1, 0x1000, 100))));
        let scheduler = Scheduler::init(vec![workload], 1, SchedulerOptions::default()).unwrap();
        let records = drive(&scheduler, 0, 300);

        let instr_count = records.iter().filter(|r| r.is_instruction()).count();
        assert_eq!(instr_count, 100);
        assert!(matches!(
            records.last().unwrap().kind,
            RecordKind::ThreadBoundary {
                kind: ThreadBoundaryKind::ThreadExit,
                ..
            }
        ));
    }

    // Scenario 2 (§8): two inputs, dynamic mapping, instruction quantum
    // of 10, one output -> alternating 10-instruction runs.
    #[test]
    fn scenario_2_dynamic_mapping_quantum_alternation() {
        let workload = Workload::new("w")
            .with_input(spec(1), Box::new(MemoryShard::new(instr_records(1, 1, 0x1000, 30))))
            .with_input(spec(2), Box::new(MemoryShard::new(instr_records(2, 1, 0x2000, 30))));
        let options = SchedulerOptions {
            quantum_unit: QuantumUnit::Instructions,
            quantum_duration_instrs: 10,
            ..Default::default()
        };
        let scheduler = Scheduler::init(vec![workload], 1, options).unwrap();
        let records = drive(&scheduler, 0, 300);

        let runs = tid_run_lengths(&records);
        assert_eq!(runs, vec![(1, 10), (2, 10), (1, 10), (2, 10), (1, 10), (2, 10)]);
    }

    // Scenario 3 (§8): a blocking syscall stalls one input while another
    // continues to run on the same output.
    #[test]
    fn scenario_3_blocking_syscall_yields_output() {
        let mut a_records = instr_records(1, 1, 0x1000, 5);
        a_records.push(Record::marker(1, 1, 5, MarkerType::Syscall, 0));
        a_records.push(Record::marker(1, 1, 5, MarkerType::Blocking, 1_000_000));
        let workload = Workload::new("w")
            .with_input(spec(1), Box::new(MemoryShard::new(a_records)))
            .with_input(spec(2), Box::new(MemoryShard::new(instr_records(2, 1, 0x2000, 20))));
        let options = SchedulerOptions {
            blocking_switch_threshold: 100,
            block_time_multiplier: 0.001,
            block_time_max_us: 2000,
            time_units_per_us: 1,
            ..Default::default()
        };
        let scheduler = Scheduler::init(vec![workload], 1, options).unwrap();
        let records = drive(&scheduler, 0, 5000);

        let instr_tids: Vec<i64> = records.iter().filter(|r| r.is_instruction()).map(|r| r.tid).collect();
        assert_eq!(&instr_tids[0..5], &[1, 1, 1, 1, 1]);
        assert_eq!(&instr_tids[5..25], &[2; 20]);
        assert_eq!(instr_tids.len(), 25);
    }

    // Scenario 4 (§8): a direct switch hands the output straight to the
    // target input, mid-quantum, the record right after the request.
    #[test]
    fn scenario_4_direct_switch() {
        let mut b_records = instr_records(2, 1, 0x2000, 1);
        b_records.push(Record::marker(2, 1, 1, MarkerType::SyscallUnschedule, 0));
        let mut a_records = instr_records(1, 1, 0x1000, 2);
        a_records.push(Record::marker(1, 1, 2, MarkerType::SyscallSchedule, 2));
        a_records.push(Record::instruction(1, 1, 3, 0x1100, 4));
        let workload = Workload::new("w")
            .with_input(spec(2), Box::new(MemoryShard::new(b_records)))
            .with_input(spec(1), Box::new(MemoryShard::new(a_records)));
        let scheduler = Scheduler::init(vec![workload], 1, SchedulerOptions::default()).unwrap();
        let records = drive(&scheduler, 0, 300);

        let switch_pos = records
            .iter()
            .position(|r| r.marker_type() == Some(MarkerType::SyscallSchedule))
            .expect("direct switch marker delivered");
        assert_eq!(records[switch_pos + 1].tid, 2, "B must run immediately after A's direct-switch marker");
        assert_eq!(scheduler.output_stats(0).direct_switch_successes, 1);
    }

    // §4.2.1/§7: the record a successful direct switch hands to its target
    // reports `Stole`, not `Ok`, so callers can tell the pick didn't come
    // from the ready queue's normal tie-break order.
    #[test]
    fn direct_switch_reports_stole_status() {
        let mut b_records = instr_records(2, 1, 0x2000, 1);
        b_records.push(Record::marker(2, 1, 1, MarkerType::SyscallUnschedule, 0));
        let mut a_records = instr_records(1, 1, 0x1000, 2);
        a_records.push(Record::marker(1, 1, 2, MarkerType::SyscallSchedule, 2));
        let workload = Workload::new("w")
            .with_input(spec(2), Box::new(MemoryShard::new(b_records)))
            .with_input(spec(1), Box::new(MemoryShard::new(a_records)));
        let scheduler = Scheduler::init(vec![workload], 1, SchedulerOptions::default()).unwrap();

        let mut statuses = Vec::new();
        loop {
            let (status, record) = scheduler.next_record(0, 0).unwrap();
            if status == StreamStatus::Eof {
                break;
            }
            statuses.push((status, record.and_then(|r| r.marker_type())));
        }
        let stole_pos = statuses
            .iter()
            .position(|&(status, _)| status == StreamStatus::Stole)
            .expect("direct switch must surface StreamStatus::Stole");
        assert!(stole_pos > 0, "the stolen record must follow A's direct-switch marker");
    }

    // Scenario 5 (§8): region-of-interest replay skips outside the
    // declared ranges and brackets each with a WINDOW_ID marker.
    #[test]
    fn scenario_5_region_of_interest() {
        let records = instr_records(1, 1, 0, 1000);
        let mut input_spec = spec(1);
        input_spec.regions_of_interest = vec![
            crate::workload::InstructionRange::new(100, 200),
            crate::workload::InstructionRange::new(500, 600),
        ];
        let workload = Workload::new("w").with_input(input_spec, Box::new(MemoryShard::new(records)));
        let scheduler = Scheduler::init(vec![workload], 1, SchedulerOptions::default()).unwrap();
        let delivered = drive(&scheduler, 0, 5000);

        let instr_pcs: Vec<u64> = delivered
            .iter()
            .filter_map(|r| match r.kind {
                RecordKind::Instruction { pc, .. } => Some(pc),
                _ => None,
            })
            .collect();
        let expected_pcs: Vec<u64> = (100..200).chain(500..600).map(|i: u64| i * 4).collect();
        assert_eq!(instr_pcs, expected_pcs);

        let window_ids: Vec<u64> = delivered
            .iter()
            .filter(|r| r.marker_type() == Some(MarkerType::WindowId))
            .filter_map(|r| r.kind.marker_value())
            .collect();
        assert_eq!(window_ids, vec![1, 2]);

        assert!(matches!(
            delivered.last().unwrap().kind,
            RecordKind::ThreadBoundary {
                kind: ThreadBoundaryKind::ThreadExit,
                ..
            }
        ));
    }

    // §4.2.1/§4.2.8/§7: entering a region of interest that is not at the
    // start of the shard skips ahead, and the `WINDOW_ID` marker that
    // results reports `Skipped`, matching the schedule file's own `SKIP`
    // entry for the same jump.
    #[test]
    fn region_of_interest_entry_with_skip_reports_skipped_status() {
        let records = instr_records(1, 1, 0, 300);
        let mut input_spec = spec(1);
        input_spec.regions_of_interest = vec![crate::workload::InstructionRange::new(100, 200)];
        let workload = Workload::new("w").with_input(input_spec, Box::new(MemoryShard::new(records)));
        let scheduler = Scheduler::init(vec![workload], 1, SchedulerOptions::default()).unwrap();

        let (status, record) = scheduler.next_record(0, 0).unwrap();
        assert_eq!(status, StreamStatus::Skipped);
        assert_eq!(record.unwrap().marker_type(), Some(MarkerType::WindowId));
    }

    // Scenario 6 (§8): record a run, then replay it through
    // MAP_AS_PREVIOUSLY and expect the same delivered sequence.
    #[test]
    fn scenario_6_record_then_replay() {
        let dir = std::env::temp_dir().join(format!("trace_sched_test_{}_{}", std::process::id(), 6));
        let _ = std::fs::remove_dir_all(&dir);

        let workload = Workload::new("w").with_input(spec(1), Box::new(MemoryShard::new(instr_records(1, 1, 0x1000, 15))));
        let options = SchedulerOptions {
            schedule_record_dir: Some(dir.clone()),
            ..Default::default()
        };
        let scheduler = Scheduler::init(vec![workload], 1, options).unwrap();
        let original = drive(&scheduler, 0, 300);
        scheduler.finish_schedule_recording(original.last().unwrap().timestamp).unwrap();

        let replay_workload = Workload::new("w").with_input(spec(1), Box::new(MemoryShard::new(instr_records(1, 1, 0x1000, 15))));
        let replay_options = SchedulerOptions {
            mapping: MappingMode::MapAsPreviously,
            schedule_replay_dir: Some(dir.clone()),
            ..Default::default()
        };
        let replay_scheduler = Scheduler::init(vec![replay_workload], 1, replay_options).unwrap();
        let replayed = drive(&replay_scheduler, 0, 300);

        let original_tids: Vec<i64> = original.iter().map(|r| r.tid).collect();
        let replayed_tids: Vec<i64> = replayed.iter().map(|r| r.tid).collect();
        assert_eq!(original_tids, replayed_tids);
        assert_eq!(original.len(), replayed.len());

        let _ = std::fs::remove_dir_all(&dir);
    }

    // §8 invariant: no input delivered a record after `at_eof` was set.
    #[test]
    fn at_eof_is_never_cleared() {
        let workload = Workload::new("w").with_input(spec(1), Box::new(MemoryShard::new(instr_records(1, 1, 0, 3))));
        let scheduler = Scheduler::init(vec![workload], 1, SchedulerOptions::default()).unwrap();
        drive(&scheduler, 0, 50);
        assert!(scheduler.inputs[0].lock().unwrap().at_eof);
        let (status, _) = scheduler.next_record(0, 0).unwrap();
        assert_eq!(status, StreamStatus::Eof);
    }

    // §8 invariant: an input is never granted more than
    // quantum_duration_instrs + 1 instructions between switches.
    #[test]
    fn quantum_preemption_bound() {
        let workload = Workload::new("w")
            .with_input(spec(1), Box::new(MemoryShard::new(instr_records(1, 1, 0x1000, 45))))
            .with_input(spec(2), Box::new(MemoryShard::new(instr_records(2, 1, 0x2000, 45))));
        let options = SchedulerOptions {
            quantum_unit: QuantumUnit::Instructions,
            quantum_duration_instrs: 7,
            ..Default::default()
        };
        let scheduler = Scheduler::init(vec![workload], 1, options).unwrap();
        let records = drive(&scheduler, 0, 500);
        let runs = tid_run_lengths(&records);
        for (_, count) in runs {
            assert!(count <= 8, "run of {} exceeds quantum_duration_instrs + 1", count);
        }
    }

    // `exit_if_fraction_inputs_left` (§6): once enough inputs have hit EOF,
    // the run ends for the remaining stragglers too instead of draining
    // them to completion.
    #[test]
    fn exit_if_fraction_inputs_left_cuts_off_stragglers() {
        let workload = Workload::new("w")
            .with_input(spec(1), Box::new(MemoryShard::new(instr_records(1, 1, 0x1000, 5))))
            .with_input(spec(2), Box::new(MemoryShard::new(instr_records(2, 1, 0x2000, 5))))
            .with_input(spec(3), Box::new(MemoryShard::new(instr_records(3, 1, 0x3000, 5))))
            .with_input(spec(4), Box::new(MemoryShard::new(instr_records(4, 1, 0x4000, 1_000_000))));
        let options = SchedulerOptions {
            quantum_unit: QuantumUnit::Instructions,
            quantum_duration_instrs: 5,
            exit_if_fraction_inputs_left: 0.5,
            ..Default::default()
        };
        let scheduler = Scheduler::init(vec![workload], 1, options).unwrap();
        let records = drive(&scheduler, 0, 10_000);
        let delivered_from_4: u64 = records.iter().filter(|r| r.is_instruction() && r.tid == 4).count() as u64;
        assert!(
            delivered_from_4 < 1_000_000,
            "straggler input 4 should not have been drained to completion"
        );
    }

    // `single_lockstep_output` (§6): the analyzer driver forces serial
    // (round-robin, single-thread) execution when this option is set, even
    // if parallel mode was requested; exercised indirectly here via the
    // scheduler accessor since `AnalyzerDriver` lives in `analyzer.rs`.
    #[test]
    fn single_lockstep_output_flag_is_threaded_through_options() {
        let workload = Workload::new("w").with_input(spec(1), Box::new(MemoryShard::new(instr_records(1, 1, 0, 3))));
        let options = SchedulerOptions {
            single_lockstep_output: true,
            ..Default::default()
        };
        let scheduler = Scheduler::init(vec![workload], 1, options).unwrap();
        assert!(scheduler.single_lockstep_output());
    }
}
