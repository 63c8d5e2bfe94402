//! The analyzer driver (§4.3): spawns workers, pumps each output stream
//! through the scheduler, dispatches records to tools, and aggregates
//! interval snapshots.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{SchedulerError, StreamStatus};
use crate::intervals::{instruction_interval_id, timestamp_interval_id};
use crate::record::{MarkerType, Record};
use crate::scheduler::Scheduler;

/// Identifies which shard an interval snapshot belongs to. In parallel
/// mode a shard is one output stream for its entire lifetime; in serial
/// mode there is exactly one worker driving every output in round-robin,
/// so every snapshot belongs to the single `WholeTrace` shard (§8
/// scenario 1).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShardId {
    Shard(usize),
    WholeTrace,
}

/// A periodic tool-state capture keyed to a timestamp or instruction
/// count boundary (§3 "Interval snapshot").
pub struct IntervalSnapshot {
    pub shard_id: ShardId,
    pub interval_id: u64,
    pub end_timestamp: u64,
    pub instr_count_cumulative: u64,
    pub instr_count_delta: u64,
    pub tool_state: Box<dyn Any + Send>,
}

/// What a tool's per-record callback asks the driver to do next (§2:
/// "tools can signal early exit").
#[derive(Debug)]
pub enum ToolAction {
    Continue,
    ExitWithError(String),
}

/// The fixed callback contract every analysis tool implements (§6 "Tool
/// callback contract"). Mutable per-run state lives in the opaque
/// `worker_data`/`shard_data` objects the framework threads through,
/// not in `&mut self`, so a single `Tool` instance can be shared (via
/// `Arc`) across concurrently running workers.
pub trait Tool: Send + Sync {
    fn initialize_stream(&self) -> Result<(), SchedulerError> {
        Ok(())
    }

    /// Called once per shard type before any record of that type is
    /// dispatched to the tool. There is a single shard type in this crate
    /// (memref-style `Record`), so this fires once per shard setup
    /// alongside `parallel_shard_init_stream`.
    fn initialize_shard_type(&self) -> Result<(), SchedulerError> {
        Ok(())
    }

    fn parallel_worker_init(&self, _worker_idx: usize) -> Box<dyn Any + Send> {
        Box::new(())
    }

    fn parallel_shard_init_stream(&self, _shard: ShardId, _worker_data: &mut (dyn Any + Send)) -> Box<dyn Any + Send> {
        Box::new(())
    }

    /// Serial-mode callback: tools that don't need per-shard state can
    /// implement only this one.
    fn process_memref(&self, _record: &Record) -> ToolAction {
        ToolAction::Continue
    }

    /// Parallel-mode callback; defaults to delegating to `process_memref`
    /// for tools indifferent to sharding.
    fn parallel_shard_memref(&self, _shard_data: &mut (dyn Any + Send), record: &Record) -> ToolAction {
        self.process_memref(record)
    }

    fn parallel_shard_exit(&self, _shard_data: &mut (dyn Any + Send)) -> bool {
        true
    }

    fn parallel_shard_error(&self, _shard_data: &(dyn Any + Send)) -> String {
        String::new()
    }

    fn generate_shard_interval_snapshot(&self, _shard_data: &mut (dyn Any + Send), _id: u64) -> Option<Box<dyn Any + Send>> {
        None
    }

    /// Non-sharded counterpart of `generate_shard_interval_snapshot`, for
    /// tools run in serial mode that keep their interval state in `&self`
    /// rather than in per-shard data.
    fn generate_interval_snapshot(&self, _id: u64) -> Option<Box<dyn Any + Send>> {
        None
    }

    fn combine_interval_snapshots(&self, _list: &[IntervalSnapshot], _end_timestamp: u64) -> Box<dyn Any + Send> {
        Box::new(())
    }

    fn finalize_interval_snapshots(&self, _list: &mut [IntervalSnapshot]) {}

    fn print_results(&self) {}

    fn print_interval_results(&self, _list: &[IntervalSnapshot]) {}

    fn release_interval_snapshot(&self, _snapshot: IntervalSnapshot) {}

    fn parallel_worker_exit(&self, _worker_data: Box<dyn Any + Send>) {}
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunMode {
    Serial,
    Parallel,
}

/// Either a timestamp-us or instruction-count interval length; at most
/// one applies per run (§4.2.10).
#[derive(Copy, Clone, Debug)]
pub enum IntervalUnit {
    None,
    TimestampMicros(u64),
    Instructions(u64),
}

pub struct AnalyzerDriver {
    scheduler: Arc<Scheduler>,
    tools: Vec<Arc<dyn Tool>>,
    mode: RunMode,
    interval_unit: IntervalUnit,
}

impl AnalyzerDriver {
    pub fn new(scheduler: Arc<Scheduler>, tools: Vec<Arc<dyn Tool>>, mode: RunMode, interval_unit: IntervalUnit) -> Self {
        AnalyzerDriver {
            scheduler,
            tools,
            mode,
            interval_unit,
        }
    }

    /// Runs every tool's `initialize_stream`, drives the configured
    /// worker topology to completion, and merges interval snapshots
    /// (§4.3).
    pub fn run(&self) -> Result<(), SchedulerError> {
        for tool in &self.tools {
            tool.initialize_stream()?;
            tool.initialize_shard_type()?;
        }

        // `single_lockstep_output` forces one thread to walk every output
        // in round robin even when the caller asked for `Parallel`, since
        // lockstepping across outputs is incompatible with each output
        // racing ahead on its own worker thread (§6).
        let effective_mode = if self.scheduler.single_lockstep_output() {
            RunMode::Serial
        } else {
            self.mode
        };

        let per_worker_snapshots = match effective_mode {
            RunMode::Parallel => self.run_parallel()?,
            RunMode::Serial => {
                let driver = AnalyzerDriver {
                    scheduler: Arc::clone(&self.scheduler),
                    tools: self.tools.clone(),
                    mode: RunMode::Serial,
                    interval_unit: self.interval_unit,
                };
                vec![driver.run_worker(&[ShardId::Shard(0)], 0)?]
            }
        };

        let mut by_tool: Vec<Vec<IntervalSnapshot>> = (0..self.tools.len()).map(|_| Vec::new()).collect();
        for worker_result in per_worker_snapshots {
            for (i, snaps) in worker_result.into_iter().enumerate() {
                by_tool[i].extend(snaps);
            }
        }

        for (i, tool) in self.tools.iter().enumerate() {
            let mut merged = self.merge_intervals(tool.as_ref(), &mut by_tool[i]);
            for snapshot in by_tool[i].drain(..) {
                tool.release_interval_snapshot(snapshot);
            }
            tool.finalize_interval_snapshots(&mut merged);
            tool.print_interval_results(&merged);
            tool.print_results();
        }

        Ok(())
    }

    fn run_parallel(&self) -> Result<Vec<Vec<Vec<IntervalSnapshot>>>, SchedulerError> {
        let output_count = self.scheduler.output_count();
        let mut handles = Vec::with_capacity(output_count);
        for output in 0..output_count {
            let scheduler = Arc::clone(&self.scheduler);
            let tools = self.tools.clone();
            let interval_unit = self.interval_unit;
            handles.push(std::thread::spawn(move || {
                let driver = AnalyzerDriver {
                    scheduler,
                    tools,
                    mode: RunMode::Parallel,
                    interval_unit,
                };
                driver.run_worker(&[ShardId::Shard(output)], output)
            }));
        }
        let mut results = Vec::with_capacity(output_count);
        let mut first_error = None;
        for handle in handles {
            match handle.join().expect("worker thread panicked") {
                Ok(snaps) => results.push(snaps),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(results)
    }

    /// Drives `outputs` (a single output in parallel mode, all of them
    /// round-robin in serial mode) to completion for one worker.
    fn run_worker(&self, shard_ids: &[ShardId], worker_idx: usize) -> Result<Vec<Vec<IntervalSnapshot>>, SchedulerError> {
        let worker_data: Vec<std::cell::RefCell<Box<dyn Any + Send>>> = self
            .tools
            .iter()
            .map(|t| std::cell::RefCell::new(t.parallel_worker_init(worker_idx)))
            .collect();

        let shard_id = shard_ids[0];
        let mut shard_data: Vec<Box<dyn Any + Send>> = self
            .tools
            .iter()
            .zip(worker_data.iter())
            .map(|(t, wd)| t.parallel_shard_init_stream(shard_id, &mut *wd.borrow_mut()))
            .collect();

        let outputs: Vec<usize> = match self.mode {
            RunMode::Parallel => vec![worker_idx],
            RunMode::Serial => (0..self.scheduler.output_count()).collect(),
        };

        let mut snapshots: Vec<Vec<IntervalSnapshot>> = (0..self.tools.len()).map(|_| Vec::new()).collect();
        let mut first_ts: Option<u64> = None;
        let mut last_ts: u64 = 0;
        let mut instr_count_cumulative: u64 = 0;
        let mut last_boundary_cumulative: u64 = 0;
        let mut last_interval_id: u64 = 0;
        let mut done = vec![false; outputs.len()];
        let mut tool_error: Option<SchedulerError> = None;

        'outer: loop {
            if done.iter().all(|&d| d) {
                break;
            }
            for (slot, &output) in outputs.iter().enumerate() {
                if done[slot] {
                    continue;
                }
                let (status, record) = self.scheduler.next_record(output, 0)?;
                let record = match status {
                    StreamStatus::Eof => {
                        done[slot] = true;
                        continue;
                    }
                    StreamStatus::Wait => {
                        if self.mode == RunMode::Parallel {
                            std::thread::sleep(Duration::from_millis(1));
                        }
                        Record::injected_marker(-1, -1, last_ts, MarkerType::CoreWait, 0)
                    }
                    StreamStatus::Idle => Record::injected_marker(-1, -1, last_ts, MarkerType::CoreIdle, 0),
                    StreamStatus::RegionInvalid => {
                        return Err(SchedulerError::RangeInvalid(format!("output {} region invalid", output)))
                    }
                    StreamStatus::Ok | StreamStatus::Skipped | StreamStatus::Stole => match record {
                        Some(r) => r,
                        None => continue,
                    },
                };

                if first_ts.is_none() {
                    first_ts = Some(record.timestamp);
                }
                last_ts = record.timestamp;
                if record.is_instruction() {
                    instr_count_cumulative += 1;
                }

                if let Some(new_interval_id) = self.interval_boundary(first_ts.unwrap_or(0), last_ts, instr_count_cumulative) {
                    if new_interval_id != last_interval_id {
                        last_interval_id = new_interval_id;
                        for (i, tool) in self.tools.iter().enumerate() {
                            if let Some(state) = tool.generate_shard_interval_snapshot(&mut *shard_data[i], new_interval_id) {
                                snapshots[i].push(IntervalSnapshot {
                                    shard_id,
                                    interval_id: new_interval_id,
                                    end_timestamp: last_ts,
                                    instr_count_cumulative,
                                    instr_count_delta: instr_count_cumulative - last_boundary_cumulative,
                                    tool_state: state,
                                });
                            }
                        }
                        last_boundary_cumulative = instr_count_cumulative;
                    }
                }

                for (i, tool) in self.tools.iter().enumerate() {
                    match tool.parallel_shard_memref(&mut *shard_data[i], &record) {
                        ToolAction::Continue => {}
                        ToolAction::ExitWithError(msg) => {
                            self.scheduler.set_active(output, false);
                            tool_error = Some(SchedulerError::Invalid(format!(
                                "tool {} reported error on output {}: {}",
                                i, output, msg
                            )));
                        }
                    }
                }
                if tool_error.is_some() {
                    break 'outer;
                }
            }
        }

        if let Some(e) = tool_error {
            return Err(e);
        }

        for (i, tool) in self.tools.iter().enumerate() {
            if let Some(state) = tool.generate_shard_interval_snapshot(&mut *shard_data[i], last_interval_id + 1) {
                snapshots[i].push(IntervalSnapshot {
                    shard_id,
                    interval_id: last_interval_id + 1,
                    end_timestamp: last_ts,
                    instr_count_cumulative,
                    instr_count_delta: instr_count_cumulative - last_boundary_cumulative,
                    tool_state: state,
                });
            }
            if !tool.parallel_shard_exit(&mut *shard_data[i]) {
                let msg = tool.parallel_shard_error(&*shard_data[i]);
                return Err(SchedulerError::Invalid(format!("tool {} shard exit failed: {}", i, msg)));
            }
        }
        for (tool, wd) in self.tools.iter().zip(worker_data.into_iter()) {
            tool.parallel_worker_exit(wd.into_inner());
        }

        Ok(snapshots)
    }

    fn interval_boundary(&self, first_ts: u64, last_ts: u64, instr_count: u64) -> Option<u64> {
        match self.interval_unit {
            IntervalUnit::None => None,
            IntervalUnit::TimestampMicros(interval_us) if interval_us > 0 => {
                Some(timestamp_interval_id(first_ts, last_ts, interval_us))
            }
            IntervalUnit::Instructions(interval_instrs) if interval_instrs > 0 => {
                Some(instruction_interval_id(instr_count, interval_instrs))
            }
            _ => None,
        }
    }

    /// Interval merging (§4.3): walk all shards' snapshots in timestamp
    /// order, maintaining the latest snapshot per shard, and for each
    /// distinct end timestamp call `tool.combine_interval_snapshots` over
    /// the current set of latest-per-shard snapshots so far. Instruction-
    /// count intervals are reported per-shard as-is, unmerged, since they
    /// have no shared timeline to merge against.
    fn merge_intervals(&self, tool: &dyn Tool, snapshots: &mut Vec<IntervalSnapshot>) -> Vec<IntervalSnapshot> {
        if matches!(self.interval_unit, IntervalUnit::Instructions(_)) {
            return std::mem::take(snapshots);
        }
        snapshots.sort_by_key(|s| s.end_timestamp);

        let mut latest_per_shard: std::collections::HashMap<ShardId, usize> = std::collections::HashMap::new();
        let mut merged = Vec::new();
        let mut i = 0;
        while i < snapshots.len() {
            let ts = snapshots[i].end_timestamp;
            let mut j = i;
            while j < snapshots.len() && snapshots[j].end_timestamp == ts {
                latest_per_shard.insert(snapshots[j].shard_id, j);
                j += 1;
            }

            let mut indices: Vec<usize> = latest_per_shard.values().copied().collect();
            indices.sort_unstable();
            let latest: Vec<&IntervalSnapshot> = indices.iter().map(|&idx| &snapshots[idx]).collect();
            let cumulative: u64 = latest.iter().map(|s| s.instr_count_cumulative).sum();
            let delta: u64 = snapshots[i..j].iter().map(|s| s.instr_count_delta).sum();
            let combined_state = tool.combine_interval_snapshots(&latest, ts);

            merged.push(IntervalSnapshot {
                shard_id: ShardId::WholeTrace,
                interval_id: merged.len() as u64 + 1,
                end_timestamp: ts,
                instr_count_cumulative: cumulative,
                instr_count_delta: delta,
                tool_state: combined_state,
            });
            i = j;
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::input::MemoryShard;
    use crate::options::SchedulerOptions;
    use crate::scheduler::Scheduler;
    use crate::workload::{InputSpec, Workload};

    fn instrs(tid: i64, count: u64) -> Vec<Record> {
        (0..count).map(|i| Record::instruction(tid, 1, i, 0x1000 + i * 4, 4)).collect()
    }

    /// Counts delivered instructions and records the tid sequence seen, for
    /// asserting both totals and ordering out of a driver run.
    struct CountingTool {
        count: AtomicU64,
        tids_seen: Mutex<Vec<i64>>,
    }

    impl CountingTool {
        fn new() -> Self {
            CountingTool {
                count: AtomicU64::new(0),
                tids_seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl Tool for CountingTool {
        fn process_memref(&self, record: &Record) -> ToolAction {
            if record.is_instruction() {
                self.count.fetch_add(1, Ordering::Relaxed);
                self.tids_seen.lock().unwrap().push(record.tid);
            }
            ToolAction::Continue
        }
    }

    fn single_input_scheduler(count: u64) -> Arc<Scheduler> {
        let workload = Workload::new("w").with_input(
            InputSpec {
                tid: 1,
                pid: 1,
                ..Default::default()
            },
            Box::new(MemoryShard::new(instrs(1, count))),
        );
        Arc::new(Scheduler::init(vec![workload], 1, SchedulerOptions::default()).unwrap())
    }

    #[test]
    fn serial_run_delivers_every_instruction_exactly_once() {
        let scheduler = single_input_scheduler(20);
        let tool: Arc<CountingTool> = Arc::new(CountingTool::new());
        let driver = AnalyzerDriver::new(scheduler, vec![tool.clone()], RunMode::Serial, IntervalUnit::None);
        driver.run().unwrap();
        assert_eq!(tool.count.load(Ordering::Relaxed), 20);
        assert_eq!(tool.tids_seen.lock().unwrap().len(), 20);
        assert!(tool.tids_seen.lock().unwrap().iter().all(|&tid| tid == 1));
    }

    #[test]
    fn serial_run_round_robins_across_outputs() {
        let workload = Workload::new("w")
            .with_input(
                InputSpec {
                    tid: 1,
                    pid: 1,
                    ..Default::default()
                },
                Box::new(MemoryShard::new(instrs(1, 5))),
            )
            .with_input(
                InputSpec {
                    tid: 2,
                    pid: 1,
                    ..Default::default()
                },
                Box::new(MemoryShard::new(instrs(2, 5))),
            );
        let scheduler = Arc::new(Scheduler::init(vec![workload], 2, SchedulerOptions::default()).unwrap());
        let tool: Arc<CountingTool> = Arc::new(CountingTool::new());
        let driver = AnalyzerDriver::new(scheduler, vec![tool.clone()], RunMode::Serial, IntervalUnit::None);
        driver.run().unwrap();
        assert_eq!(tool.count.load(Ordering::Relaxed), 10);
        let seen = tool.tids_seen.lock().unwrap();
        assert_eq!(seen.iter().filter(|&&tid| tid == 1).count(), 5);
        assert_eq!(seen.iter().filter(|&&tid| tid == 2).count(), 5);
    }

    #[test]
    fn parallel_run_covers_every_output_independently() {
        let workload = Workload::new("w")
            .with_input(
                InputSpec {
                    tid: 1,
                    pid: 1,
                    ..Default::default()
                },
                Box::new(MemoryShard::new(instrs(1, 30))),
            )
            .with_input(
                InputSpec {
                    tid: 2,
                    pid: 1,
                    ..Default::default()
                },
                Box::new(MemoryShard::new(instrs(2, 30))),
            );
        let scheduler = Arc::new(Scheduler::init(vec![workload], 2, SchedulerOptions::default()).unwrap());
        let tool: Arc<CountingTool> = Arc::new(CountingTool::new());
        let driver = AnalyzerDriver::new(scheduler, vec![tool.clone()], RunMode::Parallel, IntervalUnit::None);
        driver.run().unwrap();
        assert_eq!(tool.count.load(Ordering::Relaxed), 60);
    }

    /// A tool that fails every record after the third, to exercise the
    /// driver's early-exit propagation.
    struct FailAfterThree {
        seen: AtomicU64,
    }

    impl Tool for FailAfterThree {
        fn process_memref(&self, record: &Record) -> ToolAction {
            if !record.is_instruction() {
                return ToolAction::Continue;
            }
            let n = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
            if n > 3 {
                ToolAction::ExitWithError("too many records".to_string())
            } else {
                ToolAction::Continue
            }
        }
    }

    #[test]
    fn tool_error_aborts_the_run() {
        let scheduler = single_input_scheduler(50);
        let tool: Arc<dyn Tool> = Arc::new(FailAfterThree { seen: AtomicU64::new(0) });
        let driver = AnalyzerDriver::new(scheduler, vec![tool], RunMode::Serial, IntervalUnit::None);
        let err = driver.run().unwrap_err();
        assert!(matches!(err, SchedulerError::Invalid(_)));
    }

    /// A tool that snapshots its running instruction count at each interval
    /// boundary, to exercise instruction-count interval generation (no
    /// merge-by-timestamp applies to this unit, each shard's snapshots pass
    /// through unmerged).
    struct IntervalCountingTool {
        running: Mutex<u64>,
    }

    impl Tool for IntervalCountingTool {
        fn process_memref(&self, record: &Record) -> ToolAction {
            if record.is_instruction() {
                *self.running.lock().unwrap() += 1;
            }
            ToolAction::Continue
        }

        fn generate_shard_interval_snapshot(&self, _shard_data: &mut (dyn Any + Send), _id: u64) -> Option<Box<dyn Any + Send>> {
            Some(Box::new(*self.running.lock().unwrap()))
        }
    }

    #[test]
    fn instruction_interval_snapshots_fire_on_boundaries() {
        let scheduler = single_input_scheduler(23);
        let tool: Arc<IntervalCountingTool> = Arc::new(IntervalCountingTool { running: Mutex::new(0) });
        let driver = AnalyzerDriver::new(
            scheduler.clone(),
            vec![tool.clone()],
            RunMode::Serial,
            IntervalUnit::Instructions(10),
        );
        let worker_snapshots = driver.run_worker(&[ShardId::Shard(0)], 0).unwrap();
        // 23 instructions at a width of 10 cross boundaries at 10 and 20,
        // plus the final forced snapshot at loop exit: 3 snapshots.
        assert_eq!(worker_snapshots[0].len(), 3);
        let counts: Vec<u64> = worker_snapshots[0]
            .iter()
            .map(|s| *s.tool_state.downcast_ref::<u64>().unwrap())
            .collect();
        assert_eq!(counts, vec![10, 20, 23]);
    }
}
