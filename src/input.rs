//! The input layer (§4.1): a lazy, forward-only, bounded sequence of
//! records per recorded shard, plus the `Input` bookkeeping the scheduler
//! layers on top of it (§3 "Input").

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::Path;

use crate::error::SchedulerError;
use crate::record::{MarkerType, Record, RecordKind, ThreadBoundaryKind};
use crate::workload::InputSpec;

/// The result of `ShardSource::skip_instructions`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SkipOutcome {
    /// Skip succeeded; the source is now positioned after `n` instruction
    /// records.
    Skipped,
    /// The caller asked for the "skip to end" sentinel and the shard was
    /// shorter than expected; treated as a soft failure (§7).
    SkippedToEof,
}

/// The contract every concrete trace backend must satisfy (§4.1).
///
/// Concrete codec backends (gzip/zip/snappy/lz4) are out of scope per
/// spec.md §1; this crate ships `MemoryShard` (an in-memory mock, the
/// analogue of the pack's `mock_file_reader_t`/templated `file_reader_t<T>`
/// pattern) and `RawFileShard` (the one on-disk encoding within scope).
pub trait ShardSource {
    /// May block only for IPC-style inputs; none of this crate's backends
    /// do.
    fn init(&mut self) -> Result<(), SchedulerError>;

    /// Yields the next record, or `Ok(None)` at end of stream.
    fn next(&mut self) -> Result<Option<Record>, SchedulerError>;

    /// Advances past the next `n` instruction records (and any
    /// intervening non-instruction records). `n == u64::MAX` is the "skip
    /// to end" sentinel.
    fn skip_instructions(&mut self, n: u64) -> Result<SkipOutcome, SchedulerError>;

    fn record_ordinal(&self) -> u64;
    fn instruction_ordinal(&self) -> u64;
    fn first_timestamp(&self) -> u64;
    fn last_timestamp(&self) -> u64;
    fn file_type(&self) -> u64;
    fn cache_line_size(&self) -> u32;
    fn page_size(&self) -> u32;
    fn chunk_instr_count(&self) -> u64;
}

/// An in-memory shard backend built from a fixed `Vec<Record>`, used by
/// the scheduler's and analyzer's own test suites and by callers without a
/// file to read from.
pub struct MemoryShard {
    records: Vec<Record>,
    pos: usize,
    record_ordinal: u64,
    instruction_ordinal: u64,
    first_timestamp: u64,
    last_timestamp: u64,
    cache_line_size: u32,
    page_size: u32,
    chunk_instr_count: u64,
    file_type: u64,
}

impl MemoryShard {
    pub fn new(records: Vec<Record>) -> Self {
        MemoryShard {
            records,
            pos: 0,
            record_ordinal: 0,
            instruction_ordinal: 0,
            first_timestamp: 0,
            last_timestamp: 0,
            cache_line_size: 64,
            page_size: 4096,
            chunk_instr_count: 0,
            file_type: 0,
        }
    }
}

impl ShardSource for MemoryShard {
    fn init(&mut self) -> Result<(), SchedulerError> {
        if let Some(first) = self.records.first() {
            self.first_timestamp = first.timestamp;
        }
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Record>, SchedulerError> {
        if self.pos >= self.records.len() {
            return Ok(None);
        }
        let record = self.records[self.pos].clone();
        self.pos += 1;
        self.record_ordinal += 1;
        if record.is_instruction() {
            self.instruction_ordinal += 1;
        }
        self.last_timestamp = record.timestamp;
        if let Some(MarkerType::ChunkInstrCount) = record.marker_type() {
            if let RecordKind::Marker { value, .. } = record.kind {
                self.chunk_instr_count = value;
            }
        }
        if let Some(MarkerType::FileType) = record.marker_type() {
            if let RecordKind::Marker { value, .. } = record.kind {
                self.file_type = value;
            }
        }
        Ok(Some(record))
    }

    fn skip_instructions(&mut self, n: u64) -> Result<SkipOutcome, SchedulerError> {
        if n == u64::MAX {
            while self.next()?.is_some() {}
            return Ok(SkipOutcome::SkippedToEof);
        }
        let mut skipped = 0;
        loop {
            if skipped >= n {
                return Ok(SkipOutcome::Skipped);
            }
            match self.next()? {
                Some(r) if r.is_instruction() => skipped += 1,
                Some(_) => continue,
                None => {
                    return Err(SchedulerError::RangeInvalid(format!(
                        "shard ended after {} of {} requested instructions",
                        skipped, n
                    )))
                }
            }
        }
    }

    fn record_ordinal(&self) -> u64 {
        self.record_ordinal
    }
    fn instruction_ordinal(&self) -> u64 {
        self.instruction_ordinal
    }
    fn first_timestamp(&self) -> u64 {
        self.first_timestamp
    }
    fn last_timestamp(&self) -> u64 {
        self.last_timestamp
    }
    fn file_type(&self) -> u64 {
        self.file_type
    }
    fn cache_line_size(&self) -> u32 {
        self.cache_line_size
    }
    fn page_size(&self) -> u32 {
        self.page_size
    }
    fn chunk_instr_count(&self) -> u64 {
        self.chunk_instr_count
    }
}

/// A minimal fixed-width on-disk encoding for the one in-scope raw file
/// backend (§6): `{u8 kind, i64 tid, i64 pid, u64 timestamp, u64 a, u32 b,
/// u8 flag}`. Not the DynamoRIO wire format — that belongs to the
/// out-of-scope codec backends — just enough to let `RawFileShard`
/// round-trip records written by this crate's own tools.
mod raw_encoding {
    use super::*;

    const KIND_INSTRUCTION: u8 = 0;
    const KIND_MEMORY: u8 = 1;
    const KIND_MARKER: u8 = 2;
    const KIND_THREAD_BOUNDARY: u8 = 3;
    const KIND_INVALID: u8 = 4;

    fn marker_type_to_u8(m: MarkerType) -> u8 {
        use MarkerType::*;
        match m {
            Timestamp => 0,
            CpuId => 1,
            FileType => 2,
            CacheLineSize => 3,
            PageSize => 4,
            ChunkInstrCount => 5,
            Version => 6,
            Syscall => 7,
            FuncId => 8,
            FuncArg => 9,
            FuncRetval => 10,
            KernelEvent => 11,
            KernelXfer => 12,
            SyscallTraceStart => 13,
            SyscallTraceEnd => 14,
            ContextSwitchStart => 15,
            ContextSwitchEnd => 16,
            SyscallUnschedule => 17,
            SyscallSchedule => 18,
            WindowId => 19,
            CoreIdle => 20,
            CoreWait => 21,
            BranchTarget => 22,
            Blocking => 23,
        }
    }

    fn u8_to_marker_type(v: u8) -> Result<MarkerType, SchedulerError> {
        use MarkerType::*;
        Ok(match v {
            0 => Timestamp,
            1 => CpuId,
            2 => FileType,
            3 => CacheLineSize,
            4 => PageSize,
            5 => ChunkInstrCount,
            6 => Version,
            7 => Syscall,
            8 => FuncId,
            9 => FuncArg,
            10 => FuncRetval,
            11 => KernelEvent,
            12 => KernelXfer,
            13 => SyscallTraceStart,
            14 => SyscallTraceEnd,
            15 => ContextSwitchStart,
            16 => ContextSwitchEnd,
            17 => SyscallUnschedule,
            18 => SyscallSchedule,
            19 => WindowId,
            20 => CoreIdle,
            21 => CoreWait,
            22 => BranchTarget,
            23 => Blocking,
            other => return Err(SchedulerError::FileReadFailed(format!("unknown marker type tag {}", other))),
        })
    }

    fn boundary_to_u8(k: ThreadBoundaryKind) -> u8 {
        match k {
            ThreadBoundaryKind::ThreadStart => 0,
            ThreadBoundaryKind::ThreadExit => 1,
            ThreadBoundaryKind::Pid => 2,
            ThreadBoundaryKind::Footer => 3,
        }
    }

    fn u8_to_boundary(v: u8) -> Result<ThreadBoundaryKind, SchedulerError> {
        Ok(match v {
            0 => ThreadBoundaryKind::ThreadStart,
            1 => ThreadBoundaryKind::ThreadExit,
            2 => ThreadBoundaryKind::Pid,
            3 => ThreadBoundaryKind::Footer,
            other => {
                return Err(SchedulerError::FileReadFailed(format!(
                    "unknown thread-boundary tag {}",
                    other
                )))
            }
        })
    }

    pub fn write_record<W: Write>(w: &mut W, r: &Record) -> std::io::Result<()> {
        w.write_all(&r.tid.to_le_bytes())?;
        w.write_all(&r.pid.to_le_bytes())?;
        w.write_all(&r.timestamp.to_le_bytes())?;
        match &r.kind {
            RecordKind::Instruction { pc, size } => {
                w.write_all(&[KIND_INSTRUCTION])?;
                w.write_all(&pc.to_le_bytes())?;
                w.write_all(&size.to_le_bytes())?;
                w.write_all(&[0])?;
            }
            RecordKind::Memory { addr, size, is_write } => {
                w.write_all(&[KIND_MEMORY])?;
                w.write_all(&addr.to_le_bytes())?;
                w.write_all(&size.to_le_bytes())?;
                w.write_all(&[*is_write as u8])?;
            }
            RecordKind::Marker { marker_type, value } => {
                w.write_all(&[KIND_MARKER])?;
                w.write_all(&value.to_le_bytes())?;
                w.write_all(&0u32.to_le_bytes())?;
                w.write_all(&[marker_type_to_u8(*marker_type)])?;
            }
            RecordKind::ThreadBoundary { kind, .. } => {
                w.write_all(&[KIND_THREAD_BOUNDARY])?;
                w.write_all(&0u64.to_le_bytes())?;
                w.write_all(&0u32.to_le_bytes())?;
                w.write_all(&[boundary_to_u8(*kind)])?;
            }
            RecordKind::Invalid => {
                w.write_all(&[KIND_INVALID])?;
                w.write_all(&0u64.to_le_bytes())?;
                w.write_all(&0u32.to_le_bytes())?;
                w.write_all(&[0])?;
            }
        }
        Ok(())
    }

    pub fn read_record<R: Read>(r: &mut R) -> std::io::Result<Option<Record>> {
        let mut tid_buf = [0u8; 8];
        match r.read_exact(&mut tid_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let tid = i64::from_le_bytes(tid_buf);
        let mut pid_buf = [0u8; 8];
        r.read_exact(&mut pid_buf)?;
        let pid = i64::from_le_bytes(pid_buf);
        let mut ts_buf = [0u8; 8];
        r.read_exact(&mut ts_buf)?;
        let timestamp = u64::from_le_bytes(ts_buf);
        let mut kind_buf = [0u8; 1];
        r.read_exact(&mut kind_buf)?;
        let mut a_buf = [0u8; 8];
        r.read_exact(&mut a_buf)?;
        let a = u64::from_le_bytes(a_buf);
        let mut b_buf = [0u8; 4];
        r.read_exact(&mut b_buf)?;
        let b = u32::from_le_bytes(b_buf);
        let mut flag_buf = [0u8; 1];
        r.read_exact(&mut flag_buf)?;
        let flag = flag_buf[0];

        let kind = match kind_buf[0] {
            KIND_INSTRUCTION => RecordKind::Instruction { pc: a, size: b },
            KIND_MEMORY => RecordKind::Memory {
                addr: a,
                size: b,
                is_write: flag != 0,
            },
            KIND_MARKER => RecordKind::Marker {
                marker_type: u8_to_marker_type(flag)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?,
                value: a,
            },
            KIND_THREAD_BOUNDARY => RecordKind::ThreadBoundary {
                kind: u8_to_boundary(flag)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?,
                tid,
                pid,
            },
            _ => RecordKind::Invalid,
        };
        Ok(Some(Record {
            kind,
            tid,
            pid,
            timestamp,
            synthetic: false,
            in_kernel_sequence: false,
        }))
    }
}

pub use raw_encoding::{read_record as read_raw_record, write_record as write_raw_record};

/// The one in-scope on-disk backend: reads the fixed encoding written by
/// `raw_encoding::write_record`.
pub struct RawFileShard {
    reader: std::io::BufReader<std::fs::File>,
    record_ordinal: u64,
    instruction_ordinal: u64,
    first_timestamp: u64,
    last_timestamp: u64,
    cache_line_size: u32,
    page_size: u32,
    chunk_instr_count: u64,
    file_type: u64,
}

impl RawFileShard {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let file = std::fs::File::open(path.as_ref()).map_err(|e| SchedulerError::FileOpenFailed {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;
        Ok(RawFileShard {
            reader: std::io::BufReader::new(file),
            record_ordinal: 0,
            instruction_ordinal: 0,
            first_timestamp: 0,
            last_timestamp: 0,
            cache_line_size: 64,
            page_size: 4096,
            chunk_instr_count: 0,
            file_type: 0,
        })
    }
}

impl ShardSource for RawFileShard {
    fn init(&mut self) -> Result<(), SchedulerError> {
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Record>, SchedulerError> {
        let record = raw_encoding::read_record(&mut self.reader)
            .map_err(|e| SchedulerError::FileReadFailed(e.to_string()))?;
        if let Some(record) = &record {
            self.record_ordinal += 1;
            if self.record_ordinal == 1 {
                self.first_timestamp = record.timestamp;
            }
            if record.is_instruction() {
                self.instruction_ordinal += 1;
            }
            self.last_timestamp = record.timestamp;
            match record.kind {
                RecordKind::Marker {
                    marker_type: MarkerType::ChunkInstrCount,
                    value,
                } => self.chunk_instr_count = value,
                RecordKind::Marker {
                    marker_type: MarkerType::FileType,
                    value,
                } => self.file_type = value,
                _ => {}
            }
        }
        Ok(record)
    }

    fn skip_instructions(&mut self, n: u64) -> Result<SkipOutcome, SchedulerError> {
        if n == u64::MAX {
            while self.next()?.is_some() {}
            return Ok(SkipOutcome::SkippedToEof);
        }
        let mut skipped = 0;
        loop {
            if skipped >= n {
                return Ok(SkipOutcome::Skipped);
            }
            match self.next()? {
                Some(r) if r.is_instruction() => skipped += 1,
                Some(_) => continue,
                None => {
                    return Err(SchedulerError::RangeInvalid(format!(
                        "shard ended after {} of {} requested instructions",
                        skipped, n
                    )))
                }
            }
        }
    }

    fn record_ordinal(&self) -> u64 {
        self.record_ordinal
    }
    fn instruction_ordinal(&self) -> u64 {
        self.instruction_ordinal
    }
    fn first_timestamp(&self) -> u64 {
        self.first_timestamp
    }
    fn last_timestamp(&self) -> u64 {
        self.last_timestamp
    }
    fn file_type(&self) -> u64 {
        self.file_type
    }
    fn cache_line_size(&self) -> u32 {
        self.cache_line_size
    }
    fn page_size(&self) -> u32 {
        self.page_size
    }
    fn chunk_instr_count(&self) -> u64 {
        self.chunk_instr_count
    }
}

/// Known auxiliary basenames skipped during directory discovery (§6).
const AUX_BASENAMES: &[&str] = &[
    "modules",
    "funclist",
    "encodings",
    "v2p",
    "serial_schedule",
    "cpu_schedule",
];

/// Sorts and filters a directory listing down to shard files, per §6
/// ("Directory ordering is sorted by filename... Auxiliary filenames with
/// known basenames... are skipped").
pub fn discover_shard_files(dir: impl AsRef<Path>) -> Result<Vec<std::path::PathBuf>, SchedulerError> {
    let dir = dir.as_ref();
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| SchedulerError::FileOpenFailed {
            path: dir.display().to_string(),
            source: e,
        })?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            let stem = p.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            !AUX_BASENAMES.contains(&stem)
        })
        .collect();
    entries.sort();
    Ok(entries)
}

/// Where an input currently sits in the scheduler's state machine
/// (§4.2.9, "Per input state").
#[derive(Clone, Debug, PartialEq)]
pub enum InputState {
    Ready,
    Running,
    Preempted,
    /// Blocked until the scheduler's logical clock reaches this time, or
    /// forever if `None` and `honor_infinite_timeouts` is set.
    Blocked(Option<u64>),
    Unscheduled {
        timeout: Option<u64>,
    },
    Eof,
}

/// The scheduler's bookkeeping record for one input shard (§3 "Input").
pub struct Input {
    pub index: usize,
    pub tid: i64,
    pub pid: i64,
    pub workload_name: String,
    pub spec: InputSpec,
    pub source: Box<dyn ShardSource + Send>,
    /// Records the scheduler injected (kernel sequences, peeked/unread
    /// records) that have not yet been delivered.
    pub pending: VecDeque<Record>,
    pub state: InputState,
    pub cur_output: Option<usize>,
    /// Index into `spec.regions_of_interest` of the region currently (or
    /// next) being replayed.
    pub roi_pos: usize,
    pub last_run_time: u64,
    /// Visible instruction ordinal: only records actually delivered to a
    /// tool advance this (§4.2.10 "All output counts... increment only
    /// when... delivered").
    pub delivered_instr_ordinal: u64,
    pub at_eof: bool,
    /// Fall-through PC of the last real instruction emitted, used to patch
    /// injected sequences' `BRANCH_TARGET` marker (§4.2.7).
    pub last_fallthrough_pc: Option<u64>,
    /// A syscall number queued for sequence injection at the next
    /// injection point (§4.2.7).
    pub pending_syscall_trace: Option<i64>,
    /// Set once `source.next()` has returned `None`; distinguishes "not
    /// yet peeked" from "genuinely exhausted" for `peek_timestamp`.
    pub source_exhausted: bool,
    /// Region-of-interest replay progress (§4.2.6); `NotStarted` when
    /// `spec.regions_of_interest` is empty too, in which case it is never
    /// consulted.
    pub roi_state: RoiState,
}

/// Where an input sits in its region-of-interest replay (§4.2.6).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RoiState {
    NotStarted,
    InRegion,
    AtBoundary,
    Done,
}

impl Input {
    pub fn new(
        index: usize,
        tid: i64,
        pid: i64,
        workload_name: String,
        spec: InputSpec,
        source: Box<dyn ShardSource + Send>,
    ) -> Self {
        Input {
            index,
            tid,
            pid,
            workload_name,
            spec,
            source,
            pending: VecDeque::new(),
            state: InputState::Ready,
            cur_output: None,
            roi_pos: 0,
            last_run_time: 0,
            delivered_instr_ordinal: 0,
            at_eof: false,
            last_fallthrough_pc: None,
            pending_syscall_trace: None,
            source_exhausted: false,
            roi_state: RoiState::NotStarted,
        }
    }

    pub fn has_affinity_for(&self, output: usize) -> bool {
        match &self.spec.affinity {
            None => true,
            Some(outputs) => outputs.contains(&output),
        }
    }

    pub fn current_roi(&self) -> Option<crate::workload::InstructionRange> {
        self.spec.regions_of_interest.get(self.roi_pos).copied()
    }

    /// Returns the next record without delivering it, reading at most one
    /// record ahead from the underlying source (§4.2.3's readahead
    /// requirement for `DEPENDENCY_TIMESTAMPS`).
    pub fn peek_timestamp(&mut self) -> Result<Option<u64>, SchedulerError> {
        if let Some(r) = self.pending.front() {
            return Ok(Some(r.timestamp));
        }
        if self.source_exhausted {
            return Ok(None);
        }
        match self.source.next()? {
            Some(r) => {
                let ts = r.timestamp;
                self.pending.push_back(r);
                Ok(Some(ts))
            }
            None => {
                self.source_exhausted = true;
                Ok(None)
            }
        }
    }

    /// Consumes and returns the next record, whether it was sitting in
    /// the pending queue (injected, or picked up by a prior peek) or must
    /// be freshly read from the source.
    pub fn take_next(&mut self) -> Result<Option<Record>, SchedulerError> {
        if let Some(r) = self.pending.pop_front() {
            return Ok(Some(r));
        }
        if self.source_exhausted {
            return Ok(None);
        }
        match self.source.next()? {
            Some(r) => Ok(Some(r)),
            None => {
                self.source_exhausted = true;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrs(tid: i64, count: u64) -> Vec<Record> {
        (0..count).map(|i| Record::instruction(tid, 1, i, 0x1000 + i * 4, 4)).collect()
    }

    #[test]
    fn memory_shard_yields_records_in_order_then_eof() {
        let mut shard = MemoryShard::new(instrs(1, 3));
        shard.init().unwrap();
        assert_eq!(shard.next().unwrap().unwrap().timestamp, 0);
        assert_eq!(shard.next().unwrap().unwrap().timestamp, 1);
        assert_eq!(shard.next().unwrap().unwrap().timestamp, 2);
        assert!(shard.next().unwrap().is_none());
        assert_eq!(shard.instruction_ordinal(), 3);
        assert_eq!(shard.record_ordinal(), 3);
    }

    #[test]
    fn memory_shard_skip_instructions_lands_after_nth() {
        let mut shard = MemoryShard::new(instrs(1, 10));
        let outcome = shard.skip_instructions(4).unwrap();
        assert_eq!(outcome, SkipOutcome::Skipped);
        assert_eq!(shard.instruction_ordinal(), 4);
        let next = shard.next().unwrap().unwrap();
        assert_eq!(next.timestamp, 4);
    }

    #[test]
    fn memory_shard_skip_past_end_is_hard_failure() {
        let mut shard = MemoryShard::new(instrs(1, 3));
        let err = shard.skip_instructions(10).unwrap_err();
        assert!(matches!(err, SchedulerError::RangeInvalid(_)));
    }

    #[test]
    fn memory_shard_skip_to_eof_sentinel() {
        let mut shard = MemoryShard::new(instrs(1, 5));
        let outcome = shard.skip_instructions(u64::MAX).unwrap();
        assert_eq!(outcome, SkipOutcome::SkippedToEof);
        assert!(shard.next().unwrap().is_none());
    }

    #[test]
    fn memory_shard_skip_counts_only_instructions() {
        let mut records = vec![Record::marker(1, 1, 0, MarkerType::Syscall, 0)];
        records.extend(instrs(1, 2));
        let mut shard = MemoryShard::new(records);
        let outcome = shard.skip_instructions(2).unwrap();
        assert_eq!(outcome, SkipOutcome::Skipped);
        assert!(shard.next().unwrap().is_none());
    }

    #[test]
    fn raw_encoding_round_trips_every_kind() {
        let records = vec![
            Record::instruction(1, 2, 10, 0x4000, 4),
            Record {
                kind: RecordKind::Memory {
                    addr: 0x8000,
                    size: 8,
                    is_write: true,
                },
                tid: 1,
                pid: 2,
                timestamp: 11,
                synthetic: false,
                in_kernel_sequence: false,
            },
            Record::marker(1, 2, 12, MarkerType::Blocking, 5000),
            Record {
                kind: RecordKind::ThreadBoundary {
                    kind: ThreadBoundaryKind::ThreadExit,
                    tid: 1,
                    pid: 2,
                },
                tid: 1,
                pid: 2,
                timestamp: 13,
                synthetic: false,
                in_kernel_sequence: false,
            },
        ];
        let mut buf = Vec::new();
        for r in &records {
            raw_encoding::write_record(&mut buf, r).unwrap();
        }
        let mut cursor = std::io::Cursor::new(buf);
        let mut read_back = Vec::new();
        while let Some(r) = raw_encoding::read_record(&mut cursor).unwrap() {
            read_back.push(r);
        }
        assert_eq!(read_back.len(), records.len());
        for (original, decoded) in records.iter().zip(read_back.iter()) {
            assert_eq!(original.tid, decoded.tid);
            assert_eq!(original.pid, decoded.pid);
            assert_eq!(original.timestamp, decoded.timestamp);
            assert_eq!(original.kind, decoded.kind);
        }
    }

    #[test]
    fn raw_file_shard_round_trips_through_disk() {
        let path = std::env::temp_dir().join(format!("trace_sched_input_test_{}.raw", std::process::id()));
        {
            let file = std::fs::File::create(&path).unwrap();
            let mut writer = std::io::BufWriter::new(file);
            for r in instrs(7, 5) {
                raw_encoding::write_record(&mut writer, &r).unwrap();
            }
        }
        let mut shard = RawFileShard::open(&path).unwrap();
        let mut count = 0;
        while let Some(r) = shard.next().unwrap() {
            assert_eq!(r.tid, 7);
            count += 1;
        }
        assert_eq!(count, 5);
        assert_eq!(shard.instruction_ordinal(), 5);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn discover_shard_files_sorts_and_skips_auxiliary_basenames() {
        let dir = std::env::temp_dir().join(format!("trace_sched_input_dir_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["thread.2.trace", "thread.1.trace", "modules", "v2p"] {
            std::fs::write(dir.join(name), b"").unwrap();
        }
        let files = discover_shard_files(&dir).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["thread.1.trace", "thread.2.trace"]);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn peek_timestamp_does_not_consume_the_record() {
        let mut input = Input::new(
            0,
            1,
            1,
            "w".to_string(),
            InputSpec {
                tid: 1,
                pid: 1,
                ..Default::default()
            },
            Box::new(MemoryShard::new(instrs(1, 2))),
        );
        let ts = input.peek_timestamp().unwrap();
        assert_eq!(ts, Some(0));
        // Peeking again must return the same pending record, not advance.
        let ts2 = input.peek_timestamp().unwrap();
        assert_eq!(ts2, Some(0));
        let record = input.take_next().unwrap().unwrap();
        assert_eq!(record.timestamp, 0);
        let record2 = input.take_next().unwrap().unwrap();
        assert_eq!(record2.timestamp, 1);
        assert!(input.take_next().unwrap().is_none());
    }

    #[test]
    fn peek_timestamp_at_eof_returns_none_without_erroring_again() {
        let mut input = Input::new(
            0,
            1,
            1,
            "w".to_string(),
            InputSpec {
                tid: 1,
                pid: 1,
                ..Default::default()
            },
            Box::new(MemoryShard::new(instrs(1, 1))),
        );
        assert!(input.take_next().unwrap().is_some());
        assert_eq!(input.peek_timestamp().unwrap(), None);
        assert_eq!(input.peek_timestamp().unwrap(), None);
        assert!(input.take_next().unwrap().is_none());
    }

    #[test]
    fn has_affinity_for_respects_restricted_output_set() {
        let input = Input::new(
            0,
            1,
            1,
            "w".to_string(),
            InputSpec {
                tid: 1,
                pid: 1,
                affinity: Some(vec![2, 3]),
                ..Default::default()
            },
            Box::new(MemoryShard::new(Vec::new())),
        );
        assert!(!input.has_affinity_for(0));
        assert!(input.has_affinity_for(2));
        assert!(input.has_affinity_for(3));
    }
}
