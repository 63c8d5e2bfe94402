//! The record types that flow between the input layer, the scheduler and
//! the analyzer driver.
//!
//! Two record "flavors" are supported by the wider system (a decoded
//! memref-style record and a raw on-disk trace-entry record); this crate
//! works exclusively in terms of the memref-style [`Record`] since that is
//! what the scheduler and analyzer both need to reason about (timestamps,
//! instruction ordinals, marker semantics). A raw-entry flavor would be a
//! thin re-encoding of the same fields and is left to the out-of-scope
//! codec backends to produce.

use std::fmt;

/// A marker value carries an out-of-band signal alongside the rest of the
/// trace. The payload is always a single pointer-sized integer; its
/// interpretation depends on `MarkerType`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum MarkerType {
    Timestamp,
    CpuId,
    FileType,
    CacheLineSize,
    PageSize,
    ChunkInstrCount,
    Version,
    Syscall,
    FuncId,
    FuncArg,
    FuncRetval,
    KernelEvent,
    KernelXfer,
    SyscallTraceStart,
    SyscallTraceEnd,
    ContextSwitchStart,
    ContextSwitchEnd,
    SyscallUnschedule,
    SyscallSchedule,
    WindowId,
    CoreIdle,
    CoreWait,
    BranchTarget,
    /// A marker declaring the blocking duration a syscall (or other event)
    /// incurred in the original recording; compared against
    /// `blocking_switch_threshold` in `SchedulerOptions`.
    Blocking,
}

/// The thread/pid boundary records that delimit a shard.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThreadBoundaryKind {
    ThreadStart,
    ThreadExit,
    Pid,
    Footer,
}

/// The payload carried by a single record. Every record belongs to exactly
/// one of these kinds (§3 Data Model).
#[derive(Clone, Debug, PartialEq)]
pub enum RecordKind {
    Instruction {
        pc: u64,
        size: u32,
    },
    Memory {
        addr: u64,
        size: u32,
        is_write: bool,
    },
    Marker {
        marker_type: MarkerType,
        value: u64,
    },
    ThreadBoundary {
        kind: ThreadBoundaryKind,
        tid: i64,
        pid: i64,
    },
    Invalid,
}

impl RecordKind {
    pub fn is_instruction(&self) -> bool {
        matches!(self, RecordKind::Instruction { .. })
    }

    pub fn is_marker(&self) -> bool {
        matches!(self, RecordKind::Marker { .. })
    }

    pub fn marker_type(&self) -> Option<MarkerType> {
        match self {
            RecordKind::Marker { marker_type, .. } => Some(*marker_type),
            _ => None,
        }
    }

    pub fn marker_value(&self) -> Option<u64> {
        match self {
            RecordKind::Marker { value, .. } => Some(*value),
            _ => None,
        }
    }
}

/// One record belonging to one input shard, as presented by the input
/// layer to the scheduler and, ultimately, to a tool.
///
/// `tid`/`pid` are carried on every record (not only thread-boundary
/// records) so that injected/synthetic records can be stamped with the
/// identity of the input they are injected into (§4.2.7).
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub kind: RecordKind,
    pub tid: i64,
    pub pid: i64,
    pub timestamp: u64,
    /// True if this record was synthesized by the scheduler (speculation,
    /// injected kernel sequence, synthetic thread-exit) rather than read
    /// from the underlying shard.
    pub synthetic: bool,
    /// True if this record falls inside an injected kernel sequence
    /// (context-switch or syscall-trace). Distinct from `synthetic`
    /// because a kernel sequence's *markers* (e.g. its own embedded
    /// timestamps) are not necessarily fabricated by us, just replayed.
    pub in_kernel_sequence: bool,
}

impl Record {
    pub fn instruction(tid: i64, pid: i64, timestamp: u64, pc: u64, size: u32) -> Self {
        Record {
            kind: RecordKind::Instruction { pc, size },
            tid,
            pid,
            timestamp,
            synthetic: false,
            in_kernel_sequence: false,
        }
    }

    pub fn marker(tid: i64, pid: i64, timestamp: u64, marker_type: MarkerType, value: u64) -> Self {
        Record {
            kind: RecordKind::Marker { marker_type, value },
            tid,
            pid,
            timestamp,
            synthetic: false,
            in_kernel_sequence: false,
        }
    }

    pub fn thread_exit(tid: i64, pid: i64, timestamp: u64) -> Self {
        Record {
            kind: RecordKind::ThreadBoundary {
                kind: ThreadBoundaryKind::ThreadExit,
                tid,
                pid,
            },
            tid,
            pid,
            timestamp,
            synthetic: true,
            in_kernel_sequence: false,
        }
    }

    /// A marker injected by the scheduler itself (kernel sequence
    /// brackets, region-of-interest window markers) rather than read from
    /// the underlying shard.
    pub fn injected_marker(tid: i64, pid: i64, timestamp: u64, marker_type: MarkerType, value: u64) -> Self {
        Record {
            kind: RecordKind::Marker { marker_type, value },
            tid,
            pid,
            timestamp,
            synthetic: true,
            in_kernel_sequence: true,
        }
    }

    pub fn is_instruction(&self) -> bool {
        self.kind.is_instruction()
    }

    pub fn marker_type(&self) -> Option<MarkerType> {
        self.kind.marker_type()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid={} pid={} ts={} {:?}", self.tid, self.pid, self.timestamp, self.kind)
    }
}
