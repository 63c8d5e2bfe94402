//! Kernel sequence injection templates (§4.2.7): context-switch sequences
//! keyed by transition type, and system-call sequences keyed by syscall
//! number.

use std::collections::HashMap;
use std::path::Path;

use crate::error::SchedulerError;
use crate::input::{read_raw_record, write_raw_record};
use crate::record::{MarkerType, Record, RecordKind};

/// The kind of context switch a recorded sequence represents.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TransitionType {
    ThreadSwitch,
    ProcessSwitch,
}

/// Holds the two kernel-sequence injection channels described in §4.2.7.
/// Both are populated once at `Scheduler::init` time from
/// `kernel_switch_trace_path`/`kernel_syscall_trace_path` and treated as
/// read-only afterward, same discipline as the tid→input table (§5).
#[derive(Default)]
pub struct KernelSequences {
    context_switch: HashMap<TransitionType, Vec<Record>>,
    syscall: HashMap<i64, Vec<Record>>,
}

impl KernelSequences {
    pub fn new() -> Self {
        KernelSequences::default()
    }

    pub fn set_context_switch_sequence(&mut self, transition: TransitionType, sequence: Vec<Record>) {
        self.context_switch.insert(transition, sequence);
    }

    pub fn set_syscall_sequence(&mut self, syscall_number: i64, sequence: Vec<Record>) {
        self.syscall.insert(syscall_number, sequence);
    }

    pub fn context_switch_sequence(&self, transition: TransitionType) -> Option<&[Record]> {
        self.context_switch.get(&transition).map(|v| v.as_slice())
    }

    pub fn syscall_sequence(&self, syscall_number: i64) -> Option<&[Record]> {
        self.syscall.get(&syscall_number).map(|v| v.as_slice())
    }

    /// Loads context-switch sequence templates from a directory holding
    /// `thread_switch` and/or `process_switch` files in this crate's raw
    /// record encoding (§6 "kernel-switch-trace-path").
    pub fn load_context_switch_dir(&mut self, dir: impl AsRef<Path>) -> Result<(), SchedulerError> {
        for (name, transition) in [
            ("thread_switch", TransitionType::ThreadSwitch),
            ("process_switch", TransitionType::ProcessSwitch),
        ] {
            let path = dir.as_ref().join(name);
            if !path.exists() {
                continue;
            }
            self.set_context_switch_sequence(transition, load_sequence_file(&path)?);
        }
        Ok(())
    }

    /// Loads syscall sequence templates from a directory whose files are
    /// named by syscall number (§6 "kernel-syscall-trace-path").
    pub fn load_syscall_dir(&mut self, dir: impl AsRef<Path>) -> Result<(), SchedulerError> {
        let entries = std::fs::read_dir(dir.as_ref()).map_err(|e| SchedulerError::FileOpenFailed {
            path: dir.as_ref().display().to_string(),
            source: e,
        })?;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(num) = stem.parse::<i64>() {
                    self.set_syscall_sequence(num, load_sequence_file(&path)?);
                }
            }
        }
        Ok(())
    }

    pub fn write_sequence_file(path: impl AsRef<Path>, sequence: &[Record]) -> Result<(), SchedulerError> {
        let mut file = std::fs::File::create(path.as_ref()).map_err(|e| SchedulerError::FileOpenFailed {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;
        for r in sequence {
            write_raw_record(&mut file, r).map_err(|e| SchedulerError::FileWriteFailed(e.to_string()))?;
        }
        Ok(())
    }
}

fn load_sequence_file(path: &Path) -> Result<Vec<Record>, SchedulerError> {
    let file = std::fs::File::open(path).map_err(|e| SchedulerError::FileOpenFailed {
        path: path.display().to_string(),
        source: e,
    })?;
    let mut reader = std::io::BufReader::new(file);
    let mut sequence = Vec::new();
    while let Some(r) =
        read_raw_record(&mut reader).map_err(|e| SchedulerError::FileReadFailed(e.to_string()))?
    {
        sequence.push(r);
    }
    Ok(sequence)
}

/// Finds the fall-through PC of the last instruction in a sequence, used
/// to patch the preceding `BRANCH_TARGET` marker when that instruction is
/// an indirect branch (§4.2.7). This crate has no decoder, so "indirect
/// branch" is approximated by the sequence's author flagging it: the last
/// instruction is treated as indirect whenever it is immediately preceded
/// by a `BRANCH_TARGET` marker placeholder (value `0`) in the template.
pub fn patch_branch_target(sequence: &mut [Record]) {
    let last_instr_end = sequence.iter().enumerate().rev().find_map(|(i, r)| match r.kind {
        RecordKind::Instruction { pc, size } => Some((i, pc + size as u64)),
        _ => None,
    });
    let Some((last_idx, fallthrough_pc)) = last_instr_end else {
        return;
    };
    for r in sequence[..last_idx].iter_mut().rev() {
        if let RecordKind::Marker {
            marker_type: MarkerType::BranchTarget,
            value,
        } = &mut r.kind
        {
            if *value == 0 {
                *value = fallthrough_pc;
            }
            break;
        }
    }
}

/// Stamps every record in an injected sequence with the host input's tid
/// and pid, and marks them as belonging to an injected kernel sequence
/// (§4.2.7: "All injected records are stamped with the target input's tid
/// and pid").
pub fn stamp_for_injection(sequence: &mut [Record], tid: i64, pid: i64) {
    for r in sequence.iter_mut() {
        r.tid = tid;
        r.pid = pid;
        r.synthetic = true;
        r.in_kernel_sequence = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;

    #[test]
    fn patches_branch_target_of_indirect_tail() {
        let mut seq = vec![
            Record::instruction(1, 1, 0, 0x1000, 4),
            Record::marker(1, 1, 0, MarkerType::BranchTarget, 0),
            Record::instruction(1, 1, 0, 0x1004, 2),
        ];
        patch_branch_target(&mut seq);
        assert_eq!(seq[1].kind.marker_value(), Some(0x1006));
    }
}
