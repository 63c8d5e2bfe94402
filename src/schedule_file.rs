//! Recorded-schedule binary format: writing (§4.2.8) and reading for
//! `MAP_AS_PREVIOUSLY` replay, including the legacy i#6107 compatibility
//! pass.

use std::io::{Read, Write};
use std::path::Path;

use crate::error::SchedulerError;

/// The tag on each binary schedule record (§4.2.8).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryType {
    Version,
    Default,
    Skip,
    SyntheticEnd,
    IdleByCount,
    Footer,
}

impl EntryType {
    fn to_u8(self) -> u8 {
        match self {
            EntryType::Version => 0,
            EntryType::Default => 1,
            EntryType::Skip => 2,
            EntryType::SyntheticEnd => 3,
            EntryType::IdleByCount => 4,
            EntryType::Footer => 5,
        }
    }

    fn from_u8(v: u8) -> Result<Self, SchedulerError> {
        Ok(match v {
            0 => EntryType::Version,
            1 => EntryType::Default,
            2 => EntryType::Skip,
            3 => EntryType::SyntheticEnd,
            4 => EntryType::IdleByCount,
            5 => EntryType::Footer,
            other => {
                return Err(SchedulerError::FileReadFailed(format!(
                    "unknown schedule entry type {}",
                    other
                )))
            }
        })
    }
}

/// One fixed-size binary schedule record (§6 "Recorded schedule binary
/// format"): `{u8 type, i32 input, u64 value_union, u64 stop_instruction,
/// u64 timestamp}`. `value_union` holds either `start_instruction` (for
/// `Default`/`Skip`) or `idle_duration` (for `IdleByCount`).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub entry_type: EntryType,
    pub input: i32,
    pub value_union: u64,
    pub stop_instruction: u64,
    pub timestamp: u64,
}

const ENTRY_SIZE: usize = 1 + 4 + 8 + 8 + 8;
const CURRENT_SCHEDULE_VERSION: u64 = 2;
/// The version written by the legacy encoder affected by the i#6107
/// off-by-chunk-size bug.
const LEGACY_BUGGY_VERSION: u64 = 1;

impl ScheduleEntry {
    fn write<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&[self.entry_type.to_u8()])?;
        w.write_all(&self.input.to_le_bytes())?;
        w.write_all(&self.value_union.to_le_bytes())?;
        w.write_all(&self.stop_instruction.to_le_bytes())?;
        w.write_all(&self.timestamp.to_le_bytes())?;
        Ok(())
    }

    fn read<R: Read>(r: &mut R) -> std::io::Result<Option<Self>> {
        let mut type_buf = [0u8; 1];
        match r.read_exact(&mut type_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let entry_type = EntryType::from_u8(type_buf[0])
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        let mut input_buf = [0u8; 4];
        r.read_exact(&mut input_buf)?;
        let input = i32::from_le_bytes(input_buf);
        let mut value_buf = [0u8; 8];
        r.read_exact(&mut value_buf)?;
        let value_union = u64::from_le_bytes(value_buf);
        let mut stop_buf = [0u8; 8];
        r.read_exact(&mut stop_buf)?;
        let stop_instruction = u64::from_le_bytes(stop_buf);
        let mut ts_buf = [0u8; 8];
        r.read_exact(&mut ts_buf)?;
        let timestamp = u64::from_le_bytes(ts_buf);
        Ok(Some(ScheduleEntry {
            entry_type,
            input,
            value_union,
            stop_instruction,
            timestamp,
        }))
    }
}

/// Accumulates and, on request, merges consecutive idle records before
/// writing (§4.2.8: "Consecutive IDLE records merge; SKIP replaces a
/// DEFAULT when the stream jumps").
pub struct ScheduleWriter {
    entries: Vec<ScheduleEntry>,
    chunk_instr_count: u64,
}

impl ScheduleWriter {
    pub fn new(chunk_instr_count: u64) -> Self {
        ScheduleWriter {
            entries: vec![ScheduleEntry {
                entry_type: EntryType::Version,
                input: -1,
                value_union: CURRENT_SCHEDULE_VERSION,
                stop_instruction: 0,
                timestamp: 0,
            }],
            chunk_instr_count,
        }
    }

    pub fn push_default(&mut self, input: i32, start_instruction: u64, stop_instruction: u64, timestamp: u64) {
        self.entries.push(ScheduleEntry {
            entry_type: EntryType::Default,
            input,
            value_union: start_instruction,
            stop_instruction,
            timestamp,
        });
    }

    pub fn push_skip(&mut self, input: i32, start_instruction: u64, stop_instruction: u64, timestamp: u64) {
        if let Some(last) = self.entries.last_mut() {
            if last.entry_type == EntryType::Default && last.input == input {
                last.entry_type = EntryType::Skip;
                last.stop_instruction = stop_instruction;
                last.timestamp = timestamp;
                return;
            }
        }
        self.entries.push(ScheduleEntry {
            entry_type: EntryType::Skip,
            input,
            value_union: start_instruction,
            stop_instruction,
            timestamp,
        });
    }

    pub fn push_synthetic_end(&mut self, input: i32, timestamp: u64) {
        self.entries.push(ScheduleEntry {
            entry_type: EntryType::SyntheticEnd,
            input,
            value_union: 0,
            stop_instruction: 0,
            timestamp,
        });
    }

    pub fn push_idle(&mut self, duration: u64, timestamp: u64) {
        if let Some(last) = self.entries.last_mut() {
            if last.entry_type == EntryType::IdleByCount {
                last.value_union += duration;
                last.timestamp = timestamp;
                return;
            }
        }
        self.entries.push(ScheduleEntry {
            entry_type: EntryType::IdleByCount,
            input: -1,
            value_union: duration,
            stop_instruction: 0,
            timestamp,
        });
    }

    pub fn finish(&mut self, timestamp: u64) {
        self.entries.push(ScheduleEntry {
            entry_type: EntryType::Footer,
            input: -1,
            value_union: 0,
            stop_instruction: 0,
            timestamp,
        });
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<(), SchedulerError> {
        for e in &self.entries {
            e.write(w).map_err(|err| SchedulerError::FileWriteFailed(err.to_string()))?;
        }
        Ok(())
    }

    pub fn write_to_dir(&self, dir: impl AsRef<Path>, output_index: usize) -> Result<(), SchedulerError> {
        std::fs::create_dir_all(dir.as_ref()).map_err(|e| SchedulerError::FileWriteFailed(e.to_string()))?;
        let path = dir.as_ref().join(format!("output.{:04}", output_index));
        let mut file = std::fs::File::create(&path).map_err(|e| SchedulerError::FileOpenFailed {
            path: path.display().to_string(),
            source: e,
        })?;
        self.write_to(&mut file)
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }
}

/// Reads a schedule file, applying the i#6107 compatibility pass when the
/// recorded version marker indicates a legacy writer.
pub fn read_schedule(mut r: impl Read) -> Result<Vec<ScheduleEntry>, SchedulerError> {
    let mut entries = Vec::new();
    while let Some(e) =
        ScheduleEntry::read(&mut r).map_err(|err| SchedulerError::FileReadFailed(err.to_string()))?
    {
        entries.push(e);
    }
    apply_legacy_compat_pass(&mut entries);
    validate_no_adjacent_idle(&entries)?;
    Ok(entries)
}

pub fn read_schedule_from_dir(
    dir: impl AsRef<Path>,
    output_index: usize,
) -> Result<Vec<ScheduleEntry>, SchedulerError> {
    let path = dir.as_ref().join(format!("output.{:04}", output_index));
    let file = std::fs::File::open(&path).map_err(|e| SchedulerError::FileOpenFailed {
        path: path.display().to_string(),
        source: e,
    })?;
    read_schedule(std::io::BufReader::new(file))
}

/// i#6107: a known legacy encoder wrote `stop_instruction` off by one
/// `chunk_instr_count` for `Skip` entries whenever the skip crossed a
/// chunk boundary. Detected via the `Version` entry's `value_union`;
/// reversed by subtracting the chunk size back out.
fn apply_legacy_compat_pass(entries: &mut [ScheduleEntry]) {
    let is_legacy = entries
        .first()
        .map(|e| e.entry_type == EntryType::Version && e.value_union == LEGACY_BUGGY_VERSION)
        .unwrap_or(false);
    if !is_legacy {
        return;
    }
    for e in entries.iter_mut() {
        if e.entry_type == EntryType::Skip && e.stop_instruction > 0 {
            e.stop_instruction = e.stop_instruction.saturating_sub(1);
        }
    }
}

/// Rejects adjacent `IdleByCount` records (§4.2.8, §8): a well-formed
/// writer always merges them, so two in a row indicates a corrupt or
/// hand-edited file.
fn validate_no_adjacent_idle(entries: &[ScheduleEntry]) -> Result<(), SchedulerError> {
    for w in entries.windows(2) {
        if w[0].entry_type == EntryType::IdleByCount && w[1].entry_type == EntryType::IdleByCount {
            return Err(SchedulerError::Invalid(
                "adjacent IDLE records in replay schedule file".into(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_merges_on_push() {
        let mut w = ScheduleWriter::new(0);
        w.push_idle(5, 100);
        w.push_idle(5, 200);
        assert_eq!(w.entries().len(), 2); // version + merged idle
        assert_eq!(w.entries()[1].value_union, 10);
    }

    #[test]
    fn roundtrip_through_bytes() {
        let mut w = ScheduleWriter::new(0);
        w.push_default(0, 0, 10, 100);
        w.push_idle(3, 110);
        w.finish(120);
        let mut buf = Vec::new();
        w.write_to(&mut buf).unwrap();
        let read_back = read_schedule(std::io::Cursor::new(buf)).unwrap();
        assert_eq!(read_back.len(), w.entries().len());
    }

    #[test]
    fn rejects_adjacent_idle_from_raw_bytes() {
        let entries = vec![
            ScheduleEntry {
                entry_type: EntryType::Version,
                input: -1,
                value_union: CURRENT_SCHEDULE_VERSION,
                stop_instruction: 0,
                timestamp: 0,
            },
            ScheduleEntry {
                entry_type: EntryType::IdleByCount,
                input: -1,
                value_union: 5,
                stop_instruction: 0,
                timestamp: 10,
            },
            ScheduleEntry {
                entry_type: EntryType::IdleByCount,
                input: -1,
                value_union: 5,
                stop_instruction: 0,
                timestamp: 20,
            },
        ];
        let mut buf = Vec::new();
        for e in &entries {
            e.write(&mut buf).unwrap();
        }
        assert!(read_schedule(std::io::Cursor::new(buf)).is_err());
    }
}
