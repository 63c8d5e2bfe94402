//! The speculator that produces synthetic instruction records while an
//! output is speculating past a branch (§4.2.1 `start_speculation`,
//! §9 "the only supported strategy is 'emit nops advancing by one
//! instruction length per call'").

use crate::record::Record;

/// A fixed nop length in bytes; real decoders would vary this per
/// instruction-set, but the core has no decoder (§1 Non-goals).
const NOP_LENGTH: u64 = 1;

/// Produces the next synthetic instruction for a speculation frame
/// currently at `pc`, and returns the PC the following call should use.
pub fn next_speculative_instruction(tid: i64, pid: i64, timestamp: u64, pc: u64) -> (Record, u64) {
    let record = Record::instruction(tid, pid, timestamp, pc, NOP_LENGTH as u32);
    (record, pc + NOP_LENGTH)
}
