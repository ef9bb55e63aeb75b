//! GLOBSET command stream codec.
//!
//! A GLOBSET encodes a sorted set of 48-bit counters as a small stack
//! machine. The stack holds the high-order bytes shared by the values that
//! follow; commands push and pop prefix bytes and emit singletons, ranges
//! and bitmasks against the current prefix.
//!
//! | Command       | Operands                              |
//! |---------------|---------------------------------------|
//! | `0x01..=0x06` | push that many prefix bytes           |
//! | `0x50`        | pop the most recent push              |
//! | `0x52`        | range: low suffix, high suffix        |
//! | `0x42`        | bitmask: starting byte, 8-bit mask    |
//! | `0x00`        | end                                   |
//!
//! Pushing a full six-byte value emits that singleton and pops it again.

use super::{ChangeSetError, CounterRange};

const CMD_END: u8 = 0x00;
const CMD_BITMASK: u8 = 0x42;
const CMD_POP: u8 = 0x50;
const CMD_RANGE: u8 = 0x52;

const COUNTER_LEN: usize = 6;

/// Prefix stack: the bytes themselves plus the size of each push.
#[derive(Default)]
struct PrefixStack {
    bytes: Vec<u8>,
    pushes: Vec<usize>,
}

impl PrefixStack {
    fn depth(&self) -> usize {
        self.bytes.len()
    }

    fn push(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
        self.pushes.push(bytes.len());
    }

    fn pop(&mut self) -> bool {
        match self.pushes.pop() {
            Some(n) => {
                self.bytes.truncate(self.bytes.len() - n);
                true
            }
            None => false,
        }
    }

    fn value_with(&self, suffix: &[u8]) -> u64 {
        self.bytes
            .iter()
            .chain(suffix)
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ChangeSetError> {
        let end = self.pos + n;
        if end > self.bytes.len() {
            return Err(ChangeSetError::Truncated { offset: self.pos });
        }
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn byte(&mut self) -> Result<u8, ChangeSetError> {
        Ok(self.take(1)?[0])
    }
}

/// Collects decoded ranges and enforces ascending, non-overlapping order.
#[derive(Default)]
struct RangeSink {
    ranges: Vec<CounterRange>,
}

impl RangeSink {
    fn emit(&mut self, low: u64, high: u64) -> Result<(), ChangeSetError> {
        if high < low {
            return Err(ChangeSetError::InvertedRange { low, high });
        }
        if let Some(last) = self.ranges.last_mut() {
            if low <= last.high {
                return Err(ChangeSetError::NonMonotonic {
                    low,
                    previous_high: last.high,
                });
            }
            if low == last.high + 1 {
                last.high = high;
                return Ok(());
            }
        }
        self.ranges.push(CounterRange { low, high });
        Ok(())
    }
}

/// Decode one GLOBSET starting at `offset`.
///
/// Returns the ranges (ascending, coalesced) and the offset just past the
/// end command.
pub fn decode(bytes: &[u8], offset: usize) -> Result<(Vec<CounterRange>, usize), ChangeSetError> {
    let mut reader = Reader { bytes, pos: offset };
    let mut stack = PrefixStack::default();
    let mut sink = RangeSink::default();

    loop {
        let command_offset = reader.pos;
        let command = reader.byte()?;
        match command {
            CMD_END => {
                if stack.depth() != 0 {
                    return Err(ChangeSetError::UnterminatedStack {
                        depth: stack.depth(),
                    });
                }
                return Ok((sink.ranges, reader.pos));
            }
            n @ 0x01..=0x06 => {
                let n = n as usize;
                if stack.depth() + n > COUNTER_LEN {
                    return Err(ChangeSetError::StackOverflow {
                        offset: command_offset,
                    });
                }
                let pushed = reader.take(n)?;
                stack.push(pushed);
                if stack.depth() == COUNTER_LEN {
                    let value = stack.value_with(&[]);
                    sink.emit(value, value)?;
                    stack.pop();
                }
            }
            CMD_POP => {
                if !stack.pop() {
                    return Err(ChangeSetError::StackUnderflow {
                        offset: command_offset,
                    });
                }
            }
            CMD_RANGE => {
                let suffix_len = COUNTER_LEN - stack.depth();
                if suffix_len == 0 {
                    return Err(ChangeSetError::StackOverflow {
                        offset: command_offset,
                    });
                }
                let low = stack.value_with(reader.take(suffix_len)?);
                let high = stack.value_with(reader.take(suffix_len)?);
                sink.emit(low, high)?;
            }
            CMD_BITMASK => {
                if stack.depth() != COUNTER_LEN - 1 {
                    return Err(ChangeSetError::BitmaskDepth {
                        depth: stack.depth(),
                    });
                }
                let start = reader.byte()?;
                let mask = reader.byte()?;
                let base = stack.value_with(&[start]);
                sink.emit(base, base)?;
                for bit in 0..8u64 {
                    if mask & (1 << bit) != 0 {
                        let value = base + 1 + bit;
                        sink.emit(value, value)?;
                    }
                }
            }
            other => {
                return Err(ChangeSetError::UnknownCommand {
                    command: other,
                    offset: command_offset,
                })
            }
        }
    }
}

/// Encode ascending, disjoint ranges as a GLOBSET, end command included.
pub fn encode(ranges: &[CounterRange], out: &mut Vec<u8>) {
    for range in ranges {
        let low = counter_bytes(range.low);
        if range.low == range.high {
            out.push(COUNTER_LEN as u8);
            out.extend_from_slice(&low);
            continue;
        }
        let high = counter_bytes(range.high);
        let common = low.iter().zip(&high).take_while(|(a, b)| a == b).count();
        if common > 0 {
            out.push(common as u8);
            out.extend_from_slice(&low[..common]);
        }
        out.push(CMD_RANGE);
        out.extend_from_slice(&low[common..]);
        out.extend_from_slice(&high[common..]);
        if common > 0 {
            out.push(CMD_POP);
        }
    }
    out.push(CMD_END);
}

fn counter_bytes(value: u64) -> [u8; COUNTER_LEN] {
    let be = value.to_be_bytes();
    let mut out = [0u8; COUNTER_LEN];
    out.copy_from_slice(&be[2..]);
    out
}
