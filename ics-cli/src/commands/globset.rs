//! Decode change sets.

use anyhow::{bail, Context, Result};
use ics_core::changeset::globset;
use ics_core::{ChangeSet, CounterRange};

/// Run the globset command.
pub fn run(hex_input: &str, raw: bool) -> Result<()> {
    let bytes = parse_hex(hex_input)?;

    if raw {
        let ranges = decode_raw(&bytes)?;
        println!("GLOBSET ({} bytes, {} ranges)", bytes.len(), ranges.len());
        for range in &ranges {
            println!("  {}", format_range(range));
        }
        return Ok(());
    }

    let set = ChangeSet::parse(&bytes).context("Invalid change set")?;
    println!(
        "Change set ({} bytes, {} replicas, {} counters)",
        bytes.len(),
        set.replicas().count(),
        set.count()
    );
    for guid in set.replicas() {
        println!("  {}", guid);
        for range in set.ranges(guid) {
            println!("    {}", format_range(range));
        }
    }
    Ok(())
}

/// Decode hex, tolerating whitespace between byte pairs.
pub fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let compact: String = input.split_whitespace().collect();
    hex::decode(&compact).context("Input is not valid hex")
}

/// Decode a bare GLOBSET that must span the whole input.
pub fn decode_raw(bytes: &[u8]) -> Result<Vec<CounterRange>> {
    let (ranges, end) = globset::decode(bytes, 0).context("Invalid GLOBSET")?;
    if end != bytes.len() {
        bail!("{} trailing bytes after GLOBSET end", bytes.len() - end);
    }
    Ok(ranges)
}

fn format_range(range: &CounterRange) -> String {
    if range.low == range.high {
        format!("{:#x}", range.low)
    } else {
        format!("{:#x}-{:#x} ({} values)", range.low, range.high, range.len())
    }
}
