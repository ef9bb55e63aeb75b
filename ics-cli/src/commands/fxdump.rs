//! Decode FastTransfer streams.

use anyhow::{Context, Result};
use ics_core::{decode, Element};
use ics_types::Marker;
use std::path::Path;

use super::globset::parse_hex;

/// Read the stream from a file, or treat the argument as hex.
pub fn read_input(input: &str) -> Result<Vec<u8>> {
    let path = Path::new(input);
    if path.is_file() {
        return std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()));
    }
    parse_hex(input)
}

/// Run the fxdump command.
pub fn run(bytes: &[u8], json: bool) -> Result<()> {
    let elements = decode(bytes).context("Invalid FastTransfer stream")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&elements)?);
        return Ok(());
    }

    println!("{} bytes, {} elements", bytes.len(), elements.len());
    for line in render(&elements) {
        println!("{}", line);
    }
    Ok(())
}

/// One line per element, indented by marker nesting.
pub fn render(elements: &[Element]) -> Vec<String> {
    let mut depth = 0usize;
    let mut lines = Vec::with_capacity(elements.len());
    for element in elements {
        let text = match element {
            Element::Marker(marker) => {
                if closes(*marker) {
                    depth = depth.saturating_sub(1);
                }
                let line = format!("{}{}", indent(depth), marker);
                if opens(*marker) {
                    depth += 1;
                }
                lines.push(line);
                continue;
            }
            Element::Property { tag, named, value } => match named {
                Some(named) => format!("{} [{:?}] = {:?}", tag, named, value),
                None => format!("{} = {:?}", tag, value),
            },
            Element::Meta { tag, value } => format!("{} = 0x{:08X}", tag, value),
            Element::State { tag, data } => {
                format!("{} ({} bytes) {}", tag, data.len(), hex::encode(data))
            }
        };
        lines.push(format!("{}{}", indent(depth), text));
    }
    lines
}

fn indent(depth: usize) -> String {
    "  ".repeat(depth)
}

fn opens(marker: Marker) -> bool {
    matches!(
        marker,
        Marker::StartTopFld
            | Marker::StartSubFld
            | Marker::StartMessage
            | Marker::StartFaiMsg
            | Marker::StartEmbed
            | Marker::StartRecip
            | Marker::NewAttach
    )
}

fn closes(marker: Marker) -> bool {
    matches!(
        marker,
        Marker::EndFolder
            | Marker::EndMessage
            | Marker::EndEmbed
            | Marker::EndToRecip
            | Marker::EndAttach
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ics_core::Encoder;
    use ics_types::{tags, PropValue};

    fn sample() -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.push_marker(Marker::StartMessage);
        encoder
            .push_property(tags::SUBJECT, &PropValue::Unicode("hi".into()))
            .unwrap();
        encoder.push_marker(Marker::EndMessage);
        encoder.into_buffer().bytes().to_vec()
    }

    #[test]
    fn render_indents_message_body() {
        let elements = decode(&sample()).unwrap();
        let lines = render(&elements);
        assert_eq!(lines.len(), 3);
        assert!(!lines[0].starts_with(' '));
        assert!(lines[1].starts_with("  "));
        assert!(!lines[2].starts_with(' '));
    }

    #[test]
    fn input_may_be_a_file_or_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.bin");
        std::fs::write(&path, sample()).unwrap();

        let from_file = read_input(path.to_str().unwrap()).unwrap();
        let from_hex = read_input(&hex::encode(sample())).unwrap();
        assert_eq!(from_file, from_hex);
    }

    #[test]
    fn truncated_stream_fails() {
        let mut bytes = sample();
        bytes.truncate(bytes.len() - 2);
        assert!(run(&bytes, false).is_err());
    }
}
