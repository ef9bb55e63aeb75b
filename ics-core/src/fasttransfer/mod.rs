//! FastTransfer stream encoding and decoding.
//!
//! A FastTransfer stream is a flat sequence of elements: markers (bare
//! tags), properties (tag, optional name info, value) and meta-properties.
//! All integers are little-endian.

mod decoder;
mod encoder;

pub use decoder::{decode, DecodeError, Decoder, Element};
pub use encoder::{EncodeError, Encoder};
