//! # ics-core
//!
//! Pure logic for MAPI incremental change synchronization (no I/O, instant tests).
//!
//! This crate implements the codecs and algorithms of the sync engine
//! without touching a store, enabling fast unit tests:
//! - [`changeset`] - IDSET/CNSET values and the GLOBSET wire codec
//! - [`fasttransfer`] - FastTransfer stream encoder and decoder
//! - [`chunk`] - cut-mark aware chunked delivery of encoded streams
//!
//! The store-facing parts (export generators, import pipeline, sessions)
//! live in `ics-server`, which drives these building blocks.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod changeset;
pub mod chunk;
pub mod fasttransfer;

pub use changeset::{ChangeSet, ChangeSetError, CounterRange, RawChangeSet, ReplicaMap};
pub use chunk::{Chunk, ChunkCursor, CutMark, Producer, TransferBuffer, TransferStatus};
pub use fasttransfer::{decode, DecodeError, Decoder, Element, EncodeError, Encoder};
