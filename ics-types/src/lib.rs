//! # ics-types
//!
//! Wire format types for MAPI Incremental Change Synchronization (ICS)
//! and the FastTransfer stream.
//!
//! This crate provides the foundational types used across all ics crates:
//! - [`ReplicaGuid`], [`ReplicaId`], [`GlobalCounter`] - Replica namespaces and counters
//! - [`ObjectId`], [`ChangeNumber`], [`SourceKey`], [`Xid`] - Object identity and versions
//! - [`PropTag`], [`PropValue`], [`TaggedValue`] - Typed MAPI properties
//! - [`Marker`], [`StateProperty`] - FastTransfer structural markers and state meta-tags
//! - [`ErrorCode`], [`WireError`] - Status codes and error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod markers;
mod props;

pub use error::{ErrorCode, WireError};
pub use ids::{
    ChangeNumber, GlobalCounter, ObjectId, PredecessorChangeList, ReplicaGuid, ReplicaId,
    SourceKey, Xid,
};
pub use markers::{meta, Marker, StateProperty};
pub use props::{tags, FileTime, NameKind, NamedProperty, PropTag, PropType, PropValue, TaggedValue};
