//! Core types, traits, and algorithms shared by every RouchDB crate.
//!
//! This crate has no knowledge of any particular storage backend or
//! transport. It defines the document/revision data model, the revision
//! tree merge algorithm, the `Adapter` trait backends implement, and the
//! write-notification primitive used to build live change feeds.

pub mod adapter;
pub mod document;
pub mod error;
pub mod notify;
pub mod rev_tree;

pub use adapter::Adapter;
pub use document::{Document, Revision};
pub use error::{Result, RouchError};
