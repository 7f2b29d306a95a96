//! Payload hashing and normalization
//!
//! Derives the keys the scan cache uses to recognize content it has already
//! inspected, even when copies differ in delivery-specific ways.

pub mod hasher;
pub mod mime;
pub mod normalize;

pub use hasher::{attachment_hash, full_hash, template_hash, ContentHashes};
