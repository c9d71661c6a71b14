//! # ociregistry
//!
//! Core model for OCI distribution registries.
//!
//! This crate defines the pieces shared by every registry implementation in
//! the workspace:
//!
//! - the error taxonomy and its JSON wire form ([`Error`], [`WireErrors`])
//! - content addressing ([`Digest`], [`Descriptor`])
//! - manifest and index JSON shapes ([`Manifest`], [`Index`])
//! - repository name and tag validation ([`refname`])
//! - the [`Registry`] capability trait with streaming reads, chunked
//!   uploads and lazy listings
//!
//! Implementations live in sibling crates: `ocimem` (in-memory engine),
//! `ociserver` (HTTP front end), `ociclient` (HTTP client) and `ocifilter`
//! (wrappers over other implementations).

mod digest;
mod error;
mod interface;
pub mod refname;
mod types;

pub use self::digest::{Digest, Digester, Verifier};
pub use self::error::{BoxError, Error, ErrorCode, Result, WireError, WireErrors};
pub use self::interface::{
    collect, error_listing, listing_from, BlobReader, BlobWriter, Listing, ReferrersRequest,
    Registry, TagsRequest,
};
pub use self::types::{mediatype, Descriptor, Index, Manifest};
