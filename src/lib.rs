//! Paged, resumable engine for pairwise variant-to-variant statistics
//! (correlation, r², covariance) over genomic segments, plus a score
//! aggregator and group-level score-and-covariance bundles for downstream
//! rare-variant aggregation tests.
//!
//! The core is a Morton/Z-order tiling of the pairwise variant space
//! ([`morton`]) into fixed-width [`segment::Segment`]s and their pairwise
//! [`cell::Cell`] matrices, driven by [`engine::Engine`] and cached through
//! [`cache::Cache`]. Results stream out through [`paging`]'s bounded,
//! cursor-resumable pages. Genotype file reading, phenotype loading, mask
//! parsing and HTTP/CLI front-ends are external collaborators — only their
//! contracts live in this crate ([`segment::GenotypeSource`]).

pub mod cache;
pub mod cell;
pub mod common;
pub mod engine;
pub mod error;
pub mod group;
pub mod morton;
pub mod paging;
pub mod score;
pub mod segment;

pub use common::{OutputMode, StatKind, StorageMode, VariantId};
pub use engine::{CancelFlag, Engine};
pub use error::{Error, ErrorKind, Result};
