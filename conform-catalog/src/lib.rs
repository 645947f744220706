//! Data model of a configuration catalog.
//!
//! A catalog is an ordered sequence of [`Resource`]s, each describing a piece
//! of desired host state: a file, a directory, a symlink, a command to run or
//! a no-op. Resources reference each other through numeric ids forming a
//! dependency graph; the order of the sequence itself carries no meaning.
//!
//! Catalogs are produced by an authoring front end which is not part of this
//! workspace: from the point of view of these crates a catalog is an opaque
//! byte stream that this crate knows how to decode. The wire format is
//! [`bincode`], with a JSON rendition available for debugging and tests.

mod catalog;
mod resource;

pub use catalog::{Catalog, CatalogFormat, DecodeError};
pub use resource::{
    Command, ExecResource, FileResource, FileState, Ownership, Resource, ResourceBody, ResourceId,
    RunCondition,
};
