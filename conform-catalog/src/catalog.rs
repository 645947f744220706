use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Resource;

/// An error while decoding a catalog byte stream.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The binary stream is not a valid catalog.
    #[error("malformed binary catalog: {0}")]
    Bincode(#[from] bincode::Error),
    /// The JSON document is not a valid catalog.
    #[error("malformed JSON catalog: {0}")]
    Json(#[from] serde_json::Error),
}

/// The encodings a catalog can be read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogFormat {
    /// The binary wire format emitted by the authoring front end.
    Bincode,
    /// A JSON rendition of the same data model, for debugging.
    Json,
}

/// An ordered sequence of [`Resource`]s describing the desired state of a
/// host.
///
/// The order of the sequence is not semantically significant; only the
/// dependency edges between resources are.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    /// The resources of this catalog.
    pub resources: Vec<Resource>,
}

impl Catalog {
    /// Make a catalog from a list of resources.
    pub fn new(resources: Vec<Resource>) -> Catalog {
        Catalog { resources }
    }

    /// Decode a catalog from a reader in the specified format.
    pub fn from_reader<R: Read>(reader: R, format: CatalogFormat) -> Result<Catalog, DecodeError> {
        match format {
            CatalogFormat::Bincode => Ok(bincode::deserialize_from(reader)?),
            CatalogFormat::Json => Ok(serde_json::from_reader(reader)?),
        }
    }

    /// Encode this catalog in the binary wire format.
    pub fn to_writer<W: Write>(&self, writer: W) -> Result<(), DecodeError> {
        Ok(bincode::serialize_into(writer, self)?)
    }

    /// Number of resources in the catalog.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// True when the catalog declares nothing.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Iterate over the resources in catalog order.
    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter()
    }
}
