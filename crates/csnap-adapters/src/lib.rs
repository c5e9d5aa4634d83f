//! Catalog source contracts, dual-schema validation and model variant
//! consolidation.

mod consolidate;
pub mod schemas;
mod source;
mod validate;

pub use consolidate::consolidate_variants;
pub use source::{CatalogSource, FixtureCatalogSource, HttpCatalogSource, RawPayload, SourceError};
pub use validate::{
    conforms_strict, records_at, validate_record, validate_records, RecordSchema, Validated,
};

pub const CRATE_NAME: &str = "csnap-adapters";
