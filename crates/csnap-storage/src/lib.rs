//! Persistence seams for csnap: keyed document views, immutable artifacts and
//! the upstream HTTP fetcher.

mod artifact;
mod document;
mod http;
mod postgres;

pub use artifact::{ArtifactStore, StoredArtifact};
pub use document::{Document, DocumentStore, MemoryStore, RangeQuery, StoreError};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, HttpClientConfig,
    FetchedJson, HttpFetcher, RetryDisposition,
};
pub use postgres::PgDocumentStore;
pub use reqwest::Url;

pub const CRATE_NAME: &str = "csnap-storage";
