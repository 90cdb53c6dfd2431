mod cache_entry;
mod store;

pub use cache_entry::{file_name_from_url, AssetIdentity, AssetRequest, CacheEntry, Completeness};
pub use store::{prioritize_sources, AssetStore};
