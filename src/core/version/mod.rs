mod component;
mod index;
mod ordering;

pub use component::Component;
pub use index::{HttpPublicationSource, IndexSnapshot, PublicationSource, VersionIndexClient};
pub use ordering::{compare_versions, is_prerelease, versions_equal};

#[cfg(test)]
pub(crate) use index::testing;
