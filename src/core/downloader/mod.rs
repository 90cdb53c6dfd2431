mod checksum;
mod client;

pub use checksum::{Checksum, HashAlgorithm};
pub use client::{DownloadOutcome, Downloader, HttpTransport, Transport};

#[cfg(test)]
pub(crate) use client::testing;
