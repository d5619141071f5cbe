//! Remote listing and download abstraction.
//!
//! The crawl loop pulls archive descriptors one at a time, downloads the ones
//! that need work and may advise the transport to abandon the rest of a
//! region's subtree. Implementations own all protocol detail.

pub mod ftp;

pub use ftp::FtpTransport;

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("ftp error: {0}")]
    Ftp(#[from] suppaftp::FtpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One remote ZIP archive discovered during traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteArchive {
    /// File name, e.g. `notification_Adygeja_Resp_2019013100_001.zip`
    pub name: String,
    /// Size reported by the server listing
    pub size: u64,
    /// Region directory the archive was found under
    pub region: String,
    /// Full remote path for downloading
    pub path: String,
}

/// Pull-based remote traversal, finite per run.
pub trait Transport {
    /// The next archive descriptor, or `None` at the end of the listing.
    fn next_archive(&mut self) -> Result<Option<RemoteArchive>, TransportError>;

    /// Download `remote_path` into `local_path`.
    fn download(&mut self, remote_path: &str, local_path: &Path) -> Result<(), TransportError>;

    /// Advisory hint: anything still queued under `region` is not needed.
    fn skip_region(&mut self, region: &str);
}
