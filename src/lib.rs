//! fcsload: incremental loader for government procurement archives.
//!
//! Walks a region-organized FTP tree, downloads ZIP archives of procurement
//! XML notices, parses every member into a JSON record and tracks ingest
//! state per archive and per member, so repeated runs only do new work:
//! - unchanged archives are skipped without downloading,
//! - archives whose remote size changed are purged and re-ingested,
//! - partially parsed archives retry only their unparsed members.

pub mod archive;
pub mod config;
pub mod filter;
pub mod processor;
pub mod reconcile;
pub mod record;
pub mod shutdown;
pub mod store;
pub mod transport;
pub mod util;

pub use config::Config;
pub use reconcile::{Reconciler, RunOptions, RunStats};
