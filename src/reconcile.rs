//! End-to-end crawl pass.
//!
//! Iterates the remote listing, decides per archive whether any work is
//! needed, downloads and processes the ones that do, and keeps the archive
//! rows reconciled with what the server reports. One pass is idempotent: an
//! unchanged listing produces zero downloads and zero writes.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::filter::Filters;
use crate::processor::{FolderOutcome, FolderProcessor};
use crate::shutdown::ShutdownFlag;
use crate::store::{Classification, StatusStore, StoreError};
use crate::transport::{RemoteArchive, Transport};
use crate::util::archive_date;

/// Counters reported at the end of a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Archives actually downloaded and handled
    pub processed: usize,
    /// Download failures, store failures and archives with failed members
    pub errors: usize,
}

/// Settings for one pass.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub law_number: String,
    pub folder: String,
    pub download_dir: PathBuf,
    /// Stop after this many archives were actually processed (0 = no limit)
    pub limit_archives: usize,
}

/// Archive-row bookkeeping deferred until the archive completes a full pass,
/// so an interrupted or failing pass leaves it classified for retry.
enum Pending {
    Nothing,
    UpdateSize(u64),
    Touch,
}

/// What happened to a single listed archive.
enum Handled {
    /// Already fully parsed, or filtered out
    Skipped,
    DownloadFailed,
    Processed { failed: bool },
    Interrupted,
}

pub struct Reconciler<T: Transport> {
    transport: T,
    store: StatusStore,
    processor: FolderProcessor,
    filters: Filters,
    shutdown: ShutdownFlag,
    options: RunOptions,
}

impl<T: Transport> Reconciler<T> {
    pub fn new(
        transport: T,
        store: StatusStore,
        filters: Filters,
        shutdown: ShutdownFlag,
        options: RunOptions,
    ) -> Self {
        Self {
            transport,
            store,
            processor: FolderProcessor::new(shutdown.clone()),
            filters,
            shutdown,
            options,
        }
    }

    /// Run one pass over the remote listing.
    ///
    /// Store failures while handling a single archive are counted and the
    /// loop moves on; only counters for fully-committed work are reported.
    pub fn run(&mut self) -> RunStats {
        let mut stats = RunStats::default();

        loop {
            if self.shutdown.is_set() {
                info!("shutdown requested, stop the listing");
                break;
            }

            let remote = match self.transport.next_archive() {
                Ok(Some(remote)) => remote,
                Ok(None) => break,
                Err(e) => {
                    warn!("remote listing failed: {}", e);
                    stats.errors += 1;
                    break;
                }
            };

            if self.skipped_by_filters(&remote) {
                continue;
            }

            match self.handle_archive(&remote) {
                Ok(Handled::Skipped) | Ok(Handled::Interrupted) => {}
                Ok(Handled::DownloadFailed) => stats.errors += 1,
                Ok(Handled::Processed { failed }) => {
                    stats.processed += 1;
                    if failed {
                        stats.errors += 1;
                    }
                    if self.options.limit_archives > 0
                        && stats.processed >= self.options.limit_archives
                    {
                        info!("limit of {} archives reached", self.options.limit_archives);
                        break;
                    }
                }
                Err(e) => {
                    warn!("store failure while handling {}: {}", remote.name, e);
                    stats.errors += 1;
                }
            }
        }

        info!(
            "pass finished: {} archives processed, {} errors",
            stats.processed, stats.errors
        );
        stats
    }

    fn skipped_by_filters(&mut self, remote: &RemoteArchive) -> bool {
        if self.filters.skip_region(&remote.region) {
            debug!("region {} is filtered out", remote.region);
            if self.filters.is_positive_region_match() {
                self.transport.skip_region(&remote.region);
            }
            return true;
        }
        if let Some(date) = archive_date(&remote.name) {
            if self.filters.skip_date(date) {
                debug!("archive {} is filtered out by date", remote.name);
                return true;
            }
        }
        false
    }

    fn handle_archive(&mut self, remote: &RemoteArchive) -> Result<Handled, StoreError> {
        let mut pending = Pending::Nothing;
        let mut archive_id = None;

        match self.store.classify_archive(&remote.name, remote.size)? {
            Classification::Exists => {
                debug!("archive {} was parsed earlier, skip it", remote.name);
                return Ok(Handled::Skipped);
            }
            Classification::DoesNotExist => {}
            Classification::ExistsSizeDiffers => {
                let row = self
                    .store
                    .get_archive(&remote.name)?
                    .ok_or_else(|| StoreError::MissingRow(remote.name.clone()))?;
                info!(
                    "archive {} changed size ({} -> {}), purge its members and re-ingest",
                    remote.name, row.size, remote.size
                );
                self.store.delete_files_of_archive(row.id)?;
                pending = Pending::UpdateSize(remote.size);
                archive_id = Some(row.id);
            }
            Classification::ExistsNotParsed => {
                let row = self
                    .store
                    .get_archive(&remote.name)?
                    .ok_or_else(|| StoreError::MissingRow(remote.name.clone()))?;
                info!(
                    "archive {} was downloaded earlier but never fully parsed, retry it",
                    remote.name
                );
                pending = Pending::Touch;
                archive_id = Some(row.id);
            }
        }

        let local_path = self.options.download_dir.join(&remote.name);
        info!("download {} ({} bytes)", remote.path, remote.size);
        if let Err(e) = self.transport.download(&remote.path, &local_path) {
            warn!("download of {} failed, try again next run: {}", remote.name, e);
            let _ = std::fs::remove_file(&local_path);
            return Ok(Handled::DownloadFailed);
        }

        // Created only after a successful download, so failed downloads never
        // leave ghost rows.
        let archive_id = match archive_id {
            Some(id) => id,
            None => self.store.add_archive(
                &remote.name,
                remote.size,
                &self.options.law_number,
                &self.options.folder,
            )?,
        };

        let outcome = self
            .processor
            .process(&mut self.store, &local_path, archive_id);
        let _ = std::fs::remove_file(&local_path);
        let outcome = outcome?;

        match outcome {
            FolderOutcome::Interrupted => Ok(Handled::Interrupted),
            FolderOutcome::Parsed => {
                match pending {
                    Pending::UpdateSize(size) => self.store.update_archive_size(archive_id, size)?,
                    Pending::Touch => self.store.touch_archive(archive_id)?,
                    Pending::Nothing => {}
                }
                Ok(Handled::Processed { failed: false })
            }
            FolderOutcome::Empty => Ok(Handled::Processed { failed: false }),
            FolderOutcome::HasFailures => Ok(Handled::Processed { failed: true }),
        }
    }

    /// Hand back the store, e.g. to inspect state after a pass.
    pub fn into_store(self) -> StatusStore {
        self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use std::collections::HashMap;
    use std::io::{Cursor, Write};
    use std::path::Path;

    const GOOD_XML: &[u8] = b"<export><notice><id>1</id></notice></export>";
    const BAD_XML: &[u8] = b"<export><notice><id>1</id></export>";

    fn zip_bytes(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut zw = zip::ZipWriter::new(&mut cursor);
            let opts = zip::write::FileOptions::default()
                .compression_method(zip::CompressionMethod::Stored);
            for (name, bytes) in members {
                zw.start_file(*name, opts).unwrap();
                zw.write_all(bytes).unwrap();
            }
            zw.finish().unwrap();
        }
        cursor.into_inner()
    }

    /// In-memory transport: a fixed listing plus per-path payloads.
    struct FakeTransport {
        listing: Vec<RemoteArchive>,
        payloads: HashMap<String, Vec<u8>>,
        fail_downloads: Vec<String>,
        cursor: usize,
        downloads: usize,
        skipped_regions: Vec<String>,
    }

    impl FakeTransport {
        fn new() -> Self {
            Self {
                listing: Vec::new(),
                payloads: HashMap::new(),
                fail_downloads: Vec::new(),
                cursor: 0,
                downloads: 0,
                skipped_regions: Vec::new(),
            }
        }

        fn with_archive(mut self, name: &str, region: &str, payload: Vec<u8>) -> Self {
            let path = format!("/fcs_regions/{region}/notifications/{name}");
            self.listing.push(RemoteArchive {
                name: name.to_string(),
                size: payload.len() as u64,
                region: region.to_string(),
                path: path.clone(),
            });
            self.payloads.insert(path, payload);
            self
        }

        fn with_failing_download(mut self, name: &str, region: &str, size: u64) -> Self {
            let path = format!("/fcs_regions/{region}/notifications/{name}");
            self.listing.push(RemoteArchive {
                name: name.to_string(),
                size,
                region: region.to_string(),
                path: path.clone(),
            });
            self.fail_downloads.push(path);
            self
        }
    }

    impl Transport for FakeTransport {
        fn next_archive(&mut self) -> Result<Option<RemoteArchive>, TransportError> {
            let next = self.listing.get(self.cursor).cloned();
            self.cursor += 1;
            Ok(next)
        }

        fn download(&mut self, remote_path: &str, local_path: &Path) -> Result<(), TransportError> {
            if self.fail_downloads.iter().any(|p| p == remote_path) {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connection timed out",
                )));
            }
            self.downloads += 1;
            std::fs::write(local_path, &self.payloads[remote_path])?;
            Ok(())
        }

        fn skip_region(&mut self, region: &str) {
            self.skipped_regions.push(region.to_string());
        }
    }

    fn reconciler(
        transport: FakeTransport,
        filters: Filters,
        limit: usize,
        download_dir: &Path,
    ) -> Reconciler<FakeTransport> {
        let options = RunOptions {
            law_number: "44".to_string(),
            folder: "notifications".to_string(),
            download_dir: download_dir.to_path_buf(),
            limit_archives: limit,
        };
        Reconciler::new(
            transport,
            StatusStore::open_in_memory().unwrap(),
            filters,
            ShutdownFlag::new(),
            options,
        )
    }

    #[test]
    fn first_pass_ingests_everything() {
        let transport = FakeTransport::new()
            .with_archive("a_2019010100_001.zip", "Adygeja_Resp", zip_bytes(&[("n1.xml", GOOD_XML)]))
            .with_archive("b_2019010200_001.zip", "Altaj_Resp", zip_bytes(&[("n2.xml", GOOD_XML)]));
        let dir = tempfile::tempdir().unwrap();
        let mut rec = reconciler(transport, Filters::none(), 0, dir.path());

        let stats = rec.run();
        assert_eq!(stats, RunStats { processed: 2, errors: 0 });

        let store = rec.into_store();
        let s = store.stats().unwrap();
        assert_eq!(s.archives_parsed, 2);
        assert_eq!(s.records, 2);
    }

    #[test]
    fn second_pass_is_idempotent() {
        let payload = zip_bytes(&[("n1.xml", GOOD_XML)]);
        let transport = FakeTransport::new().with_archive("a_2019010100_001.zip", "R", payload.clone());
        let dir = tempfile::tempdir().unwrap();
        let mut rec = reconciler(transport, Filters::none(), 0, dir.path());
        rec.run();

        // Same listing again, fresh transport cursor.
        rec.transport.cursor = 0;
        rec.transport.downloads = 0;
        let stats = rec.run();

        assert_eq!(stats, RunStats { processed: 0, errors: 0 });
        assert_eq!(rec.transport.downloads, 0);
    }

    #[test]
    fn size_change_purges_and_reingests() {
        let small = zip_bytes(&[("n1.xml", GOOD_XML)]);
        let transport = FakeTransport::new().with_archive("a_2019010100_001.zip", "R", small);
        let dir = tempfile::tempdir().unwrap();
        let mut rec = reconciler(transport, Filters::none(), 0, dir.path());
        rec.run();

        // The remote now reports the same name with different content/size.
        let big = zip_bytes(&[("n1.xml", GOOD_XML), ("n2.xml", GOOD_XML)]);
        let big_size = big.len() as u64;
        rec.transport = FakeTransport::new().with_archive("a_2019010100_001.zip", "R", big);
        let stats = rec.run();
        assert_eq!(stats, RunStats { processed: 1, errors: 0 });

        let store = rec.into_store();
        let row = store.get_archive("a_2019010100_001.zip").unwrap().unwrap();
        assert_eq!(row.size, big_size);
        assert!(row.has_parsed);
        let s = store.stats().unwrap();
        assert_eq!(s.archives, 1);
        assert_eq!(s.files, 2);
        assert_eq!(s.records, 2);
    }

    #[test]
    fn failed_download_is_counted_and_leaves_no_row() {
        let transport = FakeTransport::new()
            .with_failing_download("a_2019010100_001.zip", "R", 1000)
            .with_archive("b_2019010200_001.zip", "R", zip_bytes(&[("n1.xml", GOOD_XML)]));
        let dir = tempfile::tempdir().unwrap();
        let mut rec = reconciler(transport, Filters::none(), 0, dir.path());

        let stats = rec.run();
        assert_eq!(stats, RunStats { processed: 1, errors: 1 });

        let store = rec.into_store();
        assert!(store.get_archive("a_2019010100_001.zip").unwrap().is_none());
        assert!(store.get_archive("b_2019010200_001.zip").unwrap().is_some());
    }

    #[test]
    fn archive_with_bad_member_counts_as_error_and_resumes() {
        let payload = zip_bytes(&[("bad.xml", BAD_XML), ("good.xml", GOOD_XML)]);
        let transport = FakeTransport::new().with_archive("a_2019010100_001.zip", "R", payload.clone());
        let dir = tempfile::tempdir().unwrap();
        let mut rec = reconciler(transport, Filters::none(), 0, dir.path());

        let stats = rec.run();
        assert_eq!(stats, RunStats { processed: 1, errors: 1 });
        {
            let row = rec.store.get_archive("a_2019010100_001.zip").unwrap().unwrap();
            assert!(!row.has_parsed);
        }

        // Next pass: the archive classifies as not parsed, gets re-downloaded,
        // the good member is skipped and only the bad one is retried.
        rec.transport = FakeTransport::new().with_archive("a_2019010100_001.zip", "R", payload);
        let stats = rec.run();
        assert_eq!(stats, RunStats { processed: 1, errors: 1 });
        assert_eq!(rec.transport.downloads, 1);
        let s = rec.store.stats().unwrap();
        assert_eq!(s.records, 1);
    }

    #[test]
    fn limit_counts_only_processed_archives() {
        let transport = FakeTransport::new()
            .with_archive("a_2019010100_001.zip", "R", zip_bytes(&[("n1.xml", GOOD_XML)]))
            .with_archive("b_2019010200_001.zip", "R", zip_bytes(&[("n2.xml", GOOD_XML)]))
            .with_archive("c_2019010300_001.zip", "R", zip_bytes(&[("n3.xml", GOOD_XML)]));
        let dir = tempfile::tempdir().unwrap();
        let mut rec = reconciler(transport, Filters::none(), 2, dir.path());

        let stats = rec.run();
        assert_eq!(stats.processed, 2);
        assert_eq!(rec.store.stats().unwrap().archives, 2);

        // Already-parsed archives do not count against the limit: a rerun
        // with limit 2 still reaches the third archive.
        rec.transport.cursor = 0;
        let stats = rec.run();
        assert_eq!(stats.processed, 1);
        assert_eq!(rec.store.stats().unwrap().archives, 3);
    }

    #[test]
    fn region_filter_skips_and_hints_transport() {
        let transport = FakeTransport::new()
            .with_archive("a_2019010100_001.zip", "Moscow", zip_bytes(&[("n1.xml", GOOD_XML)]))
            .with_archive("b_2019010200_001.zip", "Adygeja_Resp", zip_bytes(&[("n2.xml", GOOD_XML)]));
        let filters =
            Filters::parse(r#"{"field": "region", "match": "==", "value": "Adygeja_Resp"}"#)
                .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut rec = reconciler(transport, filters, 0, dir.path());

        let stats = rec.run();
        assert_eq!(stats.processed, 1);
        assert_eq!(rec.transport.skipped_regions, vec!["Moscow".to_string()]);
        assert!(rec.store.get_archive("a_2019010100_001.zip").unwrap().is_none());
    }

    #[test]
    fn date_filter_skips_archives_by_name() {
        let transport = FakeTransport::new()
            .with_archive("a_2018123100_001.zip", "R", zip_bytes(&[("n1.xml", GOOD_XML)]))
            .with_archive("b_2019010200_001.zip", "R", zip_bytes(&[("n2.xml", GOOD_XML)]));
        let filters =
            Filters::parse(r#"{"field": "date", "match": ">=", "value": "2019-01-01"}"#).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut rec = reconciler(transport, filters, 0, dir.path());

        let stats = rec.run();
        assert_eq!(stats.processed, 1);
        assert!(rec.store.get_archive("a_2018123100_001.zip").unwrap().is_none());
        assert!(rec.store.get_archive("b_2019010200_001.zip").unwrap().is_some());
    }

    #[test]
    fn preset_shutdown_processes_nothing() {
        let transport = FakeTransport::new()
            .with_archive("a_2019010100_001.zip", "R", zip_bytes(&[("n1.xml", GOOD_XML)]));
        let dir = tempfile::tempdir().unwrap();
        let shutdown = ShutdownFlag::new();
        shutdown.set();
        let mut rec = Reconciler::new(
            transport,
            StatusStore::open_in_memory().unwrap(),
            Filters::none(),
            shutdown,
            RunOptions {
                law_number: "44".to_string(),
                folder: "notifications".to_string(),
                download_dir: dir.path().to_path_buf(),
                limit_archives: 0,
            },
        );

        let stats = rec.run();
        assert_eq!(stats, RunStats::default());
        assert_eq!(rec.transport.downloads, 0);
    }
}
