//! Per-archive processing.
//!
//! Streams one downloaded ZIP, decides per member whether to skip, register
//! or re-ingest it, and commits every member outcome through the store. A
//! member that fails to parse never blocks its siblings; it simply stays
//! unparsed and is retried on the next run.

use std::path::Path;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::archive::ArchiveReader;
use crate::record::parse_record;
use crate::shutdown::ShutdownFlag;
use crate::store::{Classification, StatusStore, StoreError};

/// Signature elements are structurally present in every notice but carry no
/// business data.
const SKIP_TAGS: &[&str] = &["cryptoSigns", "signature"];

const REASON_OK: &str = "OK";
const REASON_NOT_PARSED: &str = "file was downloaded earlier but not parsed yet";
const REASON_SIZE_DIFFERS: &str = "file was parsed earlier but its size has changed";
const REASON_NO_DATA: &str = "no recognized data in file";
pub const REASON_FAILED_FILES: &str = "one or more files of the archive were not parsed";
pub const REASON_EMPTY_ARCHIVE: &str = "archive is empty";

/// Terminal outcome of one archive pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderOutcome {
    /// Every member parsed or was already parsed; the archive is flagged
    /// fully parsed.
    Parsed,
    /// No XML members at all; the archive is annotated but left unparsed.
    Empty,
    /// At least one member failed (or the container is unreadable); the
    /// archive is annotated but left unparsed so the next run retries only
    /// what is missing.
    HasFailures,
    /// Cancellation observed; the archive is left untouched for the next
    /// run, already-committed members stand.
    Interrupted,
}

pub struct FolderProcessor {
    skip_tags: &'static [&'static str],
    shutdown: ShutdownFlag,
}

impl FolderProcessor {
    pub fn new(shutdown: ShutdownFlag) -> Self {
        Self {
            skip_tags: SKIP_TAGS,
            shutdown,
        }
    }

    /// Process the downloaded archive at `path`, identified in the store by
    /// `archive_id`. Deleting the local file afterwards is the caller's job.
    pub fn process(
        &self,
        store: &mut StatusStore,
        path: &Path,
        archive_id: i64,
    ) -> Result<FolderOutcome, StoreError> {
        let mut reader = match ArchiveReader::open(path) {
            Ok(reader) => reader,
            Err(e) => {
                warn!("archive {} is unreadable: {}", path.display(), e);
                store.set_archive_reason(archive_id, &format!("unreadable archive: {e}"))?;
                return Ok(FolderOutcome::HasFailures);
            }
        };

        let mut has_failures = false;
        let mut xml_members = 0usize;

        for index in 0..reader.len() {
            if self.shutdown.is_set() {
                info!("gracefully stop reading archive: shutdown requested");
                return Ok(FolderOutcome::Interrupted);
            }

            let entry = match reader.entry_info(index) {
                Ok(entry) => entry,
                Err(e) => {
                    error!("cannot read entry {} of archive {}: {}", index, archive_id, e);
                    has_failures = true;
                    continue;
                }
            };
            if !entry.is_xml {
                continue;
            }
            xml_members += 1;

            let (file_id, reason) =
                match store.classify_file(archive_id, &entry.name, entry.size)? {
                    Classification::Exists => {
                        debug!("member {} was parsed earlier, skip it", entry.name);
                        continue;
                    }
                    Classification::DoesNotExist => (
                        store.add_file(archive_id, &entry.name, entry.size)?,
                        REASON_OK,
                    ),
                    Classification::ExistsSizeDiffers => {
                        let row = store
                            .get_file(archive_id, &entry.name)?
                            .ok_or_else(|| StoreError::MissingRow(entry.name.clone()))?;
                        store.delete_records_of_file(row.id)?;
                        store.update_file_size(row.id, entry.size)?;
                        (row.id, REASON_SIZE_DIFFERS)
                    }
                    Classification::ExistsNotParsed => {
                        let row = store
                            .get_file(archive_id, &entry.name)?
                            .ok_or_else(|| StoreError::MissingRow(entry.name.clone()))?;
                        (row.id, REASON_NOT_PARSED)
                    }
                };

            let bytes = match reader.read_entry(index) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("cannot read member {}: {}", entry.name, e);
                    has_failures = true;
                    continue;
                }
            };

            info!("parse xml member {}", entry.name);
            match parse_record(&bytes, self.skip_tags) {
                Ok(record) if record.is_empty() => {
                    warn!("member {} has no recognized data", entry.name);
                    store.mark_file_parsed(file_id, record.xml_type.as_deref(), REASON_NO_DATA)?;
                }
                Ok(record) => {
                    let xml_type = record.xml_type.clone();
                    let data = Value::Object(record.data);
                    store.persist_parsed_file(file_id, xml_type.as_deref(), reason, &data)?;
                }
                Err(e) => {
                    error!("got an error during parse of member {}: {}", entry.name, e);
                    has_failures = true;
                }
            }
        }

        if has_failures {
            warn!(
                "one or more members of archive {} were not parsed; archive stays unparsed",
                archive_id
            );
            store.set_archive_reason(archive_id, REASON_FAILED_FILES)?;
            Ok(FolderOutcome::HasFailures)
        } else if xml_members == 0 {
            info!("there is not a single xml member in archive {}", archive_id);
            store.set_archive_reason(archive_id, REASON_EMPTY_ARCHIVE)?;
            Ok(FolderOutcome::Empty)
        } else {
            store.mark_archive_parsed(archive_id, REASON_OK)?;
            Ok(FolderOutcome::Parsed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const GOOD_XML: &[u8] = b"<export><notice><id>1</id><flag>true</flag></notice></export>";
    const OTHER_XML: &[u8] = b"<export><notice><id>2</id></notice></export>";
    const BAD_XML: &[u8] = b"<export><notice><id>3</id></export>";
    const EMPTY_XML: &[u8] = b"<export></export>";

    fn fixture_zip(members: &[(&str, &[u8])]) -> NamedTempFile {
        let mut tmp = NamedTempFile::new().unwrap();
        {
            let mut zw = zip::ZipWriter::new(tmp.as_file_mut());
            let opts = zip::write::FileOptions::default()
                .compression_method(zip::CompressionMethod::Stored);
            for (name, bytes) in members {
                zw.start_file(*name, opts).unwrap();
                zw.write_all(bytes).unwrap();
            }
            zw.finish().unwrap();
        }
        tmp.flush().unwrap();
        tmp
    }

    fn store_with_archive() -> (StatusStore, i64) {
        let store = StatusStore::open_in_memory().unwrap();
        let id = store
            .add_archive("a_2019010100_001.zip", 1000, "44", "notifications")
            .unwrap();
        (store, id)
    }

    #[test]
    fn parses_all_members_and_marks_archive() {
        let (mut store, archive_id) = store_with_archive();
        let zip = fixture_zip(&[("n1.xml", GOOD_XML), ("n2.xml", OTHER_XML)]);

        let outcome = FolderProcessor::new(ShutdownFlag::new())
            .process(&mut store, zip.path(), archive_id)
            .unwrap();

        assert_eq!(outcome, FolderOutcome::Parsed);
        let stats = store.stats().unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(stats.files_parsed, 2);
        assert_eq!(stats.records, 2);
        assert_eq!(stats.archives_parsed, 1);
    }

    #[test]
    fn non_xml_members_are_ignored() {
        let (mut store, archive_id) = store_with_archive();
        let zip = fixture_zip(&[("n1.xml", GOOD_XML), ("sig.p7s", b"\x01\x02")]);

        let outcome = FolderProcessor::new(ShutdownFlag::new())
            .process(&mut store, zip.path(), archive_id)
            .unwrap();

        assert_eq!(outcome, FolderOutcome::Parsed);
        assert_eq!(store.stats().unwrap().files, 1);
    }

    #[test]
    fn failing_member_does_not_block_siblings() {
        let (mut store, archive_id) = store_with_archive();
        let zip = fixture_zip(&[("bad.xml", BAD_XML), ("good.xml", GOOD_XML)]);

        let outcome = FolderProcessor::new(ShutdownFlag::new())
            .process(&mut store, zip.path(), archive_id)
            .unwrap();

        assert_eq!(outcome, FolderOutcome::HasFailures);
        let stats = store.stats().unwrap();
        // Both members got rows, only the good one is parsed.
        assert_eq!(stats.files, 2);
        assert_eq!(stats.files_parsed, 1);
        assert_eq!(stats.records, 1);
        assert_eq!(stats.archives_parsed, 0);

        let bad = store.get_file(archive_id, "bad.xml").unwrap().unwrap();
        assert!(!bad.has_parsed);
    }

    #[test]
    fn rerun_skips_parsed_members_and_retries_failed_ones() {
        let (mut store, archive_id) = store_with_archive();
        let zip = fixture_zip(&[("bad.xml", BAD_XML), ("good.xml", GOOD_XML)]);
        let processor = FolderProcessor::new(ShutdownFlag::new());

        processor.process(&mut store, zip.path(), archive_id).unwrap();
        let good = store.get_file(archive_id, "good.xml").unwrap().unwrap();
        assert_eq!(store.records_of_file(good.id).unwrap(), 1);

        // Second pass over the same archive: the parsed member is skipped
        // (no duplicate record), the bad one is retried and fails again.
        let outcome = processor.process(&mut store, zip.path(), archive_id).unwrap();
        assert_eq!(outcome, FolderOutcome::HasFailures);
        assert_eq!(store.records_of_file(good.id).unwrap(), 1);

        // Fixed content parses on the third pass and the archive completes.
        let fixed = fixture_zip(&[
            ("bad.xml", b"<export><notice><i>3</i></notice></export>".as_slice()),
            ("good.xml", GOOD_XML),
        ]);
        let outcome = processor.process(&mut store, fixed.path(), archive_id).unwrap();
        assert_eq!(outcome, FolderOutcome::Parsed);
        assert_eq!(store.stats().unwrap().files_parsed, 2);
        assert_eq!(store.records_of_file(good.id).unwrap(), 1);
    }

    #[test]
    fn empty_record_is_marked_without_a_record_row() {
        let (mut store, archive_id) = store_with_archive();
        let zip = fixture_zip(&[("empty.xml", EMPTY_XML)]);

        let outcome = FolderProcessor::new(ShutdownFlag::new())
            .process(&mut store, zip.path(), archive_id)
            .unwrap();

        assert_eq!(outcome, FolderOutcome::Parsed);
        let stats = store.stats().unwrap();
        assert_eq!(stats.files_parsed, 1);
        assert_eq!(stats.records, 0);
    }

    #[test]
    fn archive_without_xml_members_is_empty() {
        let (mut store, archive_id) = store_with_archive();
        let zip = fixture_zip(&[("readme.txt", b"hello")]);

        let outcome = FolderProcessor::new(ShutdownFlag::new())
            .process(&mut store, zip.path(), archive_id)
            .unwrap();

        assert_eq!(outcome, FolderOutcome::Empty);
        assert_eq!(store.stats().unwrap().archives_parsed, 0);
    }

    #[test]
    fn unreadable_container_fails_without_member_rows() {
        let (mut store, archive_id) = store_with_archive();
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"not a zip").unwrap();
        tmp.flush().unwrap();

        let outcome = FolderProcessor::new(ShutdownFlag::new())
            .process(&mut store, tmp.path(), archive_id)
            .unwrap();

        assert_eq!(outcome, FolderOutcome::HasFailures);
        assert_eq!(store.stats().unwrap().files, 0);
    }

    #[test]
    fn shutdown_interrupts_before_the_next_member() {
        let (mut store, archive_id) = store_with_archive();
        let zip = fixture_zip(&[("n1.xml", GOOD_XML)]);

        let shutdown = ShutdownFlag::new();
        shutdown.set();
        let outcome = FolderProcessor::new(shutdown)
            .process(&mut store, zip.path(), archive_id)
            .unwrap();

        assert_eq!(outcome, FolderOutcome::Interrupted);
        // Nothing was started, nothing was committed, archive untouched.
        let stats = store.stats().unwrap();
        assert_eq!(stats.files, 0);
        assert_eq!(stats.archives_parsed, 0);
    }

    #[test]
    fn stale_member_is_purged_and_reparsed() {
        let (mut store, archive_id) = store_with_archive();
        let processor = FolderProcessor::new(ShutdownFlag::new());

        let zip = fixture_zip(&[("n1.xml", GOOD_XML)]);
        processor.process(&mut store, zip.path(), archive_id).unwrap();
        let row = store.get_file(archive_id, "n1.xml").unwrap().unwrap();
        assert_eq!(store.records_of_file(row.id).unwrap(), 1);

        // Same member name, different content size.
        let bigger = fixture_zip(&[(
            "n1.xml",
            b"<export><notice><id>1</id><extra>more</extra></notice></export>".as_slice(),
        )]);
        let outcome = processor.process(&mut store, bigger.path(), archive_id).unwrap();
        assert_eq!(outcome, FolderOutcome::Parsed);

        // The row was reused, old records replaced by the new one.
        let updated = store.get_file(archive_id, "n1.xml").unwrap().unwrap();
        assert_eq!(updated.id, row.id);
        assert_eq!(store.records_of_file(row.id).unwrap(), 1);
        assert!(updated.has_parsed);
        assert_ne!(updated.size, row.size);
    }
}
