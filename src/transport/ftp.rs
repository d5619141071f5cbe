//! FTP traversal of the region tree.
//!
//! The server exposes one directory per region under a fixed root; each
//! region carries a `notifications` (or `protocols`) folder with ZIP
//! archives, possibly nested into subdirectories. The traversal descends
//! depth-first and yields archives in listing order.

use std::collections::VecDeque;
use std::path::Path;

use suppaftp::FtpStream;
use tracing::{debug, info, warn};

use super::{RemoteArchive, Transport, TransportError};

const FTP_LOGIN: &str = "free";
const FTP_PASSWORD: &str = "free";
const DEFAULT_PORT: u16 = 21;

pub struct FtpTransport {
    stream: FtpStream,
    root_dir: String,
    folder: String,
    regions: VecDeque<String>,
    current_region: Option<String>,
    pending_dirs: VecDeque<String>,
    queued: VecDeque<RemoteArchive>,
}

impl FtpTransport {
    /// Connect, log in anonymously and list the region directories.
    pub fn connect(address: &str, root_dir: &str, folder: &str) -> Result<Self, TransportError> {
        let addr = if address.contains(':') {
            address.to_string()
        } else {
            format!("{address}:{DEFAULT_PORT}")
        };
        debug!("connect to server {}", addr);
        let mut stream = FtpStream::connect(addr)?;
        stream.login(FTP_LOGIN, FTP_PASSWORD)?;
        info!("connected to {}", address);

        let mut transport = Self {
            stream,
            root_dir: root_dir.trim_end_matches('/').to_string(),
            folder: folder.to_string(),
            regions: VecDeque::new(),
            current_region: None,
            pending_dirs: VecDeque::new(),
            queued: VecDeque::new(),
        };
        transport.read_regions()?;
        Ok(transport)
    }

    fn read_regions(&mut self) -> Result<(), TransportError> {
        let lines = self.stream.list(Some(self.root_dir.as_str()))?;
        for line in lines {
            if let Some(item) = parse_list_line(&line) {
                if item.is_dir {
                    self.regions.push_back(item.name);
                }
            }
        }
        info!(
            "{} region directories under {}",
            self.regions.len(),
            self.root_dir
        );
        Ok(())
    }

    /// List one directory, queueing subdirectories for descent and files as
    /// archive descriptors.
    fn read_dir(&mut self, dir: &str) -> Result<(), TransportError> {
        debug!("read files of directory {}", dir);
        let region = self.current_region.clone().unwrap_or_default();
        let lines = self.stream.list(Some(dir))?;
        for line in lines {
            let Some(item) = parse_list_line(&line) else {
                continue;
            };
            if item.is_dir {
                debug!("go inside {}", item.name);
                self.pending_dirs.push_back(format!("{dir}/{}", item.name));
            } else {
                self.queued.push_back(RemoteArchive {
                    path: format!("{dir}/{}", item.name),
                    name: item.name,
                    size: item.size,
                    region: region.clone(),
                });
            }
        }
        Ok(())
    }
}

impl Transport for FtpTransport {
    fn next_archive(&mut self) -> Result<Option<RemoteArchive>, TransportError> {
        loop {
            if let Some(archive) = self.queued.pop_front() {
                return Ok(Some(archive));
            }
            if let Some(dir) = self.pending_dirs.pop_front() {
                // A region with an unreadable folder should not end the whole
                // listing; its subtree is skipped and logged.
                if let Err(e) = self.read_dir(&dir) {
                    warn!("cannot list {}: {}", dir, e);
                }
                continue;
            }
            match self.regions.pop_front() {
                Some(region) => {
                    info!("read region {}", region);
                    self.pending_dirs
                        .push_back(format!("{}/{}/{}", self.root_dir, region, self.folder));
                    self.current_region = Some(region);
                }
                None => return Ok(None),
            }
        }
    }

    fn download(&mut self, remote_path: &str, local_path: &Path) -> Result<(), TransportError> {
        debug!("download {} to {}", remote_path, local_path.display());
        let buffer = self.stream.retr_as_buffer(remote_path)?;
        std::fs::write(local_path, buffer.into_inner())?;
        Ok(())
    }

    fn skip_region(&mut self, region: &str) {
        if self.current_region.as_deref() == Some(region) {
            debug!("abandon remaining listing of region {}", region);
            self.pending_dirs.clear();
            self.queued.retain(|archive| archive.region != region);
        }
    }
}

impl Drop for FtpTransport {
    fn drop(&mut self) {
        let _ = self.stream.quit();
    }
}

struct ListItem {
    is_dir: bool,
    size: u64,
    name: String,
}

/// Parse one LIST line of the form
/// `drwxr-xr-x 2 owner group 4096 Jan 01 00:00 name with spaces`.
fn parse_list_line(line: &str) -> Option<ListItem> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 9 {
        return None;
    }
    let is_dir = fields[0].starts_with('d');
    let size = fields[4].parse().ok()?;
    let name = fields[8..].join(" ");
    Some(ListItem { is_dir, size, name })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_line() {
        let item = parse_list_line(
            "-rw-r--r--   1 ftp ftp      4021 Jan 31 03:00 notification_Adygeja_Resp_2019013100_001.zip",
        )
        .unwrap();
        assert!(!item.is_dir);
        assert_eq!(item.size, 4021);
        assert_eq!(item.name, "notification_Adygeja_Resp_2019013100_001.zip");
    }

    #[test]
    fn parses_directory_line() {
        let item =
            parse_list_line("drwxr-xr-x   2 ftp ftp      4096 Jan 01 00:00 Adygeja_Resp").unwrap();
        assert!(item.is_dir);
        assert_eq!(item.name, "Adygeja_Resp");
    }

    #[test]
    fn keeps_spaces_in_names() {
        let item =
            parse_list_line("-rw-r--r--   1 ftp ftp      10 Jan 01 00:00 name with spaces.zip")
                .unwrap();
        assert_eq!(item.name, "name with spaces.zip");
    }

    #[test]
    fn rejects_short_lines() {
        assert!(parse_list_line("total 42").is_none());
        assert!(parse_list_line("").is_none());
    }
}
