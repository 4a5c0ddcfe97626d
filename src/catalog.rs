//! Schema catalog cache
//!
//! A catalog is the YANG + SID bundle matching one device firmware, named
//! by the checksum the device reports. Bundles are `<checksum>.tar.gz`
//! archives fetched from a configurable source and unpacked (flattened)
//! into `<cache_dir>/<checksum>/`. Cached catalogs are never modified.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use ciborium::Value as Cbor;
use flate2::read::GzDecoder;
use tracing::{debug, info};

use crate::client::CoapClient;
use crate::config::CatalogConfig;
use crate::error::{CoreconfError, Result};
use crate::instance_id::{InstancePath, decode_instances};

/// Summary of one cached catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogInfo {
    pub checksum: String,
    pub path: PathBuf,
    pub yang_files: usize,
    pub sid_files: usize,
}

/// Archive bytes fetched remotely, or a file already on disk
enum Fetched {
    Downloaded(Vec<u8>),
    Local(PathBuf),
}

/// Where catalog archives come from
#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Http(String),
    Directory(PathBuf),
}

impl Source {
    fn parse(location: &str) -> Self {
        if location.starts_with("http://") || location.starts_with("https://") {
            Source::Http(location.trim_end_matches('/').to_string())
        } else {
            let path = location.strip_prefix("file://").unwrap_or(location);
            Source::Directory(PathBuf::from(path))
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogManager {
    cache_dir: PathBuf,
    source: Option<Source>,
    checksum_sid: i64,
    http: reqwest::Client,
}

impl CatalogManager {
    /// Resolve the cache directory.
    ///
    /// Without an explicit directory the per-user cache is used and created
    /// on demand. An explicit directory must already exist.
    pub fn new(config: &CatalogConfig) -> Result<Self> {
        let cache_dir = match &config.cache_dir {
            Some(dir) => {
                if !dir.is_dir() {
                    return Err(CoreconfError::CacheDirMissing(dir.display().to_string()));
                }
                dir.clone()
            }
            None => {
                let dir = default_cache_dir();
                fs::create_dir_all(&dir)?;
                dir
            }
        };
        debug!(cache_dir = %cache_dir.display(), "catalog cache ready");

        Ok(Self {
            cache_dir,
            source: config.source.as_deref().map(Source::parse),
            checksum_sid: config.checksum_sid,
            http: reqwest::Client::new(),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn catalog_dir(&self, checksum: &str) -> PathBuf {
        self.cache_dir.join(checksum.to_ascii_lowercase())
    }

    /// Ask the device which catalog it runs
    pub async fn query_checksum_from_device(&self, client: &CoapClient) -> Result<String> {
        let query = InstancePath::new(self.checksum_sid).encode_cbor()?;
        let reply = client.send_ifetch_request(&[query]).await?;

        let value = decode_instances(&reply)?
            .into_iter()
            .find(|instance| instance.path.sid == self.checksum_sid)
            .map(|instance| instance.value)
            .ok_or_else(|| {
                CoreconfError::catalog("<device>", format!("reply lacks SID {}", self.checksum_sid))
            })?;

        let checksum: String = match value {
            Cbor::Bytes(bytes) => bytes.iter().map(|b| format!("{b:02x}")).collect(),
            Cbor::Text(text) => text.trim().to_ascii_lowercase(),
            other => {
                return Err(CoreconfError::catalog(
                    "<device>",
                    format!("checksum has unexpected type: {other:?}"),
                ));
            }
        };
        validate_checksum(&checksum)?;
        info!(checksum = %checksum, "device catalog checksum");
        Ok(checksum)
    }

    /// Fetch and unpack a catalog; a cached checksum returns immediately
    pub async fn download_catalog(&self, checksum: &str) -> Result<PathBuf> {
        validate_checksum(checksum)?;
        let target = self.catalog_dir(checksum);
        if target.is_dir() {
            debug!(checksum, "catalog already cached");
            return Ok(target);
        }

        let source = self
            .source
            .as_ref()
            .ok_or_else(|| CoreconfError::catalog(checksum, "no catalog source configured"))?;
        let archive_name = format!("{}.tar.gz", checksum.to_ascii_lowercase());

        let archive = match source {
            Source::Http(base) => {
                let url = format!("{base}/{archive_name}");
                info!(url = %url, "downloading catalog");
                let response = self
                    .http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| CoreconfError::catalog(checksum, format!("GET {url}: {e}")))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(CoreconfError::catalog(checksum, format!("GET {url}: HTTP {status}")));
                }
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| CoreconfError::catalog(checksum, format!("GET {url}: {e}")))?;
                Fetched::Downloaded(body.to_vec())
            }
            Source::Directory(dir) => {
                let path = dir.join(&archive_name);
                info!(path = %path.display(), "reading catalog");
                Fetched::Local(path)
            }
        };

        let manager = self.clone();
        let owned = checksum.to_string();
        tokio::task::spawn_blocking(move || manager.install_archive(&owned, &archive_name, archive))
            .await
            .map_err(|e| CoreconfError::catalog(checksum, format!("extraction aborted: {e}")))?
    }

    fn install_archive(&self, checksum: &str, archive_name: &str, archive: Fetched) -> Result<PathBuf> {
        match archive {
            Fetched::Local(path) => self.extract_catalog(checksum, &path),
            Fetched::Downloaded(body) => {
                let staging = tempfile::Builder::new()
                    .prefix(".download-")
                    .tempdir_in(&self.cache_dir)?;
                let path = staging.path().join(archive_name);
                fs::write(&path, body)?;
                self.extract_catalog(checksum, &path)
            }
        }
    }

    /// Unpack an archive into the cache under `checksum`.
    ///
    /// Directory structure inside the archive is flattened. Files are
    /// unpacked into a staging directory that is then renamed into place.
    pub fn extract_catalog(&self, checksum: &str, archive: &Path) -> Result<PathBuf> {
        validate_checksum(checksum)?;
        let target = self.catalog_dir(checksum);
        if target.is_dir() {
            return Ok(target);
        }

        let staging = tempfile::Builder::new()
            .prefix(".extract-")
            .tempdir_in(&self.cache_dir)?;
        let count = unpack_flat(archive, staging.path())
            .map_err(|e| CoreconfError::catalog(checksum, format!("{}: {e}", archive.display())))?;
        if count == 0 {
            return Err(CoreconfError::catalog(checksum, "archive holds no files"));
        }

        promote(staging.path(), &target)?;
        info!(checksum, files = count, path = %target.display(), "catalog extracted");
        Ok(target)
    }

    /// Path and file counts of a cached catalog; `None` if not cached
    pub fn get_catalog_info(&self, checksum: &str) -> Option<CatalogInfo> {
        validate_checksum(checksum).ok()?;
        let path = self.catalog_dir(checksum);
        if !path.is_dir() {
            return None;
        }

        let (mut yang_files, mut sid_files) = (0, 0);
        for entry in fs::read_dir(&path).ok()?.flatten() {
            match entry.path().extension().and_then(|e| e.to_str()) {
                Some("yang") => yang_files += 1,
                Some("sid") => sid_files += 1,
                _ => {}
            }
        }
        Some(CatalogInfo {
            checksum: checksum.to_ascii_lowercase(),
            path,
            yang_files,
            sid_files,
        })
    }

    /// Every cached catalog, ordered by checksum
    pub fn list_cached_catalogs(&self) -> Result<Vec<CatalogInfo>> {
        let mut catalogs: Vec<CatalogInfo> = fs::read_dir(&self.cache_dir)?
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| validate_checksum(name).is_ok())
            .filter_map(|name| self.get_catalog_info(&name))
            .collect();
        catalogs.sort_by(|a, b| a.checksum.cmp(&b.checksum));
        Ok(catalogs)
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tsn-coreconf")
        .join("catalogs")
}

/// Move an unpacked staging directory to `target`; an existing target wins
fn promote(staged: &Path, target: &Path) -> std::io::Result<()> {
    match fs::rename(staged, target) {
        Ok(()) => Ok(()),
        // Lost a race against another extraction of the same checksum
        Err(_) if target.is_dir() => Ok(()),
        Err(e) => Err(e),
    }
}

fn validate_checksum(checksum: &str) -> Result<()> {
    if checksum.is_empty() || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CoreconfError::catalog(checksum, "checksum is not a hex string"));
    }
    Ok(())
}

/// Unpack every regular file of a `.tar.gz` into `dest` by file name
fn unpack_flat(archive: &Path, dest: &Path) -> std::io::Result<usize> {
    let mut header = [0u8; 2];
    File::open(archive)?.read_exact(&mut header)?;
    if header != [0x1f, 0x8b] {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "not a gzip archive",
        ));
    }

    let mut tar = tar::Archive::new(GzDecoder::new(File::open(archive)?));
    let mut count = 0;
    for entry in tar.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.into_owned();
        let Some(name) = path.file_name() else {
            continue;
        };
        entry.unpack(dest.join(name))?;
        count += 1;
    }
    Ok(count)
}
