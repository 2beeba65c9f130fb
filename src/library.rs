//! On-disk layout of downloaded songs
//!
//! Partial downloads live next to finished ones as `<itemId>.<ext>.part`.
//! Finished songs are renamed to `<title>.<ext>` and recorded in a small JSON
//! index so they can be recognised by item id after a restart.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;
use tracing::{debug, trace, warn};

pub const FILE_DOWNLOADING_SUFFIX: &str = ".part";
const INDEX_FILE_NAME: &str = ".songdl-index.json";

static UNSAFE_FILENAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[/\\:*?"<>|\x00-\x1f]"#).expect("valid regex"));

/// Name of the partial file for an item
pub fn part_file_name(item_id: &str, extension: &str) -> String {
    format!("{item_id}.{extension}{FILE_DOWNLOADING_SUFFIX}")
}

/// Name a finished song is renamed to
pub fn final_file_name(title: &str, extension: &str) -> String {
    format!("{}.{}", sanitize_file_stem(title), extension)
}

/// Replace characters that are not allowed in file names
pub fn sanitize_file_stem(title: &str) -> String {
    let cleaned = UNSAFE_FILENAME_CHARS.replace_all(title, "_");
    let cleaned = cleaned.trim().trim_end_matches('.');

    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Whether `item_id` can be used as the stem of a partial file name.
///
/// Ids end up in paths and are matched up to the first `.`, so path
/// separators, dots and control characters are refused.
pub fn is_valid_item_id(item_id: &str) -> bool {
    !item_id.is_empty()
        && !item_id
            .chars()
            .any(|c| matches!(c, '/' | '\\' | '.') || c.is_control())
}

/// Whether `file_name` is the partial file of `item_id`
pub fn is_in_progress_for(file_name: &str, item_id: &str) -> bool {
    file_name.ends_with(FILE_DOWNLOADING_SUFFIX) && file_name.starts_with(&format!("{item_id}."))
}

/// Item id of a partial file, `None` for anything else
pub fn song_id_of_in_progress(file_name: &str) -> Option<&str> {
    if !file_name.ends_with(FILE_DOWNLOADING_SUFFIX) {
        return None;
    }
    file_name.split('.').next().filter(|id| !id.is_empty())
}

/// Extension of a partial file name (`abc.webm.part` -> `webm`)
pub fn part_extension(file_name: &str) -> Option<&str> {
    let stem = file_name.strip_suffix(FILE_DOWNLOADING_SUFFIX)?;
    let (_, extension) = stem.rsplit_once('.')?;
    Some(extension)
}

/// A song file found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalSongFile {
    /// Resumable download holding `size` bytes
    Partial { path: PathBuf, size: u64 },
    Complete(PathBuf),
}

impl LocalSongFile {
    pub fn path(&self) -> &Path {
        match self {
            Self::Partial { path, .. } => path,
            Self::Complete(path) => path,
        }
    }
}

#[derive(Debug)]
pub struct LocalLibrary {
    dir: PathBuf,
    // Serialises read-modify-write cycles on the index file
    index_lock: tokio::sync::Mutex<()>,
}

impl LocalLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            index_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn ensure_dir(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE_NAME)
    }

    async fn load_index(&self) -> io::Result<BTreeMap<String, String>> {
        match tokio::fs::read(self.index_path()).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(index) => Ok(index),
                Err(e) => {
                    warn!(error = %e, "Ignoring corrupt library index");
                    Ok(BTreeMap::new())
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e),
        }
    }

    /// Find the song file of an item, preferring a partial download
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn find_local_file(&self, item_id: &str) -> io::Result<Option<LocalSongFile>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if is_in_progress_for(&name, item_id) {
                let size = entry.metadata().await?.len();
                trace!(path = ?entry.path(), size, "Found partial download");
                return Ok(Some(LocalSongFile::Partial {
                    path: entry.path(),
                    size,
                }));
            }
        }

        let index = self.load_index().await?;
        if let Some(name) = index.get(item_id) {
            let path = self.dir.join(name);
            if tokio::fs::try_exists(&path).await? {
                return Ok(Some(LocalSongFile::Complete(path)));
            }
            debug!(item_id, ?path, "Indexed song file is missing");
        }

        Ok(None)
    }

    /// Item ids of every partial download in the directory
    pub async fn in_progress_ids(&self) -> io::Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(id) = song_id_of_in_progress(&name.to_string_lossy()) {
                ids.push(id.to_string());
            }
        }

        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Reserve the final path of a finished song.
    ///
    /// Takes `<title>.<ext>` when free and `<title> (<id>).<ext>` otherwise.
    /// The name is held by an empty file the caller renames the song over.
    pub async fn claim_final_path(
        &self,
        item_id: &str,
        title: &str,
        extension: &str,
    ) -> io::Result<PathBuf> {
        let _guard = self.index_lock.lock().await;

        let path = self.dir.join(final_file_name(title, extension));
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => return Ok(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!(?path, "Final name taken, falling back to the item id");
            }
            Err(e) => return Err(e),
        }

        let disambiguated = format!("{} ({item_id})", sanitize_file_stem(title));
        let path = self.dir.join(final_file_name(&disambiguated, extension));
        tokio::fs::File::create(&path).await?;
        Ok(path)
    }

    /// Remember that `item_id` is stored at `path`
    pub async fn record_finished(&self, item_id: &str, path: &Path) -> io::Result<()> {
        let _guard = self.index_lock.lock().await;

        let mut index = self.load_index().await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        index.insert(item_id.to_string(), name);

        let json = serde_json::to_vec_pretty(&index).map_err(io::Error::other)?;
        let tmp = self.dir.join(format!("{INDEX_FILE_NAME}.tmp"));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, self.index_path()).await?;

        debug!(item_id, ?path, "Recorded finished song");
        Ok(())
    }
}
