/// On-disk store of batches the backend has not acknowledged yet
///
/// One file per batch, named after the capture time (`<unix-secs>.json`,
/// `<unix-secs>-<n>.json` on collision), holding the JSON measurement array.
use log::debug;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

pub struct Backlog {
    dir: PathBuf,
}

impl Backlog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Backlog { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stores `batch` under a name derived from `timestamp` and returns its path.
    pub async fn persist(&self, timestamp: i64, batch: &[u8]) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.dir).await?;

        let mut suffix = 0u32;
        loop {
            let name = match suffix {
                0 => format!("{}.json", timestamp),
                n => format!("{}-{}.json", timestamp, n),
            };
            let path = self.dir.join(name);
            // create_new claims the name so concurrent writers never share a file
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => {
                    let tmp = path.with_extension("json.tmp");
                    let written = match fs::write(&tmp, batch).await {
                        Ok(()) => fs::rename(&tmp, &path).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = written {
                        // an empty claimed file would never parse and never be deleted
                        let _ = fs::remove_file(&tmp).await;
                        let _ = fs::remove_file(&path).await;
                        return Err(e);
                    }
                    debug!("Persisted batch to {}", path.display());
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// Pending batch files, oldest capture time first.
    pub async fn entries(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                entries.push(path);
            }
        }
        entries.sort_by_key(|p| sort_key(p));
        Ok(entries)
    }

    pub async fn read(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        fs::read(path).await
    }

    /// Deletes a delivered batch. A file already gone counts as removed.
    pub async fn remove(&self, path: &Path) -> std::io::Result<()> {
        match fs::remove_file(path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

fn sort_key(path: &Path) -> (i64, u32) {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let (secs, n) = stem.split_once('-').unwrap_or((stem, "0"));
    (secs.parse().unwrap_or(i64::MAX), n.parse().unwrap_or(0))
}
