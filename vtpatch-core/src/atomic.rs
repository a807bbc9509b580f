use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Write `content` through a sibling temporary file and rename it into
/// place, creating parent directories as needed.
pub(crate) async fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let temp_path = temporary_path(path)?;
    let mut file = fs::File::create(&temp_path).await?;
    if let Err(err) = write_and_flush(&mut file, content).await {
        drop(file);
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    drop(file);

    // Keep the mode bits of the file being replaced.
    if let Ok(metadata) = fs::metadata(path).await {
        fs::set_permissions(&temp_path, metadata.permissions()).await?;
    }

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            fs::remove_file(path).await?;
            fs::rename(&temp_path, path).await
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err)
        }
    }
}

async fn write_and_flush(file: &mut fs::File, content: &[u8]) -> io::Result<()> {
    file.write_all(content).await?;
    file.flush().await?;
    file.sync_all().await
}

fn temporary_path(target: &Path) -> io::Result<PathBuf> {
    let parent = target
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = target
        .file_name()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("vtpatch");
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(io::Error::other)?
        .as_nanos();
    let pid = std::process::id();
    Ok(parent.join(format!(".{file_name}.{pid}.{timestamp}.tmp")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn creates_parents_and_replaces_content() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("nested/deeper/file.txt");

        write_atomic(&target, b"first").await.unwrap();
        write_atomic(&target, b"second").await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"second");
        let leftovers = std::fs::read_dir(target.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
