//! # Utility Module
//!
//! Output directory checks and path helpers.

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::warn;

/// Create the timeline output directory if needed and check that events can
/// be written into it. A world-writable directory is accepted with a warning.
pub fn ensure_output_dir(path: &Path) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(metadata) if !metadata.is_dir() => {
            bail!("timeline output {} exists and is not a directory", path.display());
        }
        Ok(_) => {}
        Err(_) => std::fs::create_dir_all(path).with_context(|| {
            format!("cannot create timeline output directory {}", path.display())
        })?,
    }

    let check = path.join(".plumbline_write_check");
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&check)
        .with_context(|| format!("timeline output directory {} rejects writes", path.display()))?;
    let _ = std::fs::remove_file(&check);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(path)?.permissions().mode();
        if mode & 0o002 != 0 {
            warn!("timeline output directory {} is world-writable", path.display());
        }
    }

    Ok(())
}

/// `path` relative to `root`, slash separated with a leading slash
/// (`/var/log/syslog`). Paths outside `root` are returned whole.
pub fn relative_slash_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let joined = relative
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/");
    format!("/{joined}")
}

#[cfg(test)]
mod tests {
    use super::{ensure_output_dir, relative_slash_path};
    use std::fs::File;
    use std::path::Path;
    use tempfile::tempdir;

    #[test]
    fn ensures_output_dir_is_writable() {
        let dir = tempdir().expect("tempdir");
        ensure_output_dir(&dir.path().join("nested/timeline")).expect("ensure output dir");
        assert!(dir.path().join("nested/timeline").is_dir());
        assert!(!dir.path().join("nested/timeline/.plumbline_write_check").exists());
    }

    #[test]
    fn rejects_output_path_that_is_file() {
        let dir = tempdir().expect("tempdir");
        let file_path = dir.path().join("output.txt");
        let _ = File::create(&file_path).expect("create file");
        let err = ensure_output_dir(&file_path).expect_err("should fail");
        assert!(err.to_string().contains("is not a directory"));
    }

    #[test]
    fn relative_paths_use_forward_slashes() {
        let root = Path::new("/mnt/evidence");
        assert_eq!(
            relative_slash_path(root, Path::new("/mnt/evidence/var/log/syslog")),
            "/var/log/syslog"
        );
        assert_eq!(relative_slash_path(root, root), "/");
    }
}
