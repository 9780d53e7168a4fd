//! Disk usage and per-user disk quotas

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::{ContainmentError, Result};
use crate::tool::{resolve_tool, run_tool};

/// Per-principal quota on the volume holding container directories
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DiskQuota: Send + Sync {
    async fn set_quota(&self, principal: &str, bytes: u64) -> Result<()>;

    /// Current limit in bytes, 0 when none is set
    async fn quota(&self, principal: &str) -> Result<u64>;
}

/// Bytes used by regular files under `dir`; a missing directory uses none
pub fn directory_size(dir: &Path) -> Result<u64> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut total = 0u64;
    for entry in WalkDir::new(dir) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                // Files can vanish while a container is running
                warn!(dir = %dir.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if entry.file_type().is_file() {
            total += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok(total)
}

/// Quotas managed with `fsutil quota`
pub struct FsutilDiskQuota {
    volume: String,
    fsutil_path: PathBuf,
}

impl FsutilDiskQuota {
    /// Quotas on the volume (`C:`) holding `path`
    pub fn for_path(path: &Path) -> Result<Self> {
        let volume = volume_of(path).ok_or_else(|| {
            ContainmentError::InvalidArgument(format!(
                "{} is not on a drive letter volume",
                path.display()
            ))
        })?;
        Ok(Self {
            volume,
            fsutil_path: resolve_tool("fsutil.exe"),
        })
    }
}

fn volume_of(path: &Path) -> Option<String> {
    let text = path.to_str()?;
    let mut chars = text.chars();
    let letter = chars.next()?;
    if letter.is_ascii_alphabetic() && chars.next() == Some(':') {
        Some(format!("{}:", letter.to_ascii_uppercase()))
    } else {
        None
    }
}

/// Pull the limit for `principal` out of `fsutil quota query` output
pub fn parse_quota_limit(output: &str, principal: &str) -> Option<u64> {
    let suffix = format!("\\{}", principal.to_lowercase());
    let mut in_entry = false;

    for line in output.lines() {
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let label = label.trim();
        let value = value.trim();

        if label.eq_ignore_ascii_case("SID Name") {
            // HOST\user (User)
            let name = value.split(" (").next().unwrap_or(value).to_lowercase();
            in_entry = name == principal.to_lowercase() || name.ends_with(&suffix);
        } else if in_entry && label.eq_ignore_ascii_case("Quota Limit") {
            let digits = value.split_whitespace().next()?;
            return digits.replace(',', "").parse().ok();
        }
    }
    None
}

#[async_trait]
impl DiskQuota for FsutilDiskQuota {
    async fn set_quota(&self, principal: &str, bytes: u64) -> Result<()> {
        let args = vec![
            "quota".to_string(),
            "modify".to_string(),
            self.volume.clone(),
            bytes.to_string(),
            bytes.to_string(),
            principal.to_string(),
        ];
        run_tool(&self.fsutil_path, &args).await?;
        info!(principal = %principal, bytes, volume = %self.volume, "Disk quota set");
        Ok(())
    }

    async fn quota(&self, principal: &str) -> Result<u64> {
        let args = vec!["quota".to_string(), "query".to_string(), self.volume.clone()];
        let output = run_tool(&self.fsutil_path, &args).await?;
        Ok(parse_quota_limit(&output, principal).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUERY_OUTPUT: &str = "\
FileSystemControlFlags = 0x00000301
    Quotas are tracked on this volume

SID Name        : BUILTIN\\Administrators (Alias)
Change time     : Monday, March 2, 2015 10:15:00 AM
Quota Used      : 0
Quota Threshold : 18446744073709551615
Quota Limit     : 18446744073709551615

SID Name        : HOST\\c_user (User)
Change time     : Monday, March 2, 2015 10:16:00 AM
Quota Used      : 4096
Quota Threshold : 1073741824
Quota Limit     : 1073741824
";

    #[test]
    fn test_parses_limit_for_principal() {
        assert_eq!(parse_quota_limit(QUERY_OUTPUT, "c_user"), Some(1_073_741_824));
        assert_eq!(parse_quota_limit(QUERY_OUTPUT, "C_USER"), Some(1_073_741_824));
        assert_eq!(parse_quota_limit(QUERY_OUTPUT, "someone_else"), None);
    }

    #[test]
    fn test_volume_from_drive_path() {
        assert_eq!(volume_of(Path::new(r"c:\containers\c1")), Some("C:".to_string()));
        assert_eq!(volume_of(Path::new("/tmp/c1")), None);
    }

    #[test]
    fn test_directory_size_sums_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), vec![0u8; 1000]).unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("b.bin"), vec![0u8; 24]).unwrap();

        assert_eq!(directory_size(dir.path()).unwrap(), 1024);
    }

    #[test]
    fn test_missing_directory_uses_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(directory_size(&dir.path().join("gone")).unwrap(), 0);
    }
}
