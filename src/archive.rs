use chrono::NaiveDate;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use std::fs::{self, File};
use std::io::{self, Write};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tar::{self, Builder as TarBuilder};
use tracing::debug;
use walkdir::WalkDir;
use xz2::write::XzEncoder;

use crate::error::{Error, Result};
use crate::report::SUMMARY_FILE;
use crate::store::sanitize_filename;
use crate::verify::digest_path_for;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    #[default]
    Gzip,
    Xz,
}

impl ArchiveFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::Gzip => "tar.gz",
            ArchiveFormat::Xz => "tar.xz",
        }
    }
}

pub fn archive_name(account: &str, date: NaiveDate, format: ArchiveFormat) -> String {
    format!(
        "archive-{}-{}.{}",
        sanitize_filename(account),
        date.format("%Y-%m-%d"),
        format.extension()
    )
}

#[cfg(unix)]
fn set_archive_permission(file: &File) -> io::Result<()> {
    let mut perms = file.metadata()?.permissions();
    let mode = (perms.mode() & !0o777) | 0o600;
    perms.set_mode(mode);
    file.set_permissions(perms)
}

fn fill_archive<W: Write>(
    mut builder: TarBuilder<W>,
    source: &Path,
    prefix: &Path,
    skip: &[PathBuf],
) -> io::Result<W> {
    builder.mode(tar::HeaderMode::Deterministic);
    builder.follow_symlinks(false);
    // Sorted so that archives of identical trees are identical.
    let walker = WalkDir::new(source)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !skip.iter().any(|path| path == entry.path()));
    for entry in walker {
        let entry = entry?;
        let path = entry.path();
        let relative = path
            .strip_prefix(source)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let name = match entry.depth() {
            0 => prefix.to_path_buf(),
            _ => prefix.join(relative),
        };
        if entry.file_type().is_dir() {
            builder.append_dir(&name, path)?;
        } else {
            builder.append_path_with_name(path, &name)?;
        }
    }
    builder.into_inner()
}

fn do_archive(
    source: &Path,
    tmp_path: &Path,
    skip: &[PathBuf],
    format: ArchiveFormat,
) -> io::Result<()> {
    let tmp_file = File::create(tmp_path)?;
    #[cfg(unix)]
    set_archive_permission(&tmp_file)?;

    let prefix = PathBuf::from(source.file_name().unwrap_or_else(|| "archive".as_ref()));
    let file = match format {
        ArchiveFormat::Gzip => {
            let gz_writer = GzEncoder::new(tmp_file, Compression::default());
            fill_archive(TarBuilder::new(gz_writer), source, &prefix, skip)?.finish()?
        }
        ArchiveFormat::Xz => {
            let xz_writer = XzEncoder::new(tmp_file, 6);
            fill_archive(TarBuilder::new(xz_writer), source, &prefix, skip)?.finish()?
        }
    };
    file.sync_all()
}

/// Compresses the tree under `source` into
/// `source/archive-<account>-<date>.<ext>`.
///
/// The archive is written under a temporary name and renamed once complete.
/// The archive, its temporary file, its digest and the account summary
/// are never part of the archived tree.
pub fn build_archive(
    source: &Path,
    account: &str,
    date: NaiveDate,
    format: ArchiveFormat,
) -> Result<PathBuf> {
    if !source.is_dir() {
        return Err(Error::compression(source, "source directory does not exist"));
    }
    let archive_path = source.join(archive_name(account, date, format));
    let tmp_path = source.join(format!("{}.tmp", archive_name(account, date, format)));
    let skip = [
        archive_path.clone(),
        tmp_path.clone(),
        digest_path_for(&archive_path),
        source.join(SUMMARY_FILE),
    ];

    if let Err(e) = do_archive(source, &tmp_path, &skip, format) {
        let _ = fs::remove_file(&tmp_path);
        return Err(Error::compression(&archive_path, e));
    }
    fs::rename(&tmp_path, &archive_path).map_err(|e| Error::compression(&archive_path, e))?;
    debug!(archive = %archive_path.display(), "archive written");
    Ok(archive_path)
}
