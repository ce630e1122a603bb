//! Archive expansion (zip, tar.gz)
//!
//! Members are flattened to their file names inside the destination
//! directory; directory structure inside the archive is discarded.

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Supported archive containers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
}

/// Final path segment of an archive member, or `None` for entries to skip
fn flat_name(member: &str) -> Option<String> {
    if member.starts_with("__MACOSX/") || member.ends_with('/') {
        return None;
    }
    let name = member.rsplit(['/', '\\']).next()?.trim();
    if name.is_empty() || name == "." || name == ".." || name.starts_with("._") {
        return None;
    }
    Some(name.to_string())
}

fn push_unique(paths: &mut Vec<PathBuf>, path: PathBuf) {
    if !paths.contains(&path) {
        paths.push(path);
    }
}

fn expand_zip(archive: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    let mut zip = zip::ZipArchive::new(BufReader::new(File::open(archive)?))?;
    let mut members = Vec::new();
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let Some(name) = flat_name(entry.name()) else {
            continue;
        };
        let target = dest.join(&name);
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        push_unique(&mut members, target);
    }
    Ok(members)
}

fn expand_tar_gz(archive: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(File::open(archive)?)));
    let mut members = Vec::new();
    for entry in tar.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let member = entry.path()?.to_string_lossy().to_string();
        let Some(name) = flat_name(&member) else {
            continue;
        };
        let target = dest.join(&name);
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        push_unique(&mut members, target);
    }
    Ok(members)
}

/// Expand `archive` into `dest`, returning the written member paths in
/// archive order
pub async fn expand_archive(kind: ArchiveKind, archive: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(dest).await?;
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    let members = tokio::task::spawn_blocking(move || match kind {
        ArchiveKind::Zip => expand_zip(&archive, &dest),
        ArchiveKind::TarGz => expand_tar_gz(&archive, &dest),
    })
    .await
    .map_err(|e| Error::Other(format!("archive task failed: {}", e)))??;
    debug!(kind = ?kind, members = members.len(), "Expanded archive");
    Ok(members)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    pub(crate) fn write_zip(path: &Path, members: &[(&str, &[u8])]) {
        let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, bytes) in members {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap();
    }

    #[tokio::test]
    async fn test_zip_members_are_flattened() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("layers.zip");
        write_zip(
            &archive,
            &[
                ("nested/dir/a.geojson", b"{}".as_slice()),
                ("b.prj", b"GEOGCS[\"WGS 84\"]".as_slice()),
                ("__MACOSX/nested/._a.geojson", b"junk".as_slice()),
            ],
        );

        let out = tmp.path().join("out");
        let members = expand_archive(ArchiveKind::Zip, &archive, &out).await.unwrap();
        let names: Vec<_> = members
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.geojson", "b.prj"]);
        assert!(out.join("a.geojson").exists());
    }

    #[tokio::test]
    async fn test_tar_gz_members() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("rasters.tar.gz");
        {
            let encoder = GzEncoder::new(File::create(&archive).unwrap(), Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let data = b"raster-bytes";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "inner/elevation.tif", &data[..])
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let out = tmp.path().join("out");
        let members = expand_archive(ArchiveKind::TarGz, &archive, &out).await.unwrap();
        assert_eq!(members, vec![out.join("elevation.tif")]);
        assert_eq!(std::fs::read(out.join("elevation.tif")).unwrap(), b"raster-bytes");
    }

    #[tokio::test]
    async fn test_corrupt_zip_is_error() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("broken.zip");
        std::fs::write(&archive, b"not a zip").unwrap();
        assert!(expand_archive(ArchiveKind::Zip, &archive, &tmp.path().join("out"))
            .await
            .is_err());
    }
}
