//! Packing and atomic installation of artifact layers.

use std::ffi::OsString;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, warn};

use crate::error::OciError;

/// Build a gzipped tarball holding `files` at the archive root.
pub fn pack<P: AsRef<str>, D: AsRef<[u8]>>(files: &[(P, D)]) -> Result<Vec<u8>, OciError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, data) in files {
        let data = data.as_ref();
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path.as_ref(), data)?;
    }
    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// Extract gzipped tarballs into `dest`.
///
/// Every layer is unpacked into one staging directory inside `dest`; only
/// once all of them are written are the top-level entries renamed into place.
/// If any step fails, entries already swapped in are rolled back, so `dest`
/// is left as it was. Returns the installed top-level paths.
pub fn install<A: AsRef<[u8]>>(layers: &[A], dest: &Path) -> Result<Vec<PathBuf>, OciError> {
    fs::create_dir_all(dest)?;
    let staging = tempfile::Builder::new()
        .prefix(".artifactctl-staging-")
        .tempdir_in(dest)?;
    let unpacked = staging.path().join("content");
    let replaced = staging.path().join("replaced");
    fs::create_dir(&unpacked)?;
    fs::create_dir(&replaced)?;

    for layer in layers {
        unpack(layer.as_ref(), &unpacked)?;
    }

    let mut names = fs::read_dir(&unpacked)?
        .map(|entry| entry.map(|e| e.file_name()))
        .collect::<Result<Vec<_>, _>>()?;
    names.sort();

    swap_in(&unpacked, &replaced, dest, &names)
}

/// An entry renamed into the destination, with the backup of what it replaced.
struct Swapped {
    target: PathBuf,
    backup: Option<PathBuf>,
}

fn swap_in(
    unpacked: &Path,
    replaced: &Path,
    dest: &Path,
    names: &[OsString],
) -> Result<Vec<PathBuf>, OciError> {
    let mut swapped = Vec::with_capacity(names.len());
    for name in names {
        match swap_one(&unpacked.join(name), &dest.join(name), &replaced.join(name)) {
            Ok(entry) => {
                debug!(path = %entry.target.display(), "Installed");
                swapped.push(entry);
            }
            Err(e) => {
                roll_back(&swapped);
                return Err(e.into());
            }
        }
    }
    Ok(swapped.into_iter().map(|s| s.target).collect())
}

fn swap_one(staged: &Path, target: &Path, backup: &Path) -> io::Result<Swapped> {
    let had_previous = target.symlink_metadata().is_ok();
    if had_previous {
        fs::rename(target, backup)?;
    }
    if let Err(e) = fs::rename(staged, target) {
        if had_previous {
            fs::rename(backup, target).ok();
        }
        return Err(e);
    }
    Ok(Swapped {
        target: target.to_path_buf(),
        backup: had_previous.then(|| backup.to_path_buf()),
    })
}

fn roll_back(swapped: &[Swapped]) {
    for entry in swapped.iter().rev() {
        if let Err(e) = remove_path(&entry.target) {
            warn!(path = %entry.target.display(), error = %e, "Failed to remove entry during rollback");
            continue;
        }
        if let Some(backup) = &entry.backup {
            if let Err(e) = fs::rename(backup, &entry.target) {
                warn!(path = %entry.target.display(), error = %e, "Failed to restore entry during rollback");
            }
        }
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    if path.symlink_metadata()?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn unpack(archive: &[u8], dir: &Path) -> Result<(), OciError> {
    let mut archive = tar::Archive::new(GzDecoder::new(archive));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        check_entry_path(&path)?;

        let kind = entry.header().entry_type();
        if !(kind.is_file() || kind.is_dir()) {
            return Err(OciError::Extraction(format!(
                "unsupported entry type for `{}`",
                path.display()
            )));
        }
        if !entry.unpack_in(dir)? {
            return Err(OciError::Extraction(format!(
                "entry `{}` escapes the destination",
                path.display()
            )));
        }
    }
    Ok(())
}

fn check_entry_path(path: &Path) -> Result<(), OciError> {
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(OciError::Extraction(format!(
                    "entry `{}` escapes the destination",
                    path.display()
                )));
            }
        }
    }
    if depth == 0 {
        return Err(OciError::Extraction("archive entry with empty path".to_string()));
    }
    Ok(())
}

/// Read the single file an archive holds, if it holds exactly one.
pub fn single_file(archive: &[u8]) -> Result<Option<(String, Vec<u8>)>, OciError> {
    let mut archive = tar::Archive::new(GzDecoder::new(archive));
    let mut found = None;
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        if found.is_some() {
            return Ok(None);
        }
        let path = entry.path()?.to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        found = Some((path, data));
    }
    Ok(found)
}
