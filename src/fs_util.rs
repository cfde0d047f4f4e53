use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use zip::ZipArchive;

use crate::error::KiraError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    Tar,
    Zip,
    Gzip,
    Fasta,
}

impl ArchiveKind {
    /// Detects by file name first, then by magic bytes.
    pub fn detect(path: &Path) -> Result<Self, KiraError> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            return Ok(ArchiveKind::TarGz);
        }
        if name.ends_with(".tar") {
            return Ok(ArchiveKind::Tar);
        }
        if name.ends_with(".zip") {
            return Ok(ArchiveKind::Zip);
        }
        if name.ends_with(".gz") {
            return Ok(ArchiveKind::Gzip);
        }

        let mut head = [0u8; 512];
        let mut file = fs::File::open(path)
            .map_err(|err| KiraError::Filesystem(format!("open {}: {err}", path.display())))?;
        let read = read_up_to(&mut file, &mut head)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let head = &head[..read];
        if head.starts_with(&[0x1f, 0x8b]) {
            return Ok(ArchiveKind::Gzip);
        }
        if head.starts_with(b"PK\x03\x04") {
            return Ok(ArchiveKind::Zip);
        }
        if is_tar_header(head) {
            return Ok(ArchiveKind::Tar);
        }
        if head.first() == Some(&b'>') {
            return Ok(ArchiveKind::Fasta);
        }
        Err(KiraError::FormatError(path.display().to_string()))
    }
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = reader.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

fn is_tar_header(head: &[u8]) -> bool {
    head.len() >= 262 && &head[257..262] == b"ustar"
}

/// Unpacks `archive` into `target_dir`, returning the archive kind that was found.
pub fn unpack(archive: &Path, target_dir: &Path) -> Result<ArchiveKind, KiraError> {
    let kind = ArchiveKind::detect(archive)?;
    fs::create_dir_all(target_dir).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    match kind {
        ArchiveKind::TarGz => {
            let file = fs::File::open(archive)
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
            extract_tar(GzDecoder::new(file), target_dir)?;
        }
        ArchiveKind::Tar => {
            let file = fs::File::open(archive)
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
            extract_tar(file, target_dir)?;
        }
        ArchiveKind::Zip => {
            unpack_zip(archive, target_dir)?;
        }
        ArchiveKind::Gzip => {
            let output = target_dir.join(gunzipped_name(archive));
            gunzip(archive, &output)?;
            if ArchiveKind::detect(&output).ok() == Some(ArchiveKind::Tar) {
                let file = fs::File::open(&output)
                    .map_err(|err| KiraError::Filesystem(err.to_string()))?;
                extract_tar(file, target_dir)?;
                fs::remove_file(&output).map_err(|err| KiraError::Filesystem(err.to_string()))?;
            }
        }
        ArchiveKind::Fasta => {
            let name = archive
                .file_name()
                .ok_or_else(|| KiraError::Filesystem("archive has no file name".to_string()))?;
            fs::copy(archive, target_dir.join(name))
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
    }
    Ok(kind)
}

fn gunzipped_name(path: &Path) -> String {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("download");
    match name.strip_suffix(".gz") {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => format!("{name}.out"),
    }
}

pub fn gunzip(source: &Path, destination: &Path) -> Result<(), KiraError> {
    let file = fs::File::open(source)
        .map_err(|err| KiraError::Filesystem(format!("open {}: {err}", source.display())))?;
    let mut decoder = GzDecoder::new(io::BufReader::new(file));
    let mut out =
        fs::File::create(destination).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    io::copy(&mut decoder, &mut out).map_err(|err| {
        KiraError::FormatError(format!("{}: corrupt gzip stream: {err}", source.display()))
    })?;
    Ok(())
}

fn extract_tar<R: Read>(reader: R, target_dir: &Path) -> Result<(), KiraError> {
    let mut archive = Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let unpacked = entry
            .unpack_in(target_dir)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        if !unpacked {
            return Err(KiraError::Filesystem(
                "tar entry path traversal detected".to_string(),
            ));
        }
    }
    Ok(())
}

fn zip_error(archive: &Path, member: &str, err: impl std::fmt::Display) -> KiraError {
    KiraError::FormatError(format!("{} ({member}): {err}", archive.display()))
}

/// Reads every member once so a truncated or corrupt download fails its CRC
/// check before anything lands in `target_dir`, then extracts. Unix modes are
/// kept so bundled launchers (`picard`, `gatk`) stay executable.
fn unpack_zip(archive_path: &Path, target_dir: &Path) -> Result<(), KiraError> {
    let file = fs::File::open(archive_path).map_err(|err| {
        KiraError::Filesystem(format!("open artifact {}: {err}", archive_path.display()))
    })?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| zip_error(archive_path, "central directory", err))?;

    for index in 0..archive.len() {
        let mut member = archive
            .by_index(index)
            .map_err(|err| zip_error(archive_path, &format!("member {index}"), err))?;
        if member.is_dir() {
            continue;
        }
        let name = member.name().to_string();
        io::copy(&mut member, &mut io::sink()).map_err(|err| zip_error(archive_path, &name, err))?;
    }

    for index in 0..archive.len() {
        let mut member = archive
            .by_index(index)
            .map_err(|err| zip_error(archive_path, &format!("member {index}"), err))?;
        let name = member.name().to_string();
        let Some(relative) = member.enclosed_name() else {
            return Err(KiraError::Filesystem(format!(
                "{}: member {name} escapes the unpack directory",
                archive_path.display()
            )));
        };
        let dest = target_dir.join(relative);
        let io_err = |err: io::Error| KiraError::Filesystem(format!("{}: {err}", dest.display()));

        if member.is_dir() {
            fs::create_dir_all(&dest).map_err(io_err)?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut out = fs::File::create(&dest).map_err(io_err)?;
        io::copy(&mut member, &mut out).map_err(io_err)?;
        #[cfg(unix)]
        if let Some(mode) = member.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dest, fs::Permissions::from_mode(mode & 0o7777)).map_err(io_err)?;
        }
    }
    Ok(())
}

/// Every path below `root`, directories included.
pub fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, KiraError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| KiraError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() && !path.is_symlink() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    items.sort();
    Ok(items)
}

/// If `dir` holds exactly one entry and it is a directory, returns that directory.
/// Release tarballs usually wrap everything in `<name>-<version>/`.
pub fn single_top_level_dir(dir: &Path) -> Result<Option<PathBuf>, KiraError> {
    let entries = fs::read_dir(dir)
        .map_err(|err| KiraError::Filesystem(err.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    if let [only] = entries.as_slice() {
        let path = only.path();
        if path.is_dir() {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

pub fn copy_dir_recursive(source: &Path, dest: &Path) -> Result<(), KiraError> {
    fs::create_dir_all(dest).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    for entry in walk_dir(source)? {
        let relative = entry
            .strip_prefix(source)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let target = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|err| KiraError::Filesystem(err.to_string()))?;
            }
            fs::copy(&entry, &target).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
    }
    Ok(())
}

/// Moves a file or directory, falling back to copy + delete across filesystems.
pub fn move_path(from: &Path, to: &Path) -> Result<(), KiraError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    if from.is_dir() {
        copy_dir_recursive(from, to)?;
        fs::remove_dir_all(from).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    } else {
        fs::copy(from, to).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        fs::remove_file(from).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    }
    Ok(())
}
