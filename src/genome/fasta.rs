use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::KiraError;

fn invalid(path: &Path, message: impl Into<String>) -> KiraError {
    KiraError::InvalidFasta {
        path: path.display().to_string(),
        message: message.into(),
    }
}

/// True when the first non-blank byte of the file is `>`.
pub fn is_fasta(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    let mut head = Vec::with_capacity(256);
    if file.take(256).read_to_end(&mut head).is_err() {
        return false;
    }
    head.iter()
        .find(|byte| !byte.is_ascii_whitespace())
        .is_some_and(|byte| *byte == b'>')
}

/// Record name from a header line: the first word after `>`.
pub fn record_name(header: &str) -> Option<&str> {
    header
        .strip_prefix('>')?
        .split_whitespace()
        .next()
        .filter(|name| !name.is_empty())
}

fn file_stem_for(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// Writes each record of `source` to `<out_dir>/<n>-<record>.fa`, where `n`
/// counts records across every call sharing `seen`. Returns
/// `(record name, path)` pairs in file order.
pub fn split_records(
    source: &Path,
    out_dir: &Path,
    seen: &mut HashSet<String>,
) -> Result<Vec<(String, PathBuf)>, KiraError> {
    fs::create_dir_all(out_dir).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    let reader = BufReader::new(
        File::open(source).map_err(|err| KiraError::Filesystem(err.to_string()))?,
    );
    let mut records = Vec::new();
    let mut writer: Option<BufWriter<File>> = None;
    for line in reader.lines() {
        let line = line.map_err(|err| invalid(source, err.to_string()))?;
        let line = line.trim_end_matches('\r');
        if line.starts_with('>') {
            let name = record_name(line)
                .ok_or_else(|| invalid(source, "header without a record name"))?
                .to_string();
            if !seen.insert(name.clone()) {
                return Err(invalid(source, format!("duplicate record {name}")));
            }
            if let Some(mut previous) = writer.take() {
                previous
                    .flush()
                    .map_err(|err| KiraError::Filesystem(err.to_string()))?;
            }
            let path = out_dir.join(format!("{:06}-{}.fa", seen.len(), file_stem_for(&name)));
            let file = File::create(&path).map_err(|err| KiraError::Filesystem(err.to_string()))?;
            let mut next = BufWriter::new(file);
            writeln!(next, ">{name}").map_err(|err| KiraError::Filesystem(err.to_string()))?;
            writer = Some(next);
            records.push((name, path));
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }
        let Some(current) = writer.as_mut() else {
            return Err(invalid(source, "sequence data before the first header"));
        };
        writeln!(current, "{line}").map_err(|err| KiraError::Filesystem(err.to_string()))?;
    }
    if let Some(mut last) = writer {
        last.flush()
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    }
    Ok(records)
}

/// Concatenates record files into `dest`, written under a temporary name and
/// renamed into place.
pub fn concat(parts: &[PathBuf], dest: &Path) -> Result<(), KiraError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    }
    let tmp = dest.with_extension("fa.tmp");
    {
        let file = File::create(&tmp).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let mut out = BufWriter::new(file);
        for part in parts {
            let mut input =
                File::open(part).map_err(|err| KiraError::Filesystem(err.to_string()))?;
            std::io::copy(&mut input, &mut out)
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
        out.flush()
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    }
    fs::rename(&tmp, dest).map_err(|err| KiraError::Filesystem(err.to_string()))
}

fn is_residue(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || matches!(byte, b'*' | b'-')
}

/// Checks that the file is non-empty FASTA with residues only, and returns the
/// number of records.
pub fn validate(path: &Path) -> Result<usize, KiraError> {
    let reader = BufReader::new(File::open(path).map_err(|err| invalid(path, err.to_string()))?);
    let mut records = 0usize;
    let mut residues = 0u64;
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|err| invalid(path, err.to_string()))?;
        let line = line.trim_end_matches('\r');
        if line.starts_with('>') {
            if record_name(line).is_none() {
                return Err(invalid(path, format!("line {}: empty header", idx + 1)));
            }
            records += 1;
            continue;
        }
        if records == 0 {
            if line.trim().is_empty() {
                continue;
            }
            return Err(invalid(path, "missing leading header"));
        }
        if let Some(bad) = line.bytes().find(|byte| !is_residue(*byte)) {
            return Err(invalid(
                path,
                format!("line {}: unexpected character {:?}", idx + 1, bad as char),
            ));
        }
        residues += line.len() as u64;
    }
    if records == 0 || residues == 0 {
        return Err(invalid(path, "no sequence records"));
    }
    Ok(records)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaiEntry {
    pub name: String,
    pub length: u64,
    pub offset: u64,
    pub line_bases: u64,
    pub line_width: u64,
}

/// Computes samtools-compatible `.fai` entries.
pub fn fai_entries(path: &Path) -> Result<Vec<FaiEntry>, KiraError> {
    let mut reader =
        BufReader::new(File::open(path).map_err(|err| invalid(path, err.to_string()))?);
    let mut entries: Vec<FaiEntry> = Vec::new();
    let mut position = 0u64;
    let mut buf = Vec::new();
    // Set once a short line has been seen in the current record.
    let mut closed = false;
    loop {
        buf.clear();
        let read = reader
            .read_until(b'\n', &mut buf)
            .map_err(|err| invalid(path, err.to_string()))?;
        if read == 0 {
            break;
        }
        let start = position;
        position += read as u64;
        let content = trim_eol(&buf);

        if content.first() == Some(&b'>') {
            let header = String::from_utf8_lossy(content);
            let name = record_name(&header)
                .ok_or_else(|| invalid(path, "empty header"))?
                .to_string();
            entries.push(FaiEntry {
                name,
                length: 0,
                offset: position,
                line_bases: 0,
                line_width: 0,
            });
            closed = false;
            continue;
        }
        let Some(entry) = entries.last_mut() else {
            if content.is_empty() {
                continue;
            }
            return Err(invalid(path, "sequence data before the first header"));
        };
        if content.is_empty() {
            closed = true;
            continue;
        }
        let bases = content.len() as u64;
        let width = read as u64;
        if entry.line_bases == 0 {
            entry.offset = start;
            entry.line_bases = bases;
            entry.line_width = width;
        } else if closed || bases > entry.line_bases {
            return Err(invalid(
                path,
                format!("record {} has uneven line lengths", entry.name),
            ));
        } else if bases < entry.line_bases {
            closed = true;
        }
        entry.length += bases;
    }
    Ok(entries)
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &line[..end]
}

pub fn write_fai(fasta: &Path, fai: &Path) -> Result<usize, KiraError> {
    let entries = fai_entries(fasta)?;
    let mut content = String::new();
    for entry in &entries {
        content.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\n",
            entry.name, entry.length, entry.offset, entry.line_bases, entry.line_width
        ));
    }
    let tmp = fai.with_extension("fai.tmp");
    fs::write(&tmp, content).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    fs::rename(&tmp, fai).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    Ok(entries.len())
}

/// Copies `source` to `dest`, replacing soft-masked (lowercase) bases with `N`.
pub fn hard_mask(source: &Path, dest: &Path) -> Result<(), KiraError> {
    let reader = BufReader::new(File::open(source).map_err(|err| invalid(source, err.to_string()))?);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    }
    let tmp = dest.with_extension("fa.tmp");
    {
        let file = File::create(&tmp).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let mut out = BufWriter::new(file);
        for line in reader.lines() {
            let line = line.map_err(|err| invalid(source, err.to_string()))?;
            let masked = if line.starts_with('>') {
                line
            } else {
                line.chars()
                    .map(|ch| if ch.is_ascii_lowercase() { 'N' } else { ch })
                    .collect()
            };
            writeln!(out, "{masked}").map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
        out.flush()
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    }
    fs::rename(&tmp, dest).map_err(|err| KiraError::Filesystem(err.to_string()))
}
