//! Release archives unpacked onto the processed branch.

use std::io::Read;
use std::path::{Component, Path};

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::warn;

use harvester_shared::{HarvesterError, Result};

/// Whether `path` names a gzipped tarball.
pub fn is_archive(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.ends_with(".tar.gz") || lower.ends_with(".tgz")
}

/// Regular files of a gzipped tarball as `(relative path, content)`, sorted
/// by path.
///
/// A single top-level directory shared by every member is stripped. Members
/// pointing outside the archive root or into `.git` are skipped.
pub fn extract(data: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let corrupt = |e: std::io::Error| HarvesterError::parse(format!("unreadable archive: {e}"));

    let mut archive = Archive::new(GzDecoder::new(data));
    let mut members: Vec<(Vec<String>, Vec<u8>)> = Vec::new();
    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let raw = entry.path().map_err(corrupt)?.into_owned();
        let Some(parts) = safe_parts(&raw) else {
            warn!(member = %raw.display(), "skipping unsafe archive member");
            continue;
        };
        let mut content = Vec::new();
        entry.read_to_end(&mut content).map_err(corrupt)?;
        members.push((parts, content));
    }
    if members.is_empty() {
        return Err(HarvesterError::parse("archive contains no files"));
    }

    let shared_root = members[0].0.first().cloned().filter(|root| {
        members
            .iter()
            .all(|(parts, _)| parts.len() > 1 && parts.first() == Some(root))
    });
    let skip = usize::from(shared_root.is_some());

    let mut out: Vec<(String, Vec<u8>)> = members
        .into_iter()
        .map(|(parts, content)| (parts[skip..].join("/"), content))
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

fn safe_parts(path: &Path) -> Option<Vec<String>> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    match parts.first().map(String::as_str) {
        None | Some(".git") => None,
        Some(_) => Some(parts),
    }
}
