//! Annex keys and the pointer files that stand in for annexed content.

use std::fmt;

use sha2::{Digest, Sha256};

/// Prefix of every pointer blob.
const POINTER_PREFIX: &str = "/annex/objects/";

/// Longest extension component carried into a key.
const MAX_EXTENSION_LEN: usize = 4;

/// Number of trailing extension components carried into a key.
const MAX_EXTENSIONS: usize = 2;

/// Content-addressed identifier of an annexed file:
/// `SHA256E-s<size>--<hex digest><extension>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnnexKey(String);

impl AnnexKey {
    /// Key for `data` stored under a file called `filename`.
    pub fn for_content(filename: &str, data: &[u8]) -> Self {
        let hex = format!("{:x}", Sha256::digest(data));
        Self(format!(
            "SHA256E-s{}--{hex}{}",
            data.len(),
            key_extension(filename)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Payload size recorded in the key.
    pub fn size(&self) -> Option<u64> {
        let rest = self.0.split_once("-s")?.1;
        rest.split_once("--")?.0.parse().ok()
    }

    /// The blob committed in place of the content.
    pub fn pointer(&self) -> String {
        format!("{POINTER_PREFIX}{}\n", self.0)
    }

    /// Recognize a pointer blob.
    pub fn from_pointer(blob: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(blob).ok()?;
        let key = text.strip_prefix(POINTER_PREFIX)?.trim_end();
        if key.is_empty() || key.contains(['/', '\n']) {
            return None;
        }
        Some(Self(key.to_string()))
    }

    /// Two-level directory bucketing the key's logs on the `git-annex` branch.
    pub fn hash_dirs(&self) -> String {
        let h = format!("{:x}", Sha256::digest(self.0.as_bytes()));
        format!("{}/{}", &h[..3], &h[3..6])
    }

    /// Location log path on the `git-annex` branch.
    pub fn location_log(&self) -> String {
        format!("{}/{}.log", self.hash_dirs(), self.0)
    }

    /// Web URL log path on the `git-annex` branch.
    pub fn web_log(&self) -> String {
        format!("{}/{}.log.web", self.hash_dirs(), self.0)
    }
}

impl fmt::Display for AnnexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Up to two short alphanumeric trailing extensions, e.g. `.tar.gz`.
fn key_extension(filename: &str) -> String {
    let basename = filename.rsplit('/').next().unwrap_or(filename);
    let mut parts: Vec<&str> = basename.split('.').skip(1).collect();
    parts.reverse();

    let mut kept: Vec<&str> = parts
        .into_iter()
        .take_while(|p| {
            !p.is_empty()
                && p.len() <= MAX_EXTENSION_LEN
                && p.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .take(MAX_EXTENSIONS)
        .collect();
    kept.reverse();

    kept.iter().map(|p| format!(".{p}")).collect()
}
