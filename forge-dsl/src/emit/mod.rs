//! Emitter
//!
//! Serializes the planned artifact into its canonical JSON document and
//! renders the client SDK text. The artifact write is atomic (temp file
//! + rename) so the hot-reload watcher never observes a torn document.

pub mod sdk;

pub use sdk::render_sdk;

use crate::SourceFile;
use forge_core::Artifact;
use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;

/// Hex SHA-256 over every source file (path and contents), in sorted
/// path order. Identical sources always digest identically, which makes
/// compilation reproducible end to end.
pub fn source_digest(files: &[SourceFile]) -> String {
    let mut sorted: Vec<&SourceFile> = files.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let mut hasher = Sha256::new();
    for file in sorted {
        hasher.update(file.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(file.text.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Write the artifact atomically: serialize to a sibling temp file,
/// then rename over the destination.
pub fn write_artifact(artifact: &Artifact, path: &Path) -> io::Result<()> {
    let bytes = artifact
        .to_canonical_json()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_digest_is_order_independent() {
        let a = SourceFile {
            path: "a.forge".to_string(),
            text: "entity A { x: text }".to_string(),
        };
        let b = SourceFile {
            path: "b.forge".to_string(),
            text: "entity B { y: text }".to_string(),
        };
        let forward = source_digest(&[a.clone(), b.clone()]);
        let backward = source_digest(&[b, a]);
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_source_digest_changes_with_content() {
        let a = SourceFile {
            path: "a.forge".to_string(),
            text: "entity A { x: text }".to_string(),
        };
        let mut b = a.clone();
        b.text.push(' ');
        assert_ne!(source_digest(&[a]), source_digest(&[b]));
    }

    #[test]
    fn test_write_artifact_atomic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.artifact.json");

        let output = crate::compile(&[SourceFile {
            path: "app.forge".to_string(),
            text: "entity Ticket { subject: text } access Ticket { read: true write: true }"
                .to_string(),
        }])
        .expect("compile");

        write_artifact(&output.artifact, &path).expect("write");
        let bytes = std::fs::read(&path).expect("read back");
        let loaded = Artifact::from_json(&bytes).expect("parse");
        assert_eq!(loaded, output.artifact);
        // No temp file left behind.
        assert!(!dir.path().join("app.artifact.json.tmp").exists());
    }
}
