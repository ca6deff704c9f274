use std::path::Path;

use bytes::Bytes;

/// Read a heap snapshot into one buffer.
///
/// A missing, unreadable or empty file yields `None`; the caller then
/// creates an unseeded instance.
pub fn load_snapshot(path: &Path) -> Option<Bytes> {
    match std::fs::read(path) {
        Ok(data) if data.is_empty() => {
            log::warn!("Snapshot {} is empty, starting unseeded", path.display());
            None
        }
        Ok(data) => {
            log::info!("Loaded snapshot {} ({} bytes)", path.display(), data.len());
            Some(Bytes::from(data))
        }
        Err(err) => {
            log::warn!(
                "Failed to read snapshot {}: {}, starting unseeded",
                path.display(),
                err
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_whole_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"serialized heap").unwrap();

        let bytes = load_snapshot(file.path()).unwrap();
        assert_eq!(&bytes[..], b"serialized heap");
    }

    #[test]
    fn test_missing_or_empty_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_snapshot(&dir.path().join("missing.snap")).is_none());

        let empty = tempfile::NamedTempFile::new().unwrap();
        assert!(load_snapshot(empty.path()).is_none());
    }
}
