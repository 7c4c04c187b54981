//! On-disk directory layout and small file helpers.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Manages the on-disk directory layout of an engine.
///
/// The layout follows this structure:
/// ```text
/// <base_dir>/
///     streams/
///         <stream>.jsonl              -- one StoredEvent per line
///     snapshots/
///         <stream>.json               -- latest Snapshot
///     projections/
///         <name>/checkpoint.json
///     sagas/
///         <name>/checkpoint.json
///         <name>/dead_letters.jsonl
/// ```
///
/// Stream ids and names are encoded with [`encode_name`] before they are
/// used as file names. `StorageLayout` is cheap to clone.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a layout rooted at `base_dir`. Nothing is created on disk.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the root directory of this layout.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base_dir>/streams`
    pub fn streams_dir(&self) -> PathBuf {
        self.base_dir.join("streams")
    }

    /// `<base_dir>/streams/<encoded stream>.jsonl`
    pub fn stream_file(&self, stream_id: &str) -> PathBuf {
        self.streams_dir()
            .join(format!("{}.jsonl", encode_name(stream_id)))
    }

    /// `<base_dir>/snapshots/<encoded stream>.json`
    pub fn snapshot_file(&self, stream_id: &str) -> PathBuf {
        self.base_dir
            .join("snapshots")
            .join(format!("{}.json", encode_name(stream_id)))
    }

    /// `<base_dir>/projections/<encoded name>`
    pub fn projection_dir(&self, name: &str) -> PathBuf {
        self.base_dir.join("projections").join(encode_name(name))
    }

    /// `<base_dir>/sagas/<encoded name>`
    pub fn saga_dir(&self, name: &str) -> PathBuf {
        self.base_dir.join("sagas").join(encode_name(name))
    }
}

/// Encode an identifier into a portable file name.
///
/// Bytes outside `[A-Za-z0-9._-]` become `%XX`. The encoding is reversible
/// with [`decode_name`], so recovery can map files back to stream ids.
pub fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Reverse [`encode_name`].
///
/// # Returns
///
/// `None` for names `encode_name` could not have produced, including
/// lowercase or needless escapes such as `a%2fb` or `%41`. Every decoded
/// name therefore maps back to the file it was read from.
pub fn decode_name(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    let decoded = String::from_utf8(out).ok()?;
    (encode_name(&decoded) == encoded).then_some(decoded)
}

/// Serialize `value` as pretty JSON and write it atomically.
///
/// Writes to `<path>.tmp`, syncs, then renames over `path`, so readers
/// never observe a partially written file. Creates parent directories.
///
/// # Errors
///
/// Returns `io::Error` if serialization, writing, or renaming fails.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_atomic(path, &json)
}

/// Write raw bytes atomically via temp file and rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_data()?;
    }
    fs::rename(&tmp_path, path)
}

/// Load a JSON record, treating a corrupt file as absent.
///
/// `what` names the record in the warning logged for a corrupt file.
///
/// # Returns
///
/// - `Ok(Some(value))` if the file exists and deserializes.
/// - `Ok(None)` if it does not exist or holds invalid JSON.
///
/// # Errors
///
/// Returns `io::Error` for I/O failures other than file-not-found.
pub(crate) fn read_json_lenient<T: DeserializeOwned>(
    path: &Path,
    what: &str,
) -> io::Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "corrupt {what}, ignoring it"
            );
            Ok(None)
        }
    }
}

/// Append one JSON line to a log file, creating it if needed.
pub(crate) fn append_json_line<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let json = serde_json::to_string(value).map_err(io::Error::other)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{json}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn path_helpers_correct() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let layout = StorageLayout::new(tmp.path());

        assert_eq!(layout.base_dir(), tmp.path());
        assert_eq!(layout.stream_file("A1"), tmp.path().join("streams/A1.jsonl"));
        assert_eq!(
            layout.snapshot_file("A1"),
            tmp.path().join("snapshots/A1.json")
        );
        assert_eq!(
            layout.projection_dir("all-entities"),
            tmp.path().join("projections/all-entities")
        );
        assert_eq!(layout.saga_dir("welcome"), tmp.path().join("sagas/welcome"));
    }

    #[test]
    fn encode_escapes_path_separators() {
        assert_eq!(encode_name("order/42"), "order%2F42");
        assert_eq!(encode_name("a b"), "a%20b");
        assert_eq!(encode_name("plain-id_1.x"), "plain-id_1.x");
    }

    #[test]
    fn decode_reverses_encode() {
        for name in ["order/42", "ünïcode", "..", "a%b", "tenant:7/user 3"] {
            assert_eq!(decode_name(&encode_name(name)).as_deref(), Some(name));
        }
    }

    #[test]
    fn decode_rejects_truncated_escape() {
        assert_eq!(decode_name("abc%2"), None);
        assert_eq!(decode_name("abc%zz"), None);
    }

    #[test]
    fn decode_rejects_non_canonical_escapes() {
        assert_eq!(decode_name("a%2Fb").as_deref(), Some("a/b"));
        assert_eq!(decode_name("a%2fb"), None);
        assert_eq!(decode_name("%41"), None);
        assert_eq!(decode_name("a%2D"), None);
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let path = tmp.path().join("nested/dir/record.json");

        write_json_atomic(&path, &serde_json::json!({ "a": 1 })).expect("write should succeed");

        assert!(path.exists());
        assert!(!tmp.path().join("nested/dir/record.json.tmp").exists());
        let loaded: Option<serde_json::Value> =
            read_json_lenient(&path, "record").expect("read should succeed");
        assert_eq!(loaded, Some(serde_json::json!({ "a": 1 })));
    }

    #[test]
    fn lenient_read_treats_corrupt_file_as_missing() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let path = tmp.path().join("record.json");
        fs::write(&path, "not valid json!!!").expect("write should succeed");

        let loaded: Option<serde_json::Value> =
            read_json_lenient(&path, "record").expect("read should not error");
        assert!(loaded.is_none());

        let missing: Option<serde_json::Value> =
            read_json_lenient(&tmp.path().join("absent.json"), "record")
                .expect("read should not error");
        assert!(missing.is_none());
    }

    #[test]
    fn json_lines_append_in_order() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let path = tmp.path().join("log/dead.jsonl");
        append_json_line(&path, &1).expect("append should succeed");
        append_json_line(&path, &2).expect("append should succeed");
        let contents = fs::read_to_string(&path).expect("read should succeed");
        assert_eq!(contents, "1\n2\n");
    }
}
