use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use serde_json::Value;
use tracing::{debug, warn};

use crate::document::{self, Document};
use crate::error::StoreError;
use crate::store::{self, DocumentStore, StoreResult};

const DATA_EXT: &str = "dat";
const HEADER_LEN: usize = 8;

/// Directory-backed store: one data file per collection.
///
/// Record format: [length: u32 LE][crc32: u32 LE][payload]
/// - payload is the document serialized as JSON
/// - crc32 covers the payload bytes
///
/// `replace_all` writes the complete new file next to the old one, fsyncs it
/// and renames it into place, so a reader holding the old file keeps reading
/// the old contents and a failed write never touches the live file.
pub struct FileStore {
    data_dir: PathBuf,
}

impl FileStore {
    /// Open or create a store rooted at `data_dir`.
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        fs::create_dir_all(data_dir)?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.data_dir
    }

    fn data_path(&self, collection: &str) -> PathBuf {
        self.data_dir.join(format!("{collection}.{DATA_EXT}"))
    }

    fn temp_path(&self, collection: &str) -> PathBuf {
        let suffix: u64 = rand::random();
        self.data_dir
            .join(format!("{collection}.{DATA_EXT}.{suffix:016x}.tmp"))
    }

    fn validate(collection: &str) -> StoreResult<()> {
        store::validate_name(collection)?;
        if collection.starts_with('.')
            || collection.contains(['/', '\\', '\0'])
        {
            return Err(StoreError::InvalidName(collection.to_string()));
        }
        Ok(())
    }

    fn write_file(path: &Path, docs: &[Document]) -> StoreResult<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::with_capacity(256 * 1024, file);
        for doc in docs {
            let payload = serde_json::to_vec(doc)?;
            write_record(&mut writer, &payload)?;
        }
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }

    /// Persist the rename itself.
    fn sync_dir(&self) -> io::Result<()> {
        #[cfg(unix)]
        {
            File::open(&self.data_dir)?.sync_all()?;
        }
        Ok(())
    }
}

fn write_record<W: Write>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    w.write_all(&(payload.len() as u32).to_le_bytes())?;
    w.write_all(&hasher.finalize().to_le_bytes())?;
    w.write_all(payload)
}

/// Fill `buf` completely, or report a clean end of file if nothing was read.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    if filled == 0 {
        return Ok(false);
    }
    if filled < buf.len() {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    Ok(true)
}

impl DocumentStore for FileStore {
    fn read_all(&self, collection: &str) -> StoreResult<Vec<Document>> {
        Self::validate(collection)?;
        let file = match File::open(self.data_path(collection)) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::CollectionNotFound(collection.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata()?.len();
        let corrupt = |offset| StoreError::Corrupt {
            collection: collection.to_string(),
            offset,
        };

        let mut reader = BufReader::with_capacity(256 * 1024, file);
        let mut docs = Vec::new();
        let mut offset = 0u64;
        let mut header = [0u8; HEADER_LEN];
        let mut payload = Vec::with_capacity(4096);

        loop {
            match read_full(&mut reader, &mut header) {
                Ok(false) => break,
                Ok(true) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(corrupt(offset)),
                Err(e) => return Err(e.into()),
            }
            let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            let remaining = file_len.saturating_sub(offset + HEADER_LEN as u64);
            if length as u64 > remaining {
                warn!(collection, offset, length, remaining, "record length past end of file");
                return Err(corrupt(offset));
            }

            payload.resize(length, 0);
            match read_full(&mut reader, &mut payload) {
                Ok(true) => {}
                Ok(false) if length == 0 => {}
                Ok(false) => return Err(corrupt(offset)),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(corrupt(offset)),
                Err(e) => return Err(e.into()),
            }

            let mut hasher = Hasher::new();
            hasher.update(&payload);
            if hasher.finalize() != crc {
                warn!(collection, offset, "checksum mismatch");
                return Err(corrupt(offset));
            }

            let value: Value = serde_json::from_slice(&payload)?;
            docs.push(document::into_document(value)?);
            offset += (HEADER_LEN + length) as u64;
        }

        Ok(docs)
    }

    fn replace_all(&self, collection: &str, docs: Vec<Document>) -> StoreResult<()> {
        Self::validate(collection)?;
        let tmp_path = self.temp_path(collection);

        let swapped = Self::write_file(&tmp_path, &docs)
            .and_then(|()| {
                fs::rename(&tmp_path, self.data_path(collection)).map_err(StoreError::from)
            });
        if let Err(e) = swapped {
            if let Err(cleanup) = fs::remove_file(&tmp_path) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!(
                        path = %tmp_path.display(),
                        error = %cleanup,
                        "failed to remove temp file"
                    );
                }
            }
            return Err(e);
        }
        self.sync_dir()?;

        debug!(collection, count = docs.len(), "replaced collection file");
        Ok(())
    }

    fn list_collections(&self) -> StoreResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(DATA_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn drop_collection(&self, collection: &str) -> StoreResult<bool> {
        Self::validate(collection)?;
        match fs::remove_file(self.data_path(collection)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn docs(values: Vec<Value>) -> Vec<Document> {
        values
            .into_iter()
            .map(|v| document::into_document(v).unwrap())
            .collect()
    }

    fn temp_files(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .path()
                    .extension()
                    .is_some_and(|x| x == "tmp")
            })
            .count()
    }

    #[test]
    fn replace_and_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let input = docs(vec![
            json!({"comicID": 1, "title": "A", "tags": ["x"]}),
            json!({"comicID": 2, "nested": {"b": 1, "a": 2}}),
        ]);
        store.replace_all("comics", input.clone()).unwrap();
        let read = store.read_all("comics").unwrap();
        assert_eq!(read, input);
        let keys: Vec<&String> = read[1]["nested"].as_object().unwrap().keys().collect();
        assert_eq!(keys, ["b", "a"]);
    }

    #[test]
    fn missing_and_empty_are_distinct() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.read_all("comics"),
            Err(StoreError::CollectionNotFound(_))
        ));
        store.replace_all("comics", Vec::new()).unwrap();
        assert!(store.read_all("comics").unwrap().is_empty());
    }

    #[test]
    fn reopen_preserves_data() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.replace_all("c", docs(vec![json!({"a": 1})])).unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.read_all("c").unwrap(), docs(vec![json!({"a": 1})]));
        assert_eq!(store.list_collections().unwrap(), vec!["c"]);
    }

    #[test]
    fn failed_replace_cleans_up_and_keeps_target() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        // A directory where the data file should go makes the rename fail.
        fs::create_dir(dir.path().join("blocked.dat")).unwrap();
        fs::write(dir.path().join("blocked.dat").join("keep"), b"x").unwrap();

        let err = store
            .replace_all("blocked", docs(vec![json!({"a": 1})]))
            .unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert_eq!(temp_files(dir.path()), 0);
        assert!(dir.path().join("blocked.dat").join("keep").exists());
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store
            .replace_all("c", docs(vec![json!({"a": 1}), json!({"b": 2})]))
            .unwrap();
        let path = dir.path().join("c.dat");
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let err = store.read_all("c").unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { offset, .. } if offset > 0));
    }

    #[test]
    fn oversized_length_header_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store
            .replace_all("c", docs(vec![json!({"a": 1}), json!({"b": 2})]))
            .unwrap();
        let path = dir.path().join("c.dat");
        let mut bytes = fs::read(&path).unwrap();
        let second = HEADER_LEN + br#"{"a":1}"#.len();
        bytes[second..second + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        fs::write(&path, &bytes).unwrap();

        let err = store.read_all("c").unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { offset, .. } if offset == second as u64));
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.replace_all("c", docs(vec![json!({"a": 1})])).unwrap();
        let path = dir.path().join("c.dat");
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0x01;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            store.read_all("c"),
            Err(StoreError::Corrupt { offset: 0, .. })
        ));
    }

    #[test]
    fn rejects_path_like_names() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        for name in ["", "../x", "a/b", ".hidden"] {
            assert!(matches!(
                store.replace_all(name, Vec::new()),
                Err(StoreError::InvalidName(_))
            ));
        }
    }

    #[test]
    fn drop_collection_removes_file() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.replace_all("c", Vec::new()).unwrap();
        assert!(store.drop_collection("c").unwrap());
        assert!(!store.drop_collection("c").unwrap());
        assert!(store.list_collections().unwrap().is_empty());
    }
}
