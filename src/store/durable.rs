//! Durable persistence for [`super::Store`]: a CRC32-checked snapshot plus
//! an append-only WAL of operations since the snapshot.
//!
//! Grounded on the teacher's `storage/log_payload.rs` snapshot+WAL-replay
//! design: a magic-prefixed, checksummed snapshot is loaded first (if
//! present and valid), then the WAL is replayed in full on top of it. Each
//! committed write transaction appends its buffered ops to the WAL and
//! fsyncs before the caller's closure result is returned, so a crash
//! between WAL append and in-memory apply cannot diverge the two: WAL
//! replay is idempotent (last-writer-wins per key).

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use super::{BucketMap, Buckets, WalOp};
use crate::error::{Error, Result};

const SNAPSHOT_MAGIC: &[u8; 4] = b"SMDB";
const SNAPSHOT_VERSION: u8 = 1;
const WAL_FILE_NAME: &str = "store.wal";
const SNAPSHOT_FILE_NAME: &str = "store.snapshot";

pub(crate) struct DurableLog {
    dir: PathBuf,
    wal: Mutex<BufWriter<File>>,
}

impl DurableLog {
    pub(crate) fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let wal_path = dir.join(WAL_FILE_NAME);
        let wal_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&wal_path)?;
        Ok(DurableLog {
            dir: dir.to_path_buf(),
            wal: Mutex::new(BufWriter::new(wal_file)),
        })
    }

    /// Loads the on-disk snapshot (if any and valid) then replays the WAL
    /// on top of it.
    pub(crate) fn replay(&self) -> Result<Buckets> {
        let snapshot_path = self.dir.join(SNAPSHOT_FILE_NAME);
        let mut buckets = if snapshot_path.exists() {
            read_snapshot(&snapshot_path)?
        } else {
            Buckets::new()
        };
        let wal_path = self.dir.join(WAL_FILE_NAME);
        if wal_path.exists() {
            let mut bytes = Vec::new();
            File::open(&wal_path)?.read_to_end(&mut bytes)?;
            let ops = decode_wal_ops(&bytes)?;
            for op in ops {
                apply_op(&mut buckets, op);
            }
        }
        Ok(buckets)
    }

    /// Appends buffered ops from one committed write transaction and
    /// fsyncs before returning.
    pub(crate) fn append(&self, ops: &[WalOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut wal = self.wal.lock();
        for op in ops {
            encode_wal_op(&mut *wal, op)?;
        }
        wal.flush()?;
        wal.get_ref().sync_all()?;
        Ok(())
    }

    /// Flushes any buffered (but not yet fsynced) WAL bytes.
    pub(crate) fn flush(&self) -> Result<()> {
        let mut wal = self.wal.lock();
        wal.flush()?;
        wal.get_ref().sync_all()?;
        Ok(())
    }
}

fn apply_op(buckets: &mut Buckets, op: WalOp) {
    match op {
        WalOp::Put { bucket, key, value } => {
            buckets.entry(bucket).or_default().insert(key, value);
        }
        WalOp::Delete { bucket, key } => {
            if let Some(map) = buckets.get_mut(&bucket) {
                map.remove(&key);
            }
        }
    }
}

fn write_len_prefixed(w: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    w.write_all(&(bytes.len() as u32).to_le_bytes())?;
    w.write_all(bytes)
}

fn read_len_prefixed(r: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

const OP_PUT: u8 = 0;
const OP_DELETE: u8 = 1;

fn encode_wal_op(w: &mut impl Write, op: &WalOp) -> Result<()> {
    match op {
        WalOp::Put { bucket, key, value } => {
            w.write_all(&[OP_PUT])?;
            write_len_prefixed(w, bucket.as_bytes())?;
            write_len_prefixed(w, key)?;
            write_len_prefixed(w, value)?;
        }
        WalOp::Delete { bucket, key } => {
            w.write_all(&[OP_DELETE])?;
            write_len_prefixed(w, bucket.as_bytes())?;
            write_len_prefixed(w, key)?;
        }
    }
    Ok(())
}

fn decode_wal_ops(bytes: &[u8]) -> Result<Vec<WalOp>> {
    let mut cursor = io::Cursor::new(bytes);
    let mut ops = Vec::new();
    loop {
        let mut tag = [0u8; 1];
        match cursor.read_exact(&mut tag) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(Error::Io(e)),
        }
        let bucket = String::from_utf8(read_len_prefixed(&mut cursor)?)
            .map_err(|e| Error::internal(format!("corrupt wal bucket name: {e}")))?;
        let key = read_len_prefixed(&mut cursor)?;
        match tag[0] {
            OP_PUT => {
                let value = read_len_prefixed(&mut cursor)?;
                ops.push(WalOp::Put { bucket, key, value });
            }
            OP_DELETE => {
                ops.push(WalOp::Delete { bucket, key });
            }
            other => {
                return Err(Error::internal(format!("corrupt wal op tag {other}")));
            }
        }
    }
    Ok(ops)
}

/// Writes a CRC32-checked snapshot of `buckets` to `dest`.
pub(crate) fn write_snapshot(dest: &Path, buckets: &Buckets) -> Result<()> {
    let mut body = Vec::new();
    body.write_all(&(buckets.len() as u64).to_le_bytes())?;
    for (name, map) in buckets {
        write_len_prefixed(&mut body, name.as_bytes())?;
        body.write_all(&(map.len() as u64).to_le_bytes())?;
        for (k, v) in map {
            write_len_prefixed(&mut body, k)?;
            write_len_prefixed(&mut body, v)?;
        }
    }
    let mut out = BufWriter::new(File::create(dest)?);
    out.write_all(SNAPSHOT_MAGIC)?;
    out.write_all(&[SNAPSHOT_VERSION])?;
    out.write_all(&body)?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);
    out.write_all(&hasher.finalize().to_le_bytes())?;
    out.flush()?;
    out.get_ref().sync_all()?;
    Ok(())
}

fn read_snapshot(path: &Path) -> Result<Buckets> {
    let mut bytes = Vec::new();
    BufReader::new(File::open(path)?).read_to_end(&mut bytes)?;
    if bytes.len() < 4 + 1 + 4 || &bytes[0..4] != SNAPSHOT_MAGIC {
        return Err(Error::internal("snapshot missing magic header"));
    }
    let version = bytes[4];
    if version != SNAPSHOT_VERSION {
        return Err(Error::internal(format!("unsupported snapshot version {version}")));
    }
    let body_end = bytes.len() - 4;
    let body = &bytes[5..body_end];
    let expected_crc = u32::from_le_bytes(bytes[body_end..].try_into().unwrap());
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    if hasher.finalize() != expected_crc {
        return Err(Error::internal("snapshot checksum mismatch"));
    }

    let mut cursor = io::Cursor::new(body);
    let mut bucket_count_buf = [0u8; 8];
    cursor.read_exact(&mut bucket_count_buf)?;
    let bucket_count = u64::from_le_bytes(bucket_count_buf);
    let mut buckets = Buckets::new();
    for _ in 0..bucket_count {
        let name = String::from_utf8(read_len_prefixed(&mut cursor)?)
            .map_err(|e| Error::internal(format!("corrupt snapshot bucket name: {e}")))?;
        let mut entry_count_buf = [0u8; 8];
        cursor.read_exact(&mut entry_count_buf)?;
        let entry_count = u64::from_le_bytes(entry_count_buf);
        let mut map = BucketMap::new();
        for _ in 0..entry_count {
            let key = read_len_prefixed(&mut cursor)?;
            let value = read_len_prefixed(&mut cursor)?;
            map.insert(key, value);
        }
        buckets.insert(name, map);
    }
    Ok(buckets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut buckets = Buckets::new();
        let mut map = BucketMap::new();
        map.insert(b"k1".to_vec(), b"v1".to_vec());
        buckets.insert("points".to_string(), map);

        let path = dir.path().join("snap.bin");
        write_snapshot(&path, &buckets).unwrap();
        let loaded = read_snapshot(&path).unwrap();
        assert_eq!(loaded, buckets);
    }

    #[test]
    fn corrupted_snapshot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.bin");
        fs::write(&path, b"not a snapshot").unwrap();
        assert!(read_snapshot(&path).is_err());
    }

    #[test]
    fn wal_replay_reconstructs_state_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = DurableLog::open(dir.path()).unwrap();
            log.append(&[WalOp::Put {
                bucket: "points".into(),
                key: b"k1".to_vec(),
                value: b"v1".to_vec(),
            }])
            .unwrap();
        }
        let log = DurableLog::open(dir.path()).unwrap();
        let buckets = log.replay().unwrap();
        assert_eq!(
            buckets.get("points").and_then(|m| m.get(b"k1".as_slice())),
            Some(&b"v1".to_vec())
        );
    }
}
