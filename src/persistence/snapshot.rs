//! Snapshot Codec
//!
//! Binary point-in-time encoding of a keyspace. The same encoding is used for
//! standalone snapshot files (`SAVE`, `BGSAVE`) and as the preamble of a
//! rewritten append-only log.
//!
//! # Format
//!
//! ```text
//! +-------------------------+
//! | Magic (6B)              |  "TIDEKV"
//! +-------------------------+
//! | Version (4B)            |  u32
//! +-------------------------+
//! | 0xFA key value          |  aux fields, repeated
//! +-------------------------+
//! | 0xFE db                 |  per non-empty database:
//! | 0xFB keys ttl_keys      |    u32 index, u32 counts
//! | [0xFC expire_ms] type   |    per key: optional u64 deadline,
//! |   key payload           |    type byte, key, payload
//! +-------------------------+
//! | 0xFF                    |  end of data
//! +-------------------------+
//! | Checksum (4B)           |  CRC32 of all preceding bytes
//! +-------------------------+
//! ```
//!
//! All integers are little endian. Byte strings are a u32 length followed by
//! the bytes. Sorted set scores are f64.

use crate::error::{PersistError, PersistResult};
use crate::storage::{unix_ms, Entity, Keyspace, SortedSet};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use crc32fast::Hasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::io::{self, Cursor, ErrorKind, Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, info};

pub const MAGIC: &[u8; 6] = b"TIDEKV";
pub const VERSION: u32 = 1;

const OP_AUX: u8 = 0xFA;
const OP_RESIZE_DB: u8 = 0xFB;
const OP_EXPIRE_MS: u8 = 0xFC;
const OP_SELECT_DB: u8 = 0xFE;
const OP_EOF: u8 = 0xFF;

const TYPE_STRING: u8 = 0;
const TYPE_LIST: u8 = 1;
const TYPE_SET: u8 = 2;
const TYPE_ZSET: u8 = 3;
const TYPE_HASH: u8 = 4;

/// True if `data` starts with the snapshot magic.
pub fn has_magic(data: &[u8]) -> bool {
    data.starts_with(MAGIC)
}

/// Writer that hashes everything passing through it.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Hasher,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn write_bytes<W: Write>(w: &mut W, data: &[u8]) -> io::Result<()> {
    w.write_u32::<LittleEndian>(data.len() as u32)?;
    w.write_all(data)
}

fn write_entity<W: Write>(w: &mut W, key: &[u8], entity: &Entity) -> io::Result<()> {
    match entity {
        Entity::String(value) => {
            w.write_u8(TYPE_STRING)?;
            write_bytes(w, key)?;
            write_bytes(w, value)
        }
        Entity::List(items) => {
            w.write_u8(TYPE_LIST)?;
            write_bytes(w, key)?;
            w.write_u32::<LittleEndian>(items.len() as u32)?;
            items.iter().try_for_each(|item| write_bytes(w, item))
        }
        Entity::Set(members) => {
            w.write_u8(TYPE_SET)?;
            write_bytes(w, key)?;
            w.write_u32::<LittleEndian>(members.len() as u32)?;
            members.iter().try_for_each(|member| write_bytes(w, member))
        }
        Entity::ZSet(zset) => {
            w.write_u8(TYPE_ZSET)?;
            write_bytes(w, key)?;
            w.write_u32::<LittleEndian>(zset.len() as u32)?;
            for (member, score) in zset.iter() {
                write_bytes(w, member)?;
                w.write_f64::<LittleEndian>(score)?;
            }
            Ok(())
        }
        Entity::Hash(map) => {
            w.write_u8(TYPE_HASH)?;
            write_bytes(w, key)?;
            w.write_u32::<LittleEndian>(map.len() as u32)?;
            for (field, value) in map {
                write_bytes(w, field)?;
                write_bytes(w, value)?;
            }
            Ok(())
        }
    }
}

/// Encodes every database of `keyspace` into `writer`.
///
/// Each database is read under its shard read locks, one database at a time.
/// Returns the number of keys written.
pub fn write_keyspace<W: Write>(keyspace: &Keyspace, writer: W, preamble: bool) -> PersistResult<usize> {
    let mut w = HashingWriter {
        inner: writer,
        hasher: Hasher::new(),
    };
    w.write_all(MAGIC)?;
    w.write_u32::<LittleEndian>(VERSION)?;

    let ctime = (unix_ms() / 1000).to_string();
    let aux = [
        ("tidekv-ver", crate::VERSION),
        ("tidekv-bits", "64"),
        ("ctime", ctime.as_str()),
        ("aof-preamble", if preamble { "1" } else { "0" }),
    ];
    for (key, value) in aux {
        w.write_u8(OP_AUX)?;
        write_bytes(&mut w, key.as_bytes())?;
        write_bytes(&mut w, value.as_bytes())?;
    }

    let mut total = 0;
    for db in keyspace.databases() {
        let mut body = Vec::new();
        let mut keys = 0u32;
        let mut ttl_keys = 0u32;
        let mut result = Ok(());
        {
            let locked = db.lock_all(false);
            locked.for_each(|key, entity, expire_at| {
                if result.is_err() {
                    return;
                }
                keys += 1;
                if let Some(at) = expire_at {
                    ttl_keys += 1;
                    result = body
                        .write_u8(OP_EXPIRE_MS)
                        .and_then(|_| body.write_u64::<LittleEndian>(at));
                }
                if result.is_ok() {
                    result = write_entity(&mut body, key, entity);
                }
            });
        }
        result?;
        if keys == 0 {
            continue;
        }

        w.write_u8(OP_SELECT_DB)?;
        w.write_u32::<LittleEndian>(db.index() as u32)?;
        w.write_u8(OP_RESIZE_DB)?;
        w.write_u32::<LittleEndian>(keys)?;
        w.write_u32::<LittleEndian>(ttl_keys)?;
        w.write_all(&body)?;
        total += keys as usize;
    }

    w.write_u8(OP_EOF)?;
    let checksum = w.hasher.clone().finalize();
    w.inner.write_u32::<LittleEndian>(checksum)?;
    w.inner.flush()?;
    Ok(total)
}

/// Encodes `keyspace` into a byte vector.
pub fn encode_keyspace(keyspace: &Keyspace, preamble: bool) -> PersistResult<Vec<u8>> {
    let mut buf = Vec::new();
    write_keyspace(keyspace, &mut buf, preamble)?;
    Ok(buf)
}

/// One key decoded from a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    pub db: usize,
    pub key: Bytes,
    pub entity: Entity,
    pub expire_at: Option<u64>,
}

/// Summary of a decoded snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Bytes consumed, including the checksum
    pub consumed: usize,
    pub keys: usize,
    pub aux: Vec<(String, String)>,
}

impl SnapshotInfo {
    pub fn aux_value(&self, key: &str) -> Option<&str> {
        self.aux
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

fn corrupt(e: io::Error) -> PersistError {
    if e.kind() == ErrorKind::UnexpectedEof {
        PersistError::CorruptSnapshot("unexpected end of data".to_string())
    } else {
        PersistError::Io(e)
    }
}

fn read_bytes(r: &mut Cursor<&[u8]>) -> PersistResult<Bytes> {
    let len = r.read_u32::<LittleEndian>().map_err(corrupt)? as usize;
    let remaining = r.get_ref().len() - r.position() as usize;
    if len > remaining {
        return Err(PersistError::CorruptSnapshot(format!(
            "string of {} bytes exceeds the {} remaining",
            len, remaining
        )));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(corrupt)?;
    Ok(Bytes::from(buf))
}

fn read_string(r: &mut Cursor<&[u8]>) -> PersistResult<String> {
    let bytes = read_bytes(r)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| PersistError::CorruptSnapshot("aux field is not UTF-8".to_string()))
}

fn read_count(r: &mut Cursor<&[u8]>) -> PersistResult<usize> {
    Ok(r.read_u32::<LittleEndian>().map_err(corrupt)? as usize)
}

fn read_entity(r: &mut Cursor<&[u8]>, type_byte: u8) -> PersistResult<Entity> {
    Ok(match type_byte {
        TYPE_STRING => Entity::String(read_bytes(r)?),
        TYPE_LIST => {
            let n = read_count(r)?;
            let mut items = VecDeque::new();
            for _ in 0..n {
                items.push_back(read_bytes(r)?);
            }
            Entity::List(items)
        }
        TYPE_SET => {
            let n = read_count(r)?;
            let mut members = HashSet::new();
            for _ in 0..n {
                members.insert(read_bytes(r)?);
            }
            Entity::Set(members)
        }
        TYPE_ZSET => {
            let n = read_count(r)?;
            let mut zset = SortedSet::new();
            for _ in 0..n {
                let member = read_bytes(r)?;
                let score = r.read_f64::<LittleEndian>().map_err(corrupt)?;
                zset.insert(member, score);
            }
            Entity::ZSet(zset)
        }
        TYPE_HASH => {
            let n = read_count(r)?;
            let mut map = HashMap::new();
            for _ in 0..n {
                let field = read_bytes(r)?;
                let value = read_bytes(r)?;
                map.insert(field, value);
            }
            Entity::Hash(map)
        }
        other => {
            return Err(PersistError::CorruptSnapshot(format!(
                "unknown value type {}",
                other
            )))
        }
    })
}

/// Decodes a snapshot at the start of `data`, passing each key to `visit`.
///
/// Bytes after the checksum are ignored; [`SnapshotInfo::consumed`] tells the
/// caller where they start.
pub fn decode<F>(data: &[u8], mut visit: F) -> PersistResult<SnapshotInfo>
where
    F: FnMut(SnapshotRecord) -> PersistResult<()>,
{
    if !has_magic(data) {
        return Err(PersistError::CorruptSnapshot("missing magic".to_string()));
    }
    let mut r = Cursor::new(data);
    r.set_position(MAGIC.len() as u64);
    let version = r.read_u32::<LittleEndian>().map_err(corrupt)?;
    if version != VERSION {
        return Err(PersistError::UnsupportedVersion(version));
    }

    let mut info = SnapshotInfo::default();
    let mut db = 0usize;
    let mut expire_at = None;

    loop {
        let op = r.read_u8().map_err(corrupt)?;
        match op {
            OP_AUX => {
                let key = read_string(&mut r)?;
                let value = read_string(&mut r)?;
                info.aux.push((key, value));
            }
            OP_SELECT_DB => {
                db = r.read_u32::<LittleEndian>().map_err(corrupt)? as usize;
            }
            OP_RESIZE_DB => {
                let _keys = read_count(&mut r)?;
                let _ttl_keys = read_count(&mut r)?;
            }
            OP_EXPIRE_MS => {
                expire_at = Some(r.read_u64::<LittleEndian>().map_err(corrupt)?);
            }
            OP_EOF => break,
            type_byte => {
                let key = read_bytes(&mut r)?;
                let entity = read_entity(&mut r, type_byte)?;
                visit(SnapshotRecord {
                    db,
                    key,
                    entity,
                    expire_at: expire_at.take(),
                })?;
                info.keys += 1;
            }
        }
    }

    let body_len = r.position() as usize;
    let stored = r.read_u32::<LittleEndian>().map_err(corrupt)?;
    let computed = crc32fast::hash(&data[..body_len]);
    if stored != computed {
        return Err(PersistError::ChecksumMismatch { stored, computed });
    }
    info.consumed = body_len + 4;
    Ok(info)
}

/// Writes a standalone snapshot of `keyspace` to `path`.
///
/// The snapshot is written to a temporary file in the same directory and
/// renamed over `path`, so a crash never leaves a partial file behind.
pub fn save(keyspace: &Keyspace, path: &Path) -> PersistResult<usize> {
    let data = encode_keyspace(keyspace, false)?;
    let keys = write_atomically(path, &data)?;
    info!(path = %path.display(), keys, bytes = data.len(), "Snapshot saved");
    Ok(keys)
}

/// Writes already encoded snapshot bytes to `path` via temp file and rename.
pub fn write_atomically(path: &Path, data: &[u8]) -> PersistResult<usize> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| PersistError::Io(e.error))?;
    Ok(data.len())
}

/// Loads a standalone snapshot into `keyspace`.
///
/// Returns `None` if the file does not exist. With `emit`, every restored key
/// is re-emitted to the append-only log.
pub fn load(path: &Path, keyspace: &Keyspace, emit: bool) -> PersistResult<Option<SnapshotInfo>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    // Nothing is installed (or logged) until the checksum has been verified.
    let mut records = Vec::new();
    let info = decode(&data, |record| {
        records.push(record);
        Ok(())
    })?;

    keyspace.set_loading(true);
    let result = records.into_iter().try_for_each(|record| {
        keyspace
            .restore(record.db, record.key, record.entity, record.expire_at, emit)
            .map(|_| ())
            .map_err(|e| PersistError::CorruptSnapshot(e.to_string()))
    });
    keyspace.set_loading(false);
    result?;

    debug!(aux = ?info.aux, "Snapshot aux fields");
    info!(path = %path.display(), keys = info.keys, "Snapshot loaded");
    Ok(Some(info))
}
