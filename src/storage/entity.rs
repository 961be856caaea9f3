//! Typed values stored under keys.
//!
//! An [`Entity`] is a closed union over the five value kinds. Commands match
//! on the variant they expect and turn any other variant into
//! [`CommandError::WrongType`], so a type mismatch is always a user-visible
//! error rather than a crash.

use crate::error::CommandError;
use crate::protocol::CmdLine;
use bytes::Bytes;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Fixed bookkeeping cost charged per key, on top of key and value bytes.
pub const KEY_OVERHEAD: usize = 64;

/// Fixed bookkeeping cost charged per collection element.
pub const ELEMENT_OVERHEAD: usize = 16;

/// Type tag of an entity, as reported by `TYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    String,
    List,
    Hash,
    Set,
    ZSet,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::List => "list",
            DataType::Hash => "hash",
            DataType::Set => "set",
            DataType::ZSet => "zset",
        }
    }
}

/// A value stored in a database.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    String(Bytes),
    List(VecDeque<Bytes>),
    Hash(HashMap<Bytes, Bytes>),
    Set(HashSet<Bytes>),
    ZSet(SortedSet),
}

impl Entity {
    pub fn data_type(&self) -> DataType {
        match self {
            Entity::String(_) => DataType::String,
            Entity::List(_) => DataType::List,
            Entity::Hash(_) => DataType::Hash,
            Entity::Set(_) => DataType::Set,
            Entity::ZSet(_) => DataType::ZSet,
        }
    }

    /// Estimated heap footprint of the value, excluding the key.
    pub fn memory_size(&self) -> usize {
        match self {
            Entity::String(b) => b.len(),
            Entity::List(items) => items.iter().map(|i| i.len() + ELEMENT_OVERHEAD).sum(),
            Entity::Hash(map) => map
                .iter()
                .map(|(f, v)| f.len() + v.len() + ELEMENT_OVERHEAD)
                .sum(),
            Entity::Set(set) => set.iter().map(|m| m.len() + ELEMENT_OVERHEAD).sum(),
            Entity::ZSet(zset) => zset.memory_size(),
        }
    }

    /// True for a collection with no elements. Empty collections are removed
    /// from the keyspace once a command finishes.
    pub fn is_empty_collection(&self) -> bool {
        match self {
            Entity::String(_) => false,
            Entity::List(items) => items.is_empty(),
            Entity::Hash(map) => map.is_empty(),
            Entity::Set(set) => set.is_empty(),
            Entity::ZSet(zset) => zset.is_empty(),
        }
    }

    pub fn as_string(&self) -> Result<&Bytes, CommandError> {
        match self {
            Entity::String(b) => Ok(b),
            _ => Err(CommandError::WrongType),
        }
    }

    pub fn as_list(&self) -> Result<&VecDeque<Bytes>, CommandError> {
        match self {
            Entity::List(l) => Ok(l),
            _ => Err(CommandError::WrongType),
        }
    }

    pub fn as_list_mut(&mut self) -> Result<&mut VecDeque<Bytes>, CommandError> {
        match self {
            Entity::List(l) => Ok(l),
            _ => Err(CommandError::WrongType),
        }
    }

    pub fn as_hash(&self) -> Result<&HashMap<Bytes, Bytes>, CommandError> {
        match self {
            Entity::Hash(h) => Ok(h),
            _ => Err(CommandError::WrongType),
        }
    }

    pub fn as_hash_mut(&mut self) -> Result<&mut HashMap<Bytes, Bytes>, CommandError> {
        match self {
            Entity::Hash(h) => Ok(h),
            _ => Err(CommandError::WrongType),
        }
    }

    pub fn as_set(&self) -> Result<&HashSet<Bytes>, CommandError> {
        match self {
            Entity::Set(s) => Ok(s),
            _ => Err(CommandError::WrongType),
        }
    }

    pub fn as_set_mut(&mut self) -> Result<&mut HashSet<Bytes>, CommandError> {
        match self {
            Entity::Set(s) => Ok(s),
            _ => Err(CommandError::WrongType),
        }
    }

    pub fn as_zset(&self) -> Result<&SortedSet, CommandError> {
        match self {
            Entity::ZSet(z) => Ok(z),
            _ => Err(CommandError::WrongType),
        }
    }

    pub fn as_zset_mut(&mut self) -> Result<&mut SortedSet, CommandError> {
        match self {
            Entity::ZSet(z) => Ok(z),
            _ => Err(CommandError::WrongType),
        }
    }

    /// Builds the single write command that recreates this entity under `key`.
    ///
    /// Used by the command-form rewrite and when a snapshot loaded at startup
    /// is re-emitted into the log.
    pub fn to_command(&self, key: &Bytes) -> CmdLine {
        match self {
            Entity::String(value) => vec![Bytes::from_static(b"SET"), key.clone(), value.clone()],
            Entity::List(items) => {
                let mut cmd = Vec::with_capacity(items.len() + 2);
                cmd.push(Bytes::from_static(b"RPUSH"));
                cmd.push(key.clone());
                cmd.extend(items.iter().cloned());
                cmd
            }
            Entity::Set(members) => {
                let mut cmd = Vec::with_capacity(members.len() + 2);
                cmd.push(Bytes::from_static(b"SADD"));
                cmd.push(key.clone());
                cmd.extend(members.iter().cloned());
                cmd
            }
            Entity::Hash(map) => {
                let mut cmd = Vec::with_capacity(map.len() * 2 + 2);
                cmd.push(Bytes::from_static(b"HMSET"));
                cmd.push(key.clone());
                for (field, value) in map {
                    cmd.push(field.clone());
                    cmd.push(value.clone());
                }
                cmd
            }
            Entity::ZSet(zset) => {
                let mut cmd = Vec::with_capacity(zset.len() * 2 + 2);
                cmd.push(Bytes::from_static(b"ZADD"));
                cmd.push(key.clone());
                for (member, score) in zset.iter() {
                    cmd.push(Bytes::from(format_score(score)));
                    cmd.push(member.clone());
                }
                cmd
            }
        }
    }
}

/// Builds the canonical expiration record `PEXPIREAT key <unix-ms>`.
pub fn expire_command(key: &Bytes, expire_at_ms: u64) -> CmdLine {
    vec![
        Bytes::from_static(b"PEXPIREAT"),
        key.clone(),
        Bytes::from(expire_at_ms.to_string()),
    ]
}

/// Formats a score so that parsing it back yields the same `f64`.
pub fn format_score(score: f64) -> String {
    if score == f64::INFINITY {
        "inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        format!("{}", score)
    }
}

/// Score wrapper with a total order, so it can key a `BTreeSet`.
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Sorted set: member to score, plus an index ordered by (score, member).
#[derive(Debug, Clone, Default)]
pub struct SortedSet {
    scores: HashMap<Bytes, f64>,
    ordered: BTreeSet<(Score, Bytes)>,
}

impl PartialEq for SortedSet {
    fn eq(&self, other: &Self) -> bool {
        self.scores == other.scores
    }
}

impl SortedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or updates a member. Returns `true` if the member is new.
    pub fn insert(&mut self, member: Bytes, score: f64) -> bool {
        match self.scores.insert(member.clone(), score) {
            Some(old) => {
                self.ordered.remove(&(Score(old), member.clone()));
                self.ordered.insert((Score(score), member));
                false
            }
            None => {
                self.ordered.insert((Score(score), member));
                true
            }
        }
    }

    pub fn remove(&mut self, member: &[u8]) -> bool {
        match self.scores.remove_entry(member) {
            Some((member, score)) => {
                self.ordered.remove(&(Score(score), member));
                true
            }
            None => false,
        }
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.scores.get(member).copied()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Members in ascending (score, member) order.
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, f64)> {
        self.ordered.iter().map(|(score, member)| (member, score.0))
    }

    /// Members with rank in `start..=stop`, both already clamped.
    pub fn range_by_rank(&self, start: usize, stop: usize) -> Vec<(Bytes, f64)> {
        if start > stop {
            return Vec::new();
        }
        self.iter()
            .skip(start)
            .take(stop - start + 1)
            .map(|(m, s)| (m.clone(), s))
            .collect()
    }

    fn memory_size(&self) -> usize {
        self.scores
            .keys()
            .map(|m| 2 * m.len() + 8 + 2 * ELEMENT_OVERHEAD)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::cmd_line;

    #[test]
    fn test_wrong_type_is_error() {
        let entity = Entity::String(Bytes::from("v"));
        assert!(entity.as_string().is_ok());
        assert_eq!(entity.as_list(), Err(CommandError::WrongType));
        assert_eq!(entity.as_zset().err(), Some(CommandError::WrongType));
    }

    #[test]
    fn test_sorted_set_orders_by_score_then_member() {
        let mut zset = SortedSet::new();
        assert!(zset.insert(Bytes::from("b"), 2.0));
        assert!(zset.insert(Bytes::from("a"), 2.0));
        assert!(zset.insert(Bytes::from("c"), 1.0));
        assert!(!zset.insert(Bytes::from("c"), 3.0));

        let order: Vec<&[u8]> = zset.iter().map(|(m, _)| m.as_ref()).collect();
        assert_eq!(order, vec![&b"a"[..], b"b", b"c"]);
        assert_eq!(zset.score(b"c"), Some(3.0));

        assert!(zset.remove(b"a"));
        assert!(!zset.remove(b"a"));
        assert_eq!(zset.len(), 2);
        assert_eq!(zset.range_by_rank(0, 0), vec![(Bytes::from("b"), 2.0)]);
    }

    #[test]
    fn test_to_command_forms() {
        let key = Bytes::from("k");
        assert_eq!(
            Entity::String(Bytes::from("v")).to_command(&key),
            cmd_line(&["SET", "k", "v"])
        );

        let list: VecDeque<Bytes> = vec![Bytes::from("x"), Bytes::from("y")].into();
        assert_eq!(
            Entity::List(list).to_command(&key),
            cmd_line(&["RPUSH", "k", "x", "y"])
        );

        let mut zset = SortedSet::new();
        zset.insert(Bytes::from("m"), 1.5);
        assert_eq!(
            Entity::ZSet(zset).to_command(&key),
            cmd_line(&["ZADD", "k", "1.5", "m"])
        );

        assert_eq!(
            expire_command(&key, 1700000000000),
            cmd_line(&["PEXPIREAT", "k", "1700000000000"])
        );
    }

    #[test]
    fn test_empty_collection() {
        assert!(Entity::List(VecDeque::new()).is_empty_collection());
        assert!(!Entity::String(Bytes::new()).is_empty_collection());
    }

    #[test]
    fn test_memory_size_grows_with_content() {
        let small = Entity::String(Bytes::from("a"));
        let large = Entity::String(Bytes::from(vec![0u8; 1024]));
        assert!(large.memory_size() > small.memory_size());
    }
}
