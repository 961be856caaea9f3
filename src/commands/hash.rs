//! Hash commands.

use super::flags::{DENY_OOM, WRITE};
use super::{read_first_key, write_first_key};
use super::{CommandContext, CommandTable};
use crate::error::{CommandError, CommandResult};
use crate::protocol::RespValue;
use crate::storage::Entity;
use bytes::Bytes;
use std::collections::HashMap;

pub(super) fn register(table: &mut CommandTable) {
    table.register("hset", cmd_hset, -4, write_first_key, WRITE | DENY_OOM);
    table.register("hmset", cmd_hmset, -4, write_first_key, WRITE | DENY_OOM);
    table.register("hget", cmd_hget, 3, read_first_key, 0);
    table.register("hdel", cmd_hdel, -3, write_first_key, WRITE);
    table.register("hexists", cmd_hexists, 3, read_first_key, 0);
    table.register("hlen", cmd_hlen, 2, read_first_key, 0);
    table.register("hgetall", cmd_hgetall, 2, read_first_key, 0);
}

/// Stores field/value pairs, creating the hash if needed. Returns the number
/// of new fields.
fn set_fields(ctx: &mut CommandContext<'_>, args: &[Bytes], command: &str) -> Result<usize, CommandError> {
    if args.len() % 2 != 0 {
        return Err(CommandError::WrongArity(command.to_string()));
    }
    let key = &args[1];
    let pairs = args[2..].chunks(2);

    let added = match ctx.db.get_mut(key)? {
        Some(entity) => {
            let map = entity.as_hash_mut()?;
            pairs
                .filter(|pair| map.insert(pair[0].clone(), pair[1].clone()).is_none())
                .count()
        }
        None => {
            let map: HashMap<Bytes, Bytes> = pairs
                .map(|pair| (pair[0].clone(), pair[1].clone()))
                .collect();
            let added = map.len();
            ctx.db.put(key.clone(), Entity::Hash(map))?;
            added
        }
    };

    ctx.propagate(args);
    Ok(added)
}

/// HSET key field value [field value ...]
fn cmd_hset(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let added = set_fields(ctx, args, "hset")?;
    Ok(RespValue::integer(added as i64))
}

/// HMSET key field value [field value ...]
fn cmd_hmset(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    set_fields(ctx, args, "hmset")?;
    Ok(RespValue::ok())
}

/// HGET key field
fn cmd_hget(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let value = match ctx.db.get(&args[1])? {
        Some(entity) => entity.as_hash()?.get(&args[2]).cloned(),
        None => None,
    };
    Ok(match value {
        Some(value) => RespValue::bulk_string(value),
        None => RespValue::null(),
    })
}

/// HDEL key field [field ...]
fn cmd_hdel(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let removed = match ctx.db.get_mut(&args[1])? {
        Some(entity) => {
            let map = entity.as_hash_mut()?;
            args[2..]
                .iter()
                .filter(|field| map.remove(*field).is_some())
                .count()
        }
        None => 0,
    };
    if removed > 0 {
        ctx.propagate(args);
    }
    Ok(RespValue::integer(removed as i64))
}

/// HEXISTS key field
fn cmd_hexists(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let exists = match ctx.db.get(&args[1])? {
        Some(entity) => entity.as_hash()?.contains_key(&args[2]),
        None => false,
    };
    Ok(RespValue::integer(exists as i64))
}

/// HLEN key
fn cmd_hlen(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let len = match ctx.db.get(&args[1])? {
        Some(entity) => entity.as_hash()?.len(),
        None => 0,
    };
    Ok(RespValue::integer(len as i64))
}

/// HGETALL key
///
/// Fields are returned in field order.
fn cmd_hgetall(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let Some(entity) = ctx.db.get(&args[1])? else {
        return Ok(RespValue::array(Vec::new()));
    };
    let mut fields: Vec<(&Bytes, &Bytes)> = entity.as_hash()?.iter().collect();
    fields.sort();
    Ok(RespValue::bulk_array(
        fields
            .into_iter()
            .flat_map(|(f, v)| [f.clone(), v.clone()]),
    ))
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::error::CommandError;
    use crate::protocol::{cmd_line, RespValue};
    use crate::storage::Keyspace;
    use bytes::Bytes;

    fn run(ks: &Keyspace, parts: &[&str]) -> Result<RespValue, CommandError> {
        ks.execute(0, &cmd_line(parts))
    }

    #[test]
    fn test_hset_counts_new_fields() {
        let ks = Keyspace::new(&Config::default());
        assert_eq!(run(&ks, &["HSET", "h", "a", "1", "b", "2"]), Ok(RespValue::integer(2)));
        assert_eq!(run(&ks, &["HSET", "h", "a", "9", "c", "3"]), Ok(RespValue::integer(1)));
        assert_eq!(
            run(&ks, &["HGET", "h", "a"]),
            Ok(RespValue::bulk_string(Bytes::from_static(b"9")))
        );
        assert_eq!(run(&ks, &["HLEN", "h"]), Ok(RespValue::integer(3)));
        assert_eq!(
            run(&ks, &["HSET", "h", "a", "1", "b"]),
            Err(CommandError::WrongArity("hset".into()))
        );
    }

    #[test]
    fn test_hgetall_is_ordered() {
        let ks = Keyspace::new(&Config::default());
        assert_eq!(run(&ks, &["HMSET", "h", "z", "1", "a", "2"]), Ok(RespValue::ok()));
        assert_eq!(
            run(&ks, &["HGETALL", "h"]),
            Ok(RespValue::bulk_array(cmd_line(&["a", "2", "z", "1"])))
        );
        assert_eq!(run(&ks, &["HGETALL", "missing"]), Ok(RespValue::array(vec![])));
    }

    #[test]
    fn test_hdel_removes_empty_hash() {
        let ks = Keyspace::new(&Config::default());
        run(&ks, &["HSET", "h", "a", "1"]).unwrap();
        assert_eq!(run(&ks, &["HEXISTS", "h", "a"]), Ok(RespValue::integer(1)));
        assert_eq!(run(&ks, &["HDEL", "h", "a", "nope"]), Ok(RespValue::integer(1)));
        assert_eq!(run(&ks, &["EXISTS", "h"]), Ok(RespValue::integer(0)));
        assert_eq!(run(&ks, &["HGET", "h", "a"]), Ok(RespValue::null()));
    }
}
