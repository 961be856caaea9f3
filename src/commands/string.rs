//! String commands.
//!
//! Deadlines set through `SET EX/PX`, `SETEX` and `PSETEX` are logged as
//! `SET` followed by an absolute `PEXPIREAT`, so replaying the log later does
//! not push the deadline back.

use super::flags::{DENY_OOM, WRITE};
use super::{parse_i64, read_all_keys, read_first_key, write_even_keys, write_first_key};
use super::{CommandContext, CommandTable};
use crate::error::{CommandError, CommandResult};
use crate::protocol::{cmd_line, RespValue};
use crate::storage::{expire_command, unix_ms, Entity, ExpireOutcome};
use bytes::Bytes;

pub(super) fn register(table: &mut CommandTable) {
    table.register("set", cmd_set, -3, write_first_key, WRITE | DENY_OOM);
    table.register("get", cmd_get, 2, read_first_key, 0);
    table.register("setnx", cmd_setnx, 3, write_first_key, WRITE | DENY_OOM);
    table.register("setex", cmd_setex, 4, write_first_key, WRITE | DENY_OOM);
    table.register("psetex", cmd_psetex, 4, write_first_key, WRITE | DENY_OOM);
    table.register("getset", cmd_getset, 3, write_first_key, WRITE | DENY_OOM);
    table.register("incr", cmd_incr, 2, write_first_key, WRITE | DENY_OOM);
    table.register("incrby", cmd_incrby, 3, write_first_key, WRITE | DENY_OOM);
    table.register("decr", cmd_decr, 2, write_first_key, WRITE | DENY_OOM);
    table.register("decrby", cmd_decrby, 3, write_first_key, WRITE | DENY_OOM);
    table.register("append", cmd_append, 3, write_first_key, WRITE | DENY_OOM);
    table.register("strlen", cmd_strlen, 2, read_first_key, 0);
    table.register("mset", cmd_mset, -3, write_even_keys, WRITE | DENY_OOM);
    table.register("mget", cmd_mget, -2, read_all_keys, 0);
}

/// Reads a string value, `None` if the key is missing.
fn get_string(ctx: &mut CommandContext<'_>, key: &[u8]) -> Result<Option<Bytes>, CommandError> {
    match ctx.db.get(key)? {
        Some(entity) => Ok(Some(entity.as_string()?.clone())),
        None => Ok(None),
    }
}

/// Stores a string, dropping any deadline, and logs `SET key value`.
fn store(ctx: &mut CommandContext<'_>, key: &Bytes, value: &Bytes) -> Result<(), CommandError> {
    ctx.db.put(key.clone(), Entity::String(value.clone()))?;
    ctx.clear_expire(key)?;
    ctx.add_aof(cmd_line(&[&b"SET"[..], &key[..], &value[..]]));
    Ok(())
}

/// Stores a string with an absolute deadline and logs both halves.
fn store_with_deadline(
    ctx: &mut CommandContext<'_>,
    key: &Bytes,
    value: &Bytes,
    at_ms: u64,
) -> Result<(), CommandError> {
    store(ctx, key, value)?;
    if ctx.set_expire(key, at_ms)? == ExpireOutcome::Scheduled {
        ctx.add_aof(expire_command(key, at_ms));
    }
    Ok(())
}

/// Converts a relative TTL into an absolute deadline.
fn deadline(ttl: &[u8], unit_ms: u64, command: &str) -> Result<u64, CommandError> {
    let ttl = parse_i64(ttl)?;
    if ttl <= 0 {
        return Err(CommandError::InvalidExpireTime(command.to_string()));
    }
    (ttl as u64)
        .checked_mul(unit_ms)
        .and_then(|ms| ms.checked_add(unix_ms()))
        .ok_or_else(|| CommandError::InvalidExpireTime(command.to_string()))
}

/// SET key value [EX seconds | PX milliseconds] [NX | XX]
fn cmd_set(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let key = &args[1];
    let value = &args[2];

    let mut at_ms: Option<u64> = None;
    let mut nx = false;
    let mut xx = false;

    let mut i = 3;
    while i < args.len() {
        let opt = args[i].to_ascii_uppercase();
        match opt.as_slice() {
            b"EX" | b"PX" if at_ms.is_none() => {
                let ttl = args.get(i + 1).ok_or(CommandError::Syntax)?;
                let unit = if opt.as_slice() == b"EX" { 1000 } else { 1 };
                at_ms = Some(deadline(ttl, unit, "set")?);
                i += 1;
            }
            b"NX" if !xx => nx = true,
            b"XX" if !nx => xx = true,
            _ => return Err(CommandError::Syntax),
        }
        i += 1;
    }

    let exists = ctx.db.contains(key)?;
    if (nx && exists) || (xx && !exists) {
        return Ok(RespValue::null());
    }

    match at_ms {
        Some(at) => store_with_deadline(ctx, key, value, at)?,
        None => store(ctx, key, value)?,
    }
    Ok(RespValue::ok())
}

/// GET key
fn cmd_get(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    Ok(match get_string(ctx, &args[1])? {
        Some(value) => RespValue::bulk_string(value),
        None => RespValue::null(),
    })
}

/// SETNX key value
fn cmd_setnx(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    if ctx.db.contains(&args[1])? {
        return Ok(RespValue::integer(0));
    }
    store(ctx, &args[1], &args[2])?;
    Ok(RespValue::integer(1))
}

/// SETEX key seconds value
fn cmd_setex(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let at = deadline(&args[2], 1000, "setex")?;
    store_with_deadline(ctx, &args[1], &args[3], at)?;
    Ok(RespValue::ok())
}

/// PSETEX key milliseconds value
fn cmd_psetex(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let at = deadline(&args[2], 1, "psetex")?;
    store_with_deadline(ctx, &args[1], &args[3], at)?;
    Ok(RespValue::ok())
}

/// GETSET key value
fn cmd_getset(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let old = get_string(ctx, &args[1])?;
    store(ctx, &args[1], &args[2])?;
    Ok(match old {
        Some(value) => RespValue::bulk_string(value),
        None => RespValue::null(),
    })
}

/// Adds `delta` to the integer stored at `key`, keeping its deadline.
fn incr_by(ctx: &mut CommandContext<'_>, args: &[Bytes], delta: i64) -> CommandResult {
    let key = &args[1];
    let current = match get_string(ctx, key)? {
        Some(value) => parse_i64(&value)?,
        None => 0,
    };
    let next = current.checked_add(delta).ok_or(CommandError::Overflow)?;
    ctx.db
        .put(key.clone(), Entity::String(Bytes::from(next.to_string())))?;
    ctx.propagate(args);
    Ok(RespValue::integer(next))
}

/// INCR key
fn cmd_incr(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    incr_by(ctx, args, 1)
}

/// INCRBY key increment
fn cmd_incrby(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let delta = parse_i64(&args[2])?;
    incr_by(ctx, args, delta)
}

/// DECR key
fn cmd_decr(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    incr_by(ctx, args, -1)
}

/// DECRBY key decrement
fn cmd_decrby(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let delta = parse_i64(&args[2])?
        .checked_neg()
        .ok_or(CommandError::Overflow)?;
    incr_by(ctx, args, delta)
}

/// APPEND key value
fn cmd_append(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let key = &args[1];
    let len = match ctx.db.get_mut(key)? {
        Some(entity) => {
            let current = entity.as_string()?;
            let mut joined = Vec::with_capacity(current.len() + args[2].len());
            joined.extend_from_slice(current);
            joined.extend_from_slice(&args[2]);
            let len = joined.len();
            *entity = Entity::String(Bytes::from(joined));
            len
        }
        None => {
            ctx.db.put(key.clone(), Entity::String(args[2].clone()))?;
            args[2].len()
        }
    };
    ctx.propagate(args);
    Ok(RespValue::integer(len as i64))
}

/// STRLEN key
fn cmd_strlen(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let len = get_string(ctx, &args[1])?.map(|v| v.len()).unwrap_or(0);
    Ok(RespValue::integer(len as i64))
}

/// MSET key value [key value ...]
fn cmd_mset(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    if args.len() % 2 != 1 {
        return Err(CommandError::WrongArity("mset".to_string()));
    }
    for pair in args[1..].chunks(2) {
        ctx.db.put(pair[0].clone(), Entity::String(pair[1].clone()))?;
        ctx.clear_expire(&pair[0])?;
    }
    ctx.propagate(args);
    Ok(RespValue::ok())
}

/// MGET key [key ...]
fn cmd_mget(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let mut values = Vec::with_capacity(args.len() - 1);
    for key in &args[1..] {
        let value = match ctx.db.get(key)? {
            Some(Entity::String(value)) => RespValue::bulk_string(value.clone()),
            _ => RespValue::null(),
        };
        values.push(value);
    }
    Ok(RespValue::array(values))
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::error::CommandError;
    use crate::protocol::{cmd_line, RespValue};
    use crate::storage::{unix_ms, KeySpec, Keyspace};
    use bytes::Bytes;

    fn run(ks: &Keyspace, parts: &[&str]) -> Result<RespValue, CommandError> {
        ks.execute(0, &cmd_line(parts))
    }

    fn bulk(s: &str) -> RespValue {
        RespValue::bulk_string(Bytes::from(s.to_string()))
    }

    fn deadline(ks: &Keyspace, key: &str) -> Option<u64> {
        let k = Bytes::from(key.to_string());
        ks.db(0)
            .unwrap()
            .lock(&KeySpec::read(vec![k.clone()]))
            .expire_at(&k)
            .unwrap()
    }

    #[test]
    fn test_set_and_get() {
        let ks = Keyspace::new(&Config::default());
        assert_eq!(run(&ks, &["SET", "k", "v"]), Ok(RespValue::ok()));
        assert_eq!(run(&ks, &["GET", "k"]), Ok(bulk("v")));
        assert_eq!(run(&ks, &["GET", "missing"]), Ok(RespValue::null()));
    }

    #[test]
    fn test_set_nx_xx() {
        let ks = Keyspace::new(&Config::default());
        assert_eq!(run(&ks, &["SET", "k", "1", "XX"]), Ok(RespValue::null()));
        assert_eq!(run(&ks, &["SET", "k", "1", "NX"]), Ok(RespValue::ok()));
        assert_eq!(run(&ks, &["SET", "k", "2", "NX"]), Ok(RespValue::null()));
        assert_eq!(run(&ks, &["SET", "k", "3", "XX"]), Ok(RespValue::ok()));
        assert_eq!(run(&ks, &["GET", "k"]), Ok(bulk("3")));
        assert_eq!(run(&ks, &["SET", "k", "3", "NX", "XX"]), Err(CommandError::Syntax));
    }

    #[test]
    fn test_set_with_ttl_and_plain_set_clears_it() {
        let ks = Keyspace::new(&Config::default());
        let before = unix_ms();
        run(&ks, &["SET", "k", "v", "EX", "100"]).unwrap();
        let at = deadline(&ks, "k").unwrap();
        assert!(at >= before + 100_000 && at <= unix_ms() + 100_000);

        run(&ks, &["SET", "k", "v2"]).unwrap();
        assert_eq!(deadline(&ks, "k"), None);

        assert_eq!(
            run(&ks, &["SET", "k", "v", "PX", "0"]),
            Err(CommandError::InvalidExpireTime("set".into()))
        );
        assert_eq!(run(&ks, &["SET", "k", "v", "EX"]), Err(CommandError::Syntax));
    }

    #[test]
    fn test_incr_family() {
        let ks = Keyspace::new(&Config::default());
        assert_eq!(run(&ks, &["INCR", "n"]), Ok(RespValue::integer(1)));
        assert_eq!(run(&ks, &["INCRBY", "n", "10"]), Ok(RespValue::integer(11)));
        assert_eq!(run(&ks, &["DECRBY", "n", "20"]), Ok(RespValue::integer(-9)));
        assert_eq!(run(&ks, &["DECR", "n"]), Ok(RespValue::integer(-10)));

        run(&ks, &["SET", "s", "abc"]).unwrap();
        assert_eq!(run(&ks, &["INCR", "s"]), Err(CommandError::NotInteger));

        run(&ks, &["SET", "max", i64::MAX.to_string().as_str()]).unwrap();
        assert_eq!(run(&ks, &["INCR", "max"]), Err(CommandError::Overflow));
    }

    #[test]
    fn test_incr_keeps_deadline() {
        let ks = Keyspace::new(&Config::default());
        run(&ks, &["SETEX", "n", "100", "1"]).unwrap();
        run(&ks, &["INCR", "n"]).unwrap();
        assert!(deadline(&ks, "n").is_some());
    }

    #[test]
    fn test_append_strlen_getset() {
        let ks = Keyspace::new(&Config::default());
        assert_eq!(run(&ks, &["APPEND", "k", "Hello"]), Ok(RespValue::integer(5)));
        assert_eq!(run(&ks, &["APPEND", "k", " World"]), Ok(RespValue::integer(11)));
        assert_eq!(run(&ks, &["STRLEN", "k"]), Ok(RespValue::integer(11)));
        assert_eq!(run(&ks, &["GETSET", "k", "new"]), Ok(bulk("Hello World")));
        assert_eq!(run(&ks, &["GET", "k"]), Ok(bulk("new")));
        assert_eq!(run(&ks, &["SETNX", "k", "x"]), Ok(RespValue::integer(0)));
    }

    #[test]
    fn test_mset_mget() {
        let ks = Keyspace::new(&Config::default());
        run(&ks, &["MSET", "a", "1", "b", "2"]).unwrap();
        run(&ks, &["RPUSH", "l", "x"]).unwrap();
        assert_eq!(
            run(&ks, &["MGET", "a", "b", "c", "l"]),
            Ok(RespValue::array(vec![
                bulk("1"),
                bulk("2"),
                RespValue::null(),
                RespValue::null()
            ]))
        );
        assert_eq!(
            run(&ks, &["MSET", "a", "1", "b"]),
            Err(CommandError::WrongArity("mset".into()))
        );
    }

    #[test]
    fn test_wrong_type() {
        let ks = Keyspace::new(&Config::default());
        run(&ks, &["RPUSH", "l", "x"]).unwrap();
        assert_eq!(run(&ks, &["GET", "l"]), Err(CommandError::WrongType));
        assert_eq!(run(&ks, &["APPEND", "l", "x"]), Err(CommandError::WrongType));
    }
}
