//! Key commands: deletion, inspection, deadlines and whole-database
//! operations.
//!
//! Every expiration command is logged as one absolute `PEXPIREAT`, and only
//! when a deadline was actually recorded. A deadline already in the past
//! deletes the key on the spot, which is logged as `DEL`.

use super::flags::{BLOCKING, WRITE};
use super::{no_keys, parse_i64, read_all_keys, read_first_key, write_all_keys, write_first_key};
use super::{CommandContext, CommandTable};
use crate::error::{CommandError, CommandResult};
use crate::protocol::RespValue;
use crate::storage::{expire_command, unix_ms, ExpireOutcome};
use bytes::Bytes;

pub(super) fn register(table: &mut CommandTable) {
    table.register("del", cmd_del, -2, write_all_keys, WRITE);
    table.register("exists", cmd_exists, -2, read_all_keys, 0);
    table.register("expire", cmd_expire, 3, write_first_key, WRITE);
    table.register("pexpire", cmd_pexpire, 3, write_first_key, WRITE);
    table.register("expireat", cmd_expireat, 3, write_first_key, WRITE);
    table.register("pexpireat", cmd_pexpireat, 3, write_first_key, WRITE);
    table.register("ttl", cmd_ttl, 2, read_first_key, 0);
    table.register("pttl", cmd_pttl, 2, read_first_key, 0);
    table.register("persist", cmd_persist, 2, write_first_key, WRITE);
    table.register("type", cmd_type, 2, read_first_key, 0);
    table.register("keys", cmd_keys, 2, no_keys, BLOCKING);
    table.register("rename", cmd_rename, 3, write_all_keys, WRITE);
    table.register("dbsize", cmd_dbsize, 1, no_keys, 0);
    table.register("flushdb", cmd_flushdb, 1, no_keys, WRITE);
    table.register("flushall", cmd_flushall, 1, no_keys, WRITE);
}

// ============================================================================
// Deletion and inspection
// ============================================================================

/// DEL key [key ...]
fn cmd_del(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let mut deleted = 0;
    for key in &args[1..] {
        if ctx.delete(key)? {
            deleted += 1;
        }
    }
    if deleted > 0 {
        ctx.propagate(args);
    }
    Ok(RespValue::integer(deleted))
}

/// EXISTS key [key ...]
///
/// A key named twice is counted twice.
fn cmd_exists(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let mut count = 0;
    for key in &args[1..] {
        if ctx.db.contains(key)? {
            count += 1;
        }
    }
    Ok(RespValue::integer(count))
}

/// TYPE key
fn cmd_type(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let name = ctx
        .db
        .data_type(&args[1])?
        .map(|t| t.name())
        .unwrap_or("none");
    Ok(RespValue::simple_string(name))
}

/// KEYS pattern
fn cmd_keys(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let db = ctx.keyspace.db(ctx.db_index())?;
    Ok(RespValue::bulk_array(db.keys_matching(&args[1])))
}

/// RENAME key newkey
///
/// The deadline of `key`, if any, moves to `newkey`.
fn cmd_rename(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let (src, dst) = (&args[1], &args[2]);
    if !ctx.db.contains(src)? {
        return Err(CommandError::NoSuchKey);
    }
    if src == dst {
        return Ok(RespValue::ok());
    }

    let deadline = ctx.db.expire_at(src)?;
    let entity = ctx.db.remove(src)?.ok_or(CommandError::NoSuchKey)?;
    ctx.keyspace.scheduler().cancel(ctx.db_index(), src);
    ctx.delete(dst)?;
    ctx.db.put(dst.clone(), entity)?;
    ctx.propagate(args);

    if let Some(at) = deadline {
        ctx.set_expire(dst, at)?;
    }
    Ok(RespValue::ok())
}

// ============================================================================
// Deadlines
// ============================================================================

/// Turns a command's time argument into an absolute unix-ms deadline.
///
/// `base_ms` is added for relative forms; `unit_ms` scales the argument.
/// Values in the past are clamped to zero, which deletes the key.
fn absolute_deadline(
    arg: &[u8],
    base_ms: u64,
    unit_ms: u64,
    command: &str,
) -> Result<u64, CommandError> {
    let value = parse_i64(arg)? as i128;
    let at = base_ms as i128 + value * unit_ms as i128;
    if at > i64::MAX as i128 {
        return Err(CommandError::InvalidExpireTime(command.to_string()));
    }
    Ok(at.max(0) as u64)
}

fn expire_generic(ctx: &mut CommandContext<'_>, key: &Bytes, at_ms: u64) -> CommandResult {
    match ctx.set_expire(key, at_ms)? {
        ExpireOutcome::Missing => Ok(RespValue::integer(0)),
        ExpireOutcome::Deleted => Ok(RespValue::integer(1)),
        ExpireOutcome::Scheduled => {
            ctx.add_aof(expire_command(key, at_ms));
            Ok(RespValue::integer(1))
        }
    }
}

/// EXPIRE key seconds
fn cmd_expire(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let at = absolute_deadline(&args[2], unix_ms(), 1000, "expire")?;
    expire_generic(ctx, &args[1], at)
}

/// PEXPIRE key milliseconds
fn cmd_pexpire(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let at = absolute_deadline(&args[2], unix_ms(), 1, "pexpire")?;
    expire_generic(ctx, &args[1], at)
}

/// EXPIREAT key unix-seconds
fn cmd_expireat(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let at = absolute_deadline(&args[2], 0, 1000, "expireat")?;
    expire_generic(ctx, &args[1], at)
}

/// PEXPIREAT key unix-milliseconds
fn cmd_pexpireat(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let at = absolute_deadline(&args[2], 0, 1, "pexpireat")?;
    expire_generic(ctx, &args[1], at)
}

/// Remaining lifetime in milliseconds: -2 missing, -1 no deadline.
///
/// A key whose deadline has passed but which the driver has not reached yet
/// still exists, and reports 0.
fn remaining_ms(ctx: &CommandContext<'_>, key: &[u8]) -> Result<i64, CommandError> {
    if !ctx.db.contains(key)? {
        return Ok(-2);
    }
    Ok(match ctx.db.expire_at(key)? {
        Some(at) => at.saturating_sub(unix_ms()) as i64,
        None => -1,
    })
}

/// TTL key
fn cmd_ttl(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let ms = remaining_ms(ctx, &args[1])?;
    let ttl = if ms < 0 { ms } else { (ms + 500) / 1000 };
    Ok(RespValue::integer(ttl))
}

/// PTTL key
fn cmd_pttl(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    Ok(RespValue::integer(remaining_ms(ctx, &args[1])?))
}

/// PERSIST key
fn cmd_persist(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    if !ctx.db.contains(&args[1])? || !ctx.clear_expire(&args[1])? {
        return Ok(RespValue::integer(0));
    }
    ctx.propagate(args);
    Ok(RespValue::integer(1))
}

// ============================================================================
// Whole-database operations
// ============================================================================

/// DBSIZE
fn cmd_dbsize(ctx: &mut CommandContext<'_>, _args: &[Bytes]) -> CommandResult {
    let db = ctx.keyspace.db(ctx.db_index())?;
    Ok(RespValue::integer(db.len() as i64))
}

/// FLUSHDB
fn cmd_flushdb(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    ctx.keyspace.flush_db(ctx.db_index())?;
    ctx.propagate(args);
    Ok(RespValue::ok())
}

/// FLUSHALL
fn cmd_flushall(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    ctx.keyspace.flush_all();
    ctx.propagate(args);
    Ok(RespValue::ok())
}
