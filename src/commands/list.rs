//! List commands.
//!
//! A list left empty by a pop is removed when the command's locks are
//! released.

use super::flags::{DENY_OOM, WRITE};
use super::{parse_i64, read_first_key, resolve_index, resolve_range, write_first_key};
use super::{CommandContext, CommandTable};
use crate::error::CommandResult;
use crate::protocol::RespValue;
use crate::storage::Entity;
use bytes::Bytes;
use std::collections::VecDeque;

pub(super) fn register(table: &mut CommandTable) {
    table.register("lpush", cmd_lpush, -3, write_first_key, WRITE | DENY_OOM);
    table.register("rpush", cmd_rpush, -3, write_first_key, WRITE | DENY_OOM);
    table.register("lpop", cmd_lpop, 2, write_first_key, WRITE);
    table.register("rpop", cmd_rpop, 2, write_first_key, WRITE);
    table.register("llen", cmd_llen, 2, read_first_key, 0);
    table.register("lindex", cmd_lindex, 3, read_first_key, 0);
    table.register("lrange", cmd_lrange, 4, read_first_key, 0);
}

fn push(ctx: &mut CommandContext<'_>, args: &[Bytes], front: bool) -> CommandResult {
    let key = &args[1];
    let values = &args[2..];

    let len = match ctx.db.get_mut(key)? {
        Some(entity) => {
            let list = entity.as_list_mut()?;
            for value in values {
                if front {
                    list.push_front(value.clone());
                } else {
                    list.push_back(value.clone());
                }
            }
            list.len()
        }
        None => {
            let mut list = VecDeque::with_capacity(values.len());
            for value in values {
                if front {
                    list.push_front(value.clone());
                } else {
                    list.push_back(value.clone());
                }
            }
            let len = list.len();
            ctx.db.put(key.clone(), Entity::List(list))?;
            len
        }
    };

    ctx.propagate(args);
    Ok(RespValue::integer(len as i64))
}

fn pop(ctx: &mut CommandContext<'_>, args: &[Bytes], front: bool) -> CommandResult {
    let popped = match ctx.db.get_mut(&args[1])? {
        Some(entity) => {
            let list = entity.as_list_mut()?;
            if front {
                list.pop_front()
            } else {
                list.pop_back()
            }
        }
        None => None,
    };

    match popped {
        Some(value) => {
            ctx.propagate(args);
            Ok(RespValue::bulk_string(value))
        }
        None => Ok(RespValue::null()),
    }
}

/// LPUSH key value [value ...]
fn cmd_lpush(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    push(ctx, args, true)
}

/// RPUSH key value [value ...]
fn cmd_rpush(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    push(ctx, args, false)
}

/// LPOP key
fn cmd_lpop(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    pop(ctx, args, true)
}

/// RPOP key
fn cmd_rpop(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    pop(ctx, args, false)
}

/// LLEN key
fn cmd_llen(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let len = match ctx.db.get(&args[1])? {
        Some(entity) => entity.as_list()?.len(),
        None => 0,
    };
    Ok(RespValue::integer(len as i64))
}

/// LINDEX key index
fn cmd_lindex(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let index = parse_i64(&args[2])?;
    let Some(entity) = ctx.db.get(&args[1])? else {
        return Ok(RespValue::null());
    };
    let list = entity.as_list()?;
    Ok(match resolve_index(index, list.len()).and_then(|i| list.get(i)) {
        Some(value) => RespValue::bulk_string(value.clone()),
        None => RespValue::null(),
    })
}

/// LRANGE key start stop
fn cmd_lrange(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let start = parse_i64(&args[2])?;
    let stop = parse_i64(&args[3])?;
    let Some(entity) = ctx.db.get(&args[1])? else {
        return Ok(RespValue::array(Vec::new()));
    };
    let list = entity.as_list()?;
    let items = match resolve_range(start, stop, list.len()) {
        Some((start, stop)) => list.range(start..=stop).cloned().collect(),
        None => Vec::new(),
    };
    Ok(RespValue::bulk_array(items))
}
