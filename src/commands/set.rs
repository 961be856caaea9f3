//! Set commands.

use super::flags::{DENY_OOM, WRITE};
use super::{read_first_key, write_first_key};
use super::{CommandContext, CommandTable};
use crate::error::CommandResult;
use crate::protocol::RespValue;
use crate::storage::Entity;
use bytes::Bytes;
use std::collections::HashSet;

pub(super) fn register(table: &mut CommandTable) {
    table.register("sadd", cmd_sadd, -3, write_first_key, WRITE | DENY_OOM);
    table.register("srem", cmd_srem, -3, write_first_key, WRITE);
    table.register("sismember", cmd_sismember, 3, read_first_key, 0);
    table.register("smembers", cmd_smembers, 2, read_first_key, 0);
    table.register("scard", cmd_scard, 2, read_first_key, 0);
}

/// SADD key member [member ...]
fn cmd_sadd(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let key = &args[1];
    let members = &args[2..];

    let added = match ctx.db.get_mut(key)? {
        Some(entity) => {
            let set = entity.as_set_mut()?;
            members.iter().filter(|m| set.insert((*m).clone())).count()
        }
        None => {
            let set: HashSet<Bytes> = members.iter().cloned().collect();
            let added = set.len();
            ctx.db.put(key.clone(), Entity::Set(set))?;
            added
        }
    };

    if added > 0 {
        ctx.propagate(args);
    }
    Ok(RespValue::integer(added as i64))
}

/// SREM key member [member ...]
fn cmd_srem(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let removed = match ctx.db.get_mut(&args[1])? {
        Some(entity) => {
            let set = entity.as_set_mut()?;
            args[2..].iter().filter(|m| set.remove(*m)).count()
        }
        None => 0,
    };
    if removed > 0 {
        ctx.propagate(args);
    }
    Ok(RespValue::integer(removed as i64))
}

/// SISMEMBER key member
fn cmd_sismember(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let found = match ctx.db.get(&args[1])? {
        Some(entity) => entity.as_set()?.contains(&args[2]),
        None => false,
    };
    Ok(RespValue::integer(found as i64))
}

/// SMEMBERS key
///
/// Members are returned sorted.
fn cmd_smembers(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let mut members: Vec<Bytes> = match ctx.db.get(&args[1])? {
        Some(entity) => entity.as_set()?.iter().cloned().collect(),
        None => Vec::new(),
    };
    members.sort();
    Ok(RespValue::bulk_array(members))
}

/// SCARD key
fn cmd_scard(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let len = match ctx.db.get(&args[1])? {
        Some(entity) => entity.as_set()?.len(),
        None => 0,
    };
    Ok(RespValue::integer(len as i64))
}
