//! Sorted set commands.

use super::flags::{DENY_OOM, WRITE};
use super::{parse_f64, parse_i64, read_first_key, resolve_range, write_first_key};
use super::{CommandContext, CommandTable};
use crate::error::{CommandError, CommandResult};
use crate::protocol::RespValue;
use crate::storage::{format_score, Entity, SortedSet};
use bytes::Bytes;

pub(super) fn register(table: &mut CommandTable) {
    table.register("zadd", cmd_zadd, -4, write_first_key, WRITE | DENY_OOM);
    table.register("zscore", cmd_zscore, 3, read_first_key, 0);
    table.register("zrem", cmd_zrem, -3, write_first_key, WRITE);
    table.register("zcard", cmd_zcard, 2, read_first_key, 0);
    table.register("zrange", cmd_zrange, -4, read_first_key, 0);
}

/// ZADD key score member [score member ...]
///
/// Every score is validated before anything is written.
fn cmd_zadd(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    if args.len() % 2 != 0 {
        return Err(CommandError::Syntax);
    }
    let key = &args[1];
    let pairs = args[2..]
        .chunks(2)
        .map(|pair| -> Result<(f64, Bytes), CommandError> {
            Ok((parse_f64(&pair[0])?, pair[1].clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let added = match ctx.db.get_mut(key)? {
        Some(entity) => {
            let zset = entity.as_zset_mut()?;
            pairs
                .into_iter()
                .filter(|(score, member)| zset.insert(member.clone(), *score))
                .count()
        }
        None => {
            let mut zset = SortedSet::new();
            let added = pairs
                .into_iter()
                .filter(|(score, member)| zset.insert(member.clone(), *score))
                .count();
            ctx.db.put(key.clone(), Entity::ZSet(zset))?;
            added
        }
    };

    ctx.propagate(args);
    Ok(RespValue::integer(added as i64))
}

/// ZSCORE key member
fn cmd_zscore(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let score = match ctx.db.get(&args[1])? {
        Some(entity) => entity.as_zset()?.score(&args[2]),
        None => None,
    };
    Ok(match score {
        Some(score) => RespValue::bulk_string(format_score(score)),
        None => RespValue::null(),
    })
}

/// ZREM key member [member ...]
fn cmd_zrem(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let removed = match ctx.db.get_mut(&args[1])? {
        Some(entity) => {
            let zset = entity.as_zset_mut()?;
            args[2..].iter().filter(|m| zset.remove(m)).count()
        }
        None => 0,
    };
    if removed > 0 {
        ctx.propagate(args);
    }
    Ok(RespValue::integer(removed as i64))
}

/// ZCARD key
fn cmd_zcard(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let len = match ctx.db.get(&args[1])? {
        Some(entity) => entity.as_zset()?.len(),
        None => 0,
    };
    Ok(RespValue::integer(len as i64))
}

/// ZRANGE key start stop [WITHSCORES]
fn cmd_zrange(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let start = parse_i64(&args[2])?;
    let stop = parse_i64(&args[3])?;
    let with_scores = match args.get(4) {
        None => false,
        Some(opt) if opt.eq_ignore_ascii_case(b"WITHSCORES") && args.len() == 5 => true,
        Some(_) => return Err(CommandError::Syntax),
    };

    let Some(entity) = ctx.db.get(&args[1])? else {
        return Ok(RespValue::array(Vec::new()));
    };
    let zset = entity.as_zset()?;
    let Some((start, stop)) = resolve_range(start, stop, zset.len()) else {
        return Ok(RespValue::array(Vec::new()));
    };

    let mut reply = Vec::new();
    for (member, score) in zset.range_by_rank(start, stop) {
        reply.push(RespValue::bulk_string(member));
        if with_scores {
            reply.push(RespValue::bulk_string(format_score(score)));
        }
    }
    Ok(RespValue::array(reply))
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
    fn test_zadd_and_range() {
        let ks = Keyspace::new(&Config::default());
        assert_eq!(
            run(&ks, &["ZADD", "z", "2", "b", "1", "a", "3", "c"]),
            Ok(RespValue::integer(3))
        );
        assert_eq!(run(&ks, &["ZADD", "z", "0.5", "c"]), Ok(RespValue::integer(0)));
        assert_eq!(
            run(&ks, &["ZRANGE", "z", "0", "-1"]),
            Ok(RespValue::bulk_array(cmd_line(&["c", "a", "b"])))
        );
        assert_eq!(
            run(&ks, &["ZRANGE", "z", "0", "0", "WITHSCORES"]),
            Ok(RespValue::bulk_array(cmd_line(&["c", "0.5"])))
        );
        assert_eq!(run(&ks, &["ZRANGE", "z", "0", "0", "BOGUS"]), Err(CommandError::Syntax));
    }

    #[test]
    fn test_zadd_validates_before_writing() {
        let ks = Keyspace::new(&Config::default());
        assert_eq!(
            run(&ks, &["ZADD", "z", "1", "a", "oops", "b"]),
            Err(CommandError::NotFloat)
        );
        assert_eq!(run(&ks, &["EXISTS", "z"]), Ok(RespValue::integer(0)));
        assert_eq!(run(&ks, &["ZADD", "z", "1", "a", "2"]), Err(CommandError::Syntax));
    }

    #[test]
    fn test_zscore_and_zrem() {
        let ks = Keyspace::new(&Config::default());
        run(&ks, &["ZADD", "z", "-inf", "low", "1.5", "mid"]).unwrap();
        assert_eq!(
            run(&ks, &["ZSCORE", "z", "low"]),
            Ok(RespValue::bulk_string(Bytes::from_static(b"-inf")))
        );
        assert_eq!(
            run(&ks, &["ZSCORE", "z", "mid"]),
            Ok(RespValue::bulk_string(Bytes::from_static(b"1.5")))
        );
        assert_eq!(run(&ks, &["ZREM", "z", "low", "nope"]), Ok(RespValue::integer(1)));
        assert_eq!(run(&ks, &["ZCARD", "z"]), Ok(RespValue::integer(1)));
        assert_eq!(run(&ks, &["ZREM", "z", "mid"]), Ok(RespValue::integer(1)));
        assert_eq!(run(&ks, &["EXISTS", "z"]), Ok(RespValue::integer(0)));
    }
}
