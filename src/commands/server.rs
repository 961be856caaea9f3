//! Server commands: connection helpers, persistence triggers and `INFO`.

use super::flags::BLOCKING;
use super::{no_keys, parse_i64};
use super::{CommandContext, CommandTable};
use crate::error::{CommandError, CommandResult, PersistError};
use crate::persistence::{snapshot, PersisterState};
use crate::protocol::RespValue;
use crate::storage::Keyspace;
use bytes::Bytes;
use std::fmt::Write as _;
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

pub(super) fn register(table: &mut CommandTable) {
    table.register("ping", cmd_ping, -1, no_keys, 0);
    table.register("echo", cmd_echo, 2, no_keys, 0);
    table.register("select", cmd_select, 2, no_keys, 0);
    table.register("save", cmd_save, 1, no_keys, BLOCKING);
    table.register("bgsave", cmd_bgsave, 1, no_keys, BLOCKING);
    table.register("bgrewriteaof", cmd_bgrewriteaof, 1, no_keys, BLOCKING);
    table.register("info", cmd_info, -1, no_keys, 0);
}

// ============================================================================
// Connection helpers
// ============================================================================

/// PING [message]
fn cmd_ping(_ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    match args.len() {
        1 => Ok(RespValue::pong()),
        2 => Ok(RespValue::bulk_string(args[1].clone())),
        _ => Err(CommandError::WrongArity("ping".to_string())),
    }
}

/// ECHO message
fn cmd_echo(_ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    Ok(RespValue::bulk_string(args[1].clone()))
}

/// SELECT index
///
/// Only validates the index; the connection keeps track of its database.
fn cmd_select(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let index = parse_i64(&args[1])?;
    if index < 0 || index as usize >= ctx.keyspace.db_count() {
        return Err(CommandError::DbIndexOutOfRange);
    }
    Ok(RespValue::ok())
}

// ============================================================================
// Persistence
// ============================================================================

/// SAVE
fn cmd_save(ctx: &mut CommandContext<'_>, _args: &[Bytes]) -> CommandResult {
    let _guard = ctx
        .keyspace
        .begin_save()
        .ok_or_else(|| CommandError::Persistence("Background save already in progress".into()))?;
    snapshot::save(ctx.keyspace, &ctx.keyspace.config().snapshot_path())?;
    Ok(RespValue::ok())
}

/// BGSAVE
///
/// The keyspace is encoded under read locks before replying; only the file
/// write happens in the background.
fn cmd_bgsave(ctx: &mut CommandContext<'_>, _args: &[Bytes]) -> CommandResult {
    let guard = ctx
        .keyspace
        .begin_save()
        .ok_or_else(|| CommandError::Persistence("Background save already in progress".into()))?;
    let data = snapshot::encode_keyspace(ctx.keyspace, false)?;
    let path = ctx.keyspace.config().snapshot_path();

    thread::Builder::new()
        .name("bgsave".to_string())
        .spawn(move || {
            let _guard = guard;
            match snapshot::write_atomically(&path, &data) {
                Ok(bytes) => info!(path = %path.display(), bytes, "Background save finished"),
                Err(e) => error!(error = %e, "Background save failed"),
            }
        })
        .map_err(PersistError::from)?;

    Ok(RespValue::simple_string("Background saving started"))
}

/// BGREWRITEAOF
fn cmd_bgrewriteaof(ctx: &mut CommandContext<'_>, _args: &[Bytes]) -> CommandResult {
    let persister = ctx
        .keyspace
        .persister()
        .cloned()
        .ok_or_else(|| CommandError::Persistence("append only file is disabled".into()))?;
    if persister.state() == PersisterState::Rewriting {
        return Err(PersistError::RewriteInProgress.into());
    }

    let worker = Arc::clone(&persister);
    thread::Builder::new()
        .name("aof-rewrite".to_string())
        .spawn(move || {
            // Outcome is logged by the rewrite itself.
            let _ = worker.rewrite();
        })
        .map_err(PersistError::from)?;

    Ok(RespValue::simple_string(
        "Background append only file rewriting started",
    ))
}

// ============================================================================
// INFO
// ============================================================================

/// INFO [section]
fn cmd_info(ctx: &mut CommandContext<'_>, args: &[Bytes]) -> CommandResult {
    let section = match args.len() {
        1 => None,
        2 => Some(String::from_utf8_lossy(&args[1]).to_ascii_lowercase()),
        _ => return Err(CommandError::Syntax),
    };
    Ok(RespValue::bulk_string(render_info(
        ctx.keyspace,
        section.as_deref(),
    )))
}

/// Renders the `INFO` text. `None` renders every section.
pub fn render_info(keyspace: &Keyspace, section: Option<&str>) -> String {
    let wants = |name: &str| matches!(section, None | Some("all")) || section == Some(name);
    let config = keyspace.config();
    let mut out = String::new();

    if wants("server") {
        let _ = writeln!(out, "# Server\r");
        let _ = writeln!(out, "tidekv_version:{}\r", crate::VERSION);
        let _ = writeln!(out, "tcp_port:{}\r", config.port);
        let _ = writeln!(out, "uptime_in_seconds:{}\r", keyspace.uptime().as_secs());
        let _ = writeln!(out, "databases:{}\r", keyspace.db_count());
        let _ = writeln!(out, "\r");
    }

    if wants("persistence") {
        let persister = keyspace.persister();
        let _ = writeln!(out, "# Persistence\r");
        let _ = writeln!(out, "loading:{}\r", keyspace.is_loading() as u8);
        let _ = writeln!(out, "rdb_bgsave_in_progress:{}\r", keyspace.is_saving() as u8);
        let _ = writeln!(out, "aof_enabled:{}\r", persister.is_some() as u8);
        let _ = writeln!(
            out,
            "aof_rewrite_in_progress:{}\r",
            persister.map(|p| p.state() == PersisterState::Rewriting).unwrap_or(false) as u8
        );
        let _ = writeln!(out, "aof_fsync:{}\r", config.appendfsync.as_str());
        let _ = writeln!(out, "aof_use_rdb_preamble:{}\r", config.aof_use_rdb_preamble as u8);
        let _ = writeln!(out, "\r");
    }

    if wants("memory") {
        let _ = writeln!(out, "# Memory\r");
        let _ = writeln!(out, "used_memory:{}\r", keyspace.used_memory());
        let _ = writeln!(out, "maxmemory:{}\r", keyspace.maxmemory());
        let _ = writeln!(out, "maxmemory_policy:allkeys-lfu\r");
        let _ = writeln!(out, "maxmemory_samples:{}\r", keyspace.maxmemory_samples());
        let _ = writeln!(out, "\r");
    }

    if wants("stats") {
        let stats = keyspace.stats();
        let _ = writeln!(out, "# Stats\r");
        let _ = writeln!(out, "total_commands_processed:{}\r", stats.commands_processed());
        let _ = writeln!(out, "expired_keys:{}\r", stats.expired_keys());
        let _ = writeln!(out, "evicted_keys:{}\r", stats.evicted_keys());
        let _ = writeln!(out, "pending_expirations:{}\r", keyspace.scheduler().pending());
        let _ = writeln!(out, "\r");
    }

    if wants("keyspace") {
        let _ = writeln!(out, "# Keyspace\r");
        for db in keyspace.databases().iter().filter(|db| !db.is_empty()) {
            let _ = writeln!(
                out,
                "db{}:keys={},expires={}\r",
                db.index(),
                db.len(),
                db.expiring_len()
            );
        }
    }

    out
}
