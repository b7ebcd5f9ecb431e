//! Sampler worker: every `sampler_period`, reads the byte counters
//! `quota2` maintains per group chain and republishes the register if
//! anything changed. Never touches the chain graph — every read and
//! write here happens under the engine lock, the same lock the control
//! worker holds for the whole duration of a mutation.

use super::Engine;
use crate::codec::register;
use log::debug;
use std::fs;

/// Runs until shutdown. The first tick waits for startup to finish; every
/// tick after that waits out the full period.
pub fn run(engine: &Engine) {
    if !engine.wait_for_startup() {
        return;
    }

    loop {
        if engine.is_shutting_down() {
            return;
        }

        tick(engine);

        if !engine.interruptible_sleep(engine.config.sampler_period) {
            return;
        }
    }
}

/// Runs a single tick outside the normal period loop — used by `--once`
/// smoke-test mode after a synchronous `run_startup`.
pub fn tick_once(engine: &Engine) {
    tick(engine);
}

/// One sampling pass: re-reads every registered entry's byte counter,
/// updates `remaining_kib` in place, and persists the register only if the
/// serialized form actually changed.
///
/// This reads `p30_<gid>` for anchors and followers alike, per spec: a
/// follower shares its anchor's chain and counter, so its `remaining_kib`
/// tracks the same value, but the spec's sampler loop is specified
/// per-entry, not per-anchor, and `reported_kib()` is read for every
/// entry (e.g. building the usage payload), not just anchors.
fn tick(engine: &Engine) {
    let mut state = engine.state();

    for entry in state.registered.iter_mut() {
        let bytes = read_counter(&engine.config.counter_dir, entry.gid);
        entry.remaining_kib = Some(bytes >> 10);
    }

    let wire = register::serialize(&state.registered);
    if wire == state.last_serialized_register {
        return;
    }

    match engine.store.save(&state.registered) {
        Ok(()) => {
            debug!("-- -- register changed, persisted {} entries", state.registered.len());
            state.last_serialized_register = wire;
        }
        Err(e) => {
            log::warn!("## ## failed to persist register: {}", e);
        }
    }
}

/// Reads `<counter_dir>/p30_<gid>`'s accumulated byte count. A missing file
/// (chain not yet hit any traffic, or removed) reads as zero rather than an
/// error.
fn read_counter(counter_dir: &str, gid: u32) -> u64 {
    let path = format!("{}/p30_{}", counter_dir, gid);

    match fs::read_to_string(&path) {
        Ok(contents) => parse_counter(&contents),
        Err(_) => 0,
    }
}

/// `/proc/net/xt_quota/<name>` holds a single decimal integer: bytes
/// remaining against the quota2 match's counter.
fn parse_counter(contents: &str) -> u64 {
    contents.trim().parse().unwrap_or(0)
}
