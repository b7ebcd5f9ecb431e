//! Control worker: resolves device identity, then loops posting usage to
//! the control server and applying whatever restriction command comes
//! back. Every mutation below holds the engine lock for its full
//! duration.

use super::Engine;
use crate::codec::{self, UsageGroup};
use crate::error::ControlError;
use crate::model::{group_chain_name, Package, RegisteredEntry, HOOK_CHAIN, UNRESOLVED_GID};
use log::{debug, error, info, warn};
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use std::collections::HashMap;

/// Device identity decoded from `configdata`.
struct Identity {
    serial: String,
    brand: String,
    model: String,
}

pub fn run(engine: &Engine) {
    if !engine.wait_for_startup() {
        return;
    }

    let identity = match resolve_identity(engine) {
        Some(id) => id,
        None => {
            info!("-- -- no usable device identity, control loop exiting quietly");
            return;
        }
    };

    loop {
        if engine.is_shutting_down() {
            return;
        }

        match run_round(engine, &identity) {
            Ok(()) => {}
            Err(e) if e.is_connectivity_class() => {
                warn!("-- -- control round failed, retrying: {}", e);
                if !engine.interruptible_sleep(engine.config.control_retry_interval) {
                    return;
                }
                continue;
            }
            Err(e) => {
                error!("## ## control round failed fatally, control loop exiting: {}", e);
                return;
            }
        }

        if !engine.interruptible_sleep(engine.config.control_retry_interval) {
            return;
        }
    }
}

/// Polls `configdata_path` on the same 120×5s schedule as the package
/// table, decoding and validating the serial.
fn resolve_identity(engine: &Engine) -> Option<Identity> {
    for attempt in 0..engine.config.poll_attempts {
        if engine.is_shutting_down() {
            return None;
        }

        if let Ok(encoded) = std::fs::read_to_string(&engine.config.configdata_path) {
            if let Some((serial, brand, model)) = codec::decode_configdata(&encoded) {
                if codec::is_valid_serial(&serial) {
                    return Some(Identity { serial, brand, model });
                }
                warn!("## ## configdata decoded but serial '{}' failed validation", serial);
                return None;
            }
        }

        warn!(
            "-- -- configdata not yet readable/decodable (attempt {}/{})",
            attempt + 1,
            engine.config.poll_attempts
        );
        if !engine.interruptible_sleep(engine.config.poll_interval) {
            return None;
        }
    }

    None
}

/// Runs a single identity-resolve-then-round pass, non-blocking and
/// non-retrying — used by `--once` smoke-test mode after a synchronous
/// `run_startup`. Unlike the normal loop, a missing/invalid `configdata`
/// or a connectivity-class error simply returns instead of polling.
pub fn round_once(engine: &Engine) {
    let encoded = match std::fs::read_to_string(&engine.config.configdata_path) {
        Ok(encoded) => encoded,
        Err(e) => {
            warn!("-- -- configdata not readable, skipping control round: {}", e);
            return;
        }
    };

    let identity = match codec::decode_configdata(&encoded) {
        Some((serial, brand, model)) if codec::is_valid_serial(&serial) => {
            Identity { serial, brand, model }
        }
        _ => {
            warn!("## ## configdata present but invalid, skipping control round");
            return;
        }
    };

    if let Err(e) = run_round(engine, &identity) {
        warn!("-- -- control round failed: {}", e);
    }
}

fn run_round(engine: &Engine, identity: &Identity) -> Result<(), ControlError> {
    let payload = build_payload(engine);

    let response = post_usage(engine, identity, &payload)?;
    let headers = parse_dw_headers(&response);

    let message = headers.get("dw-message").map(String::as_str).unwrap_or("");
    let error_code = headers.get("dw-error").map(String::as_str).unwrap_or("");

    if !message.contains("Success") || !error_code.contains('0') {
        debug!("-- -- control response not actionable: dw-message='{}' dw-error='{}'", message, error_code);
        return Ok(());
    }

    if let Some(user_message) = headers.get("dw-usermessage") {
        info!("control server message: {}", user_message);
    }

    match headers.get("dw-restrict").map(String::as_str) {
        Some("no") => apply_no_restriction(engine),
        Some("new") => {
            let usageinfo = headers.get("dw-usageinfo").map(String::as_str).unwrap_or("");
            // A completely unparseable payload is a malformed record, not an
            // instruction to restrict to the empty set: skip the teardown
            // rather than discard a working `Registered` set for garbage.
            if codec::parse_usageinfo(usageinfo).is_empty() {
                debug!("-- -- 'new' restrict with unparseable usageinfo, ignoring round");
            } else {
                apply_no_restriction(engine);
                apply_add(engine, usageinfo);
            }
        }
        Some("add") => apply_add(engine, headers.get("dw-usageinfo").map(String::as_str).unwrap_or("")),
        Some("rem") => apply_rem(engine, headers.get("dw-usageinfo").map(String::as_str).unwrap_or("")),
        _ => {}
    }

    Ok(())
}

/// Builds the outbound usage payload: one record per gid present in
/// `Registered`, using the anchor's reported (remaining) quota.
fn build_payload(engine: &Engine) -> String {
    let state = engine.state();

    let mut by_gid: HashMap<u32, (Vec<String>, u64)> = HashMap::new();
    for entry in state.registered.iter() {
        let bucket = by_gid.entry(entry.gid).or_insert_with(|| (Vec::new(), entry.reported_kib()));
        bucket.0.push(entry.package.clone());
        if entry.is_anchor() {
            bucket.1 = entry.reported_kib();
        }
    }

    let groups: Vec<(Vec<String>, u64)> = by_gid.into_values().collect();
    codec::build_usage_payload(groups.iter().map(|(pkgs, kib)| (pkgs.as_slice(), *kib)))
}

fn post_usage(engine: &Engine, identity: &Identity, payload: &str) -> Result<reqwest::blocking::Response, ControlError> {
    let oldinfo = if payload.is_empty() { "no" } else { "yes" };

    let body = format!(
        "clientid=dwtablet&action=submit&data={}&compression=no&oldinfo={}&serialid={}&brand={}&model={}",
        codec::url_encode(payload),
        oldinfo,
        codec::url_encode(&identity.serial),
        codec::url_encode(&identity.brand),
        codec::url_encode(&identity.model),
    );

    let client = Client::new();
    let response = client
        .post(&engine.config.control_endpoint)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header("User-Agent", "libcurl-agent/1.0")
        .body(body)
        .send()?;

    Ok(response)
}

/// Recognized `dw-<key>: <value>` lines, read from the response *headers*
/// — not the body. If the server ever moves them to the body, this
/// silently returns empty.
fn parse_dw_headers(response: &reqwest::blocking::Response) -> HashMap<String, String> {
    const RECOGNIZED: &[&str] = &[
        "dw-message",
        "dw-error",
        "dw-usageinfo",
        "dw-compression",
        "dw-usermessage",
        "dw-restrict",
    ];

    let mut out = HashMap::new();
    for key in RECOGNIZED {
        if let Some(value) = response.headers().get(*key) {
            if let Ok(value) = value.to_str() {
                out.insert((*key).to_owned(), value.to_owned());
            }
        }
    }
    out
}

/// `dw-restrict: no` — lift every restriction. The bootstrap DNS-accept
/// and catch-all-REJECT rules are discarded by the subsequent
/// `flushChain(p30dw)` — a deliberately preserved quirk, not a bug to fix.
fn apply_no_restriction(engine: &Engine) {
    let mut state = engine.state();

    for entry in state.registered.iter() {
        if entry.uid > 0 {
            engine.driver.delete_rule(
                HOOK_CHAIN,
                &["-m", "owner", "--uid-owner", &entry.uid.to_string(), "-j", &entry.group_chain()],
            );
        }
        if entry.is_anchor() {
            engine.driver.destroy_chain(&entry.group_chain());
        }
    }

    state.registered.clear();
    drop(state);

    engine.driver.flush_chain(HOOK_CHAIN);
    engine.driver.insert_at_head(HOOK_CHAIN, 1, &["-j", "ACCEPT"]);
}

/// `dw-restrict: add` — parse `usageinfo`, resolve each group against the
/// installed package table, and install chains/rules for whatever is new
/// as they're discovered.
fn apply_add(engine: &Engine, usageinfo: &str) {
    let groups = codec::parse_usageinfo(usageinfo);
    if groups.is_empty() {
        return;
    }

    let mut new_entries = Vec::new();
    {
        let state = engine.state();
        for group in &groups {
            new_entries.extend(entries_for_group(&state.packages, group));
        }
    }

    if new_entries.is_empty() {
        return;
    }

    // First pass: anchors create their chain before any follower references it.
    for entry in new_entries.iter().filter(|e| e.is_anchor()) {
        install_anchor_chain(engine, entry);
    }

    // Second pass: every resolved, uid>0 entry gets a follower rule — the
    // anchor included.
    for entry in new_entries.iter().filter(|e| e.is_resolved() && e.uid > 0) {
        engine.driver.insert_at_head(
            HOOK_CHAIN,
            1,
            &["-m", "owner", "--uid-owner", &entry.uid.to_string(), "-j", &entry.group_chain()],
        );
    }

    engine.state().registered.extend(new_entries);
}

/// Resolves every package in a group against the installed table: the
/// first package that resolves supplies the shared gid *and* becomes the
/// group's anchor (the sole chain-owning entry); every package in the
/// group (resolved or not) becomes its own `Registered` entry. The anchor
/// pick is independent of `uid == gid` — in a shared-uid group every
/// package's resolved uid equals the shared gid, so that equality alone
/// cannot tell anchor from follower.
fn entries_for_group(packages: &[Package], group: &UsageGroup) -> Vec<RegisteredEntry> {
    let anchor_idx = group
        .packages
        .iter()
        .position(|pkg| resolve(packages, pkg).is_some());

    let anchor_idx = match anchor_idx {
        Some(idx) => idx,
        None => return Vec::new(),
    };
    let gid = resolve(packages, &group.packages[anchor_idx]).unwrap();

    group
        .packages
        .iter()
        .enumerate()
        .map(|(i, pkg)| RegisteredEntry {
            package: pkg.clone(),
            uid: resolve(packages, pkg).unwrap_or(UNRESOLVED_GID),
            gid,
            quota_kib: group.quota_kib,
            remaining_kib: None,
            anchor: i == anchor_idx,
        })
        .collect()
}

fn resolve(packages: &[Package], reported_name: &str) -> Option<u32> {
    packages.iter().find(|p| p.name.contains(reported_name)).map(|p| p.uid)
}

fn install_anchor_chain(engine: &Engine, entry: &RegisteredEntry) {
    let chain = group_chain_name(entry.gid);
    engine.driver.new_chain(&chain);

    let bytes = (entry.quota_kib << 10).to_string();
    engine.driver.append_to_chain(
        &chain,
        &["-m", "quota2", "!", "--quota", &bytes, "--name", &chain, "-j", "REJECT"],
    );
    engine.driver.append_to_chain(&chain, &["-j", "ACCEPT"]);
}

/// `dw-restrict: rem` — remove the listed packages, destroying a group
/// chain only once nothing else still references its gid.
fn apply_rem(engine: &Engine, usageinfo: &str) {
    let groups = codec::parse_usageinfo(usageinfo);
    let names: Vec<String> = groups.into_iter().flat_map(|g| g.packages).collect();
    if names.is_empty() {
        return;
    }

    let mut state = engine.state();

    for name in &names {
        let idx = match state.registered.iter().position(|e| &e.package == name) {
            Some(idx) => idx,
            None => continue,
        };
        let entry = state.registered.remove(idx);

        if entry.uid > 0 {
            engine.driver.delete_rule(
                HOOK_CHAIN,
                &["-m", "owner", "--uid-owner", &entry.uid.to_string(), "-j", &entry.group_chain()],
            );
        }

        if !entry.is_anchor() {
            continue;
        }

        // The removed entry owned the chain. If a sibling still shares
        // its gid, the chain stays alive — promote the first remaining
        // sibling to anchor so exactly one entry keeps owning it (and
        // future rem/reporting logic has an anchor to find).
        match state.registered.iter_mut().find(|e| e.gid == entry.gid) {
            Some(successor) => successor.anchor = true,
            None => engine.driver.destroy_chain(&entry.group_chain()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fw::tests::RecordingDriver;
    use crate::model::Package;
    use std::sync::Arc;

    fn test_engine() -> (Engine, Arc<RecordingDriver>) {
        let recorder = Arc::new(RecordingDriver::new());
        let engine = Engine {
            config: Config::default(),
            driver: Arc::clone(&recorder) as Arc<dyn crate::fw::FwDriver + Send + Sync>,
            store: crate::store::QuotaStore::new(std::env::temp_dir().join(format!(
                "control-test-qtareg-{:?}",
                std::thread::current().id()
            ))),
            state: std::sync::Mutex::new(super::super::EngineState::new()),
            startup_done: std::sync::Mutex::new(true),
            startup_cv: std::sync::Condvar::new(),
            shutdown: std::sync::atomic::AtomicBool::new(false),
        };
        (engine, recorder)
    }

    #[test]
    fn apply_add_creates_anchor_then_followers() {
        let (engine, recorder) = test_engine();
        engine.state().packages.push(Package { name: "com.example.a".into(), uid: 10050 });
        engine.state().packages.push(Package { name: "com.example.b".into(), uid: 10051 });

        apply_add(&engine, " com.example.a 20480,com.example.b 10240,");

        let state = engine.state();
        assert_eq!(state.registered.len(), 2);
        assert!(state.registered.iter().all(|e| e.is_anchor()));

        let calls = recorder.calls();
        assert!(calls.iter().any(|c| c == "-N p30_10050"));
        assert!(calls.iter().any(|c| c == "-N p30_10051"));
    }

    #[test]
    fn apply_add_shares_gid_within_a_group() {
        let (engine, recorder) = test_engine();
        engine.state().packages.push(Package { name: "com.g.x".into(), uid: 10100 });
        engine.state().packages.push(Package { name: "com.g.y".into(), uid: 10100 });

        apply_add(&engine, "com.g.x com.g.y 5120,");

        let state = engine.state();
        assert_eq!(state.registered.len(), 2);
        assert!(state.registered.iter().all(|e| e.gid == 10100));

        // Both entries have uid == gid (shared-uid group), but exactly
        // one of them is the anchor.
        assert!(state.registered.iter().all(|e| e.uid == e.gid));
        assert_eq!(state.registered.iter().filter(|e| e.is_anchor()).count(), 1);

        let new_chain_calls = recorder.calls().into_iter().filter(|c| c == "-N p30_10100").count();
        assert_eq!(new_chain_calls, 1, "only the first-resolving package should attempt chain creation");
    }

    #[test]
    fn apply_no_restriction_clears_registered_and_reopens_hook() {
        let (engine, recorder) = test_engine();
        engine.state().registered.push(RegisteredEntry {
            package: "com.example.a".into(),
            uid: 10050,
            gid: 10050,
            quota_kib: 20480,
            remaining_kib: None,
            anchor: true,
        });

        apply_no_restriction(&engine);

        assert!(engine.state().registered.is_empty());
        let calls = recorder.calls();
        assert!(calls.iter().any(|c| c == "-F p30_10050"));
        assert!(calls.iter().any(|c| c == "-X p30_10050"));
        assert!(calls.iter().any(|c| c == "-F p30dw"));
        assert!(calls.iter().any(|c| c == "-I p30dw 1 -j ACCEPT"));
    }

    #[test]
    fn apply_rem_keeps_other_entries_sharing_gid() {
        let (engine, recorder) = test_engine();
        engine.state().registered.push(RegisteredEntry {
            package: "com.g.x".into(),
            uid: 10100,
            gid: 10100,
            quota_kib: 5120,
            remaining_kib: None,
            anchor: true,
        });
        engine.state().registered.push(RegisteredEntry {
            package: "com.g.y".into(),
            uid: 10100,
            gid: 10100,
            quota_kib: 5120,
            remaining_kib: None,
            anchor: false,
        });

        apply_rem(&engine, "com.g.x 0,");

        let state = engine.state();
        assert_eq!(state.registered.len(), 1);
        assert_eq!(state.registered[0].package, "com.g.y");

        // chain must survive: com.g.y still references gid 10100, and it
        // inherits the anchor role from the removed entry.
        assert!(!recorder.calls().iter().any(|c| c == "-X p30_10100"));
        assert!(state.registered[0].is_anchor());
    }

    #[test]
    fn new_with_unparseable_usageinfo_leaves_state_untouched() {
        let (engine, recorder) = test_engine();
        engine.state().registered.push(RegisteredEntry {
            package: "com.example.a".into(),
            uid: 10050,
            gid: 10050,
            quota_kib: 20480,
            remaining_kib: None,
            anchor: true,
        });

        let usageinfo = "garbage";
        if codec::parse_usageinfo(usageinfo).is_empty() {
            // mirrors the guard in run_round
        } else {
            apply_no_restriction(&engine);
            apply_add(&engine, usageinfo);
        }

        assert_eq!(engine.state().registered.len(), 1);
        assert!(recorder.calls().is_empty());
    }

    #[test]
    fn apply_rem_destroys_chain_once_last_reference_is_gone() {
        let (engine, recorder) = test_engine();
        engine.state().registered.push(RegisteredEntry {
            package: "com.example.a".into(),
            uid: 10050,
            gid: 10050,
            quota_kib: 20480,
            remaining_kib: None,
            anchor: true,
        });

        apply_rem(&engine, "com.example.a 0,");

        assert!(engine.state().registered.is_empty());
        assert!(recorder.calls().iter().any(|c| c == "-X p30_10050"));
    }
}
