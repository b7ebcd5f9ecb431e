//! `PolicyEngine` startup sequence: precondition probe, bootstrap rules,
//! package table load, register rehydration, then signal the sampler to
//! begin.

use super::Engine;
use crate::model::{
    group_chain_name, Package, RegisteredEntry, HOOK_CHAIN, SYSTEM_CHAIN, SYSTEM_GID,
    SYSTEM_QUOTA_KIB, UNRESOLVED_GID,
};
use log::{error, info, warn};

/// Substring the `android.gsf` package hook checks for.
const GSF_MARKER: &str = "android.gsf";

/// Runs the full startup sequence. Returns `true` if the engine bootstrapped
/// successfully and the sampler was signalled to start; `false` if the
/// precondition hook never appeared or the bootstrap transaction failed —
/// in both cases the daemon process stays up but the engine does nothing
/// further.
pub fn run_startup(engine: &Engine) -> bool {
    if !probe_precondition(engine) {
        error!(
            "## ## precondition hook '{}' never appeared after {} attempts, engine exiting",
            HOOK_CHAIN, engine.config.poll_attempts
        );
        return false;
    }

    if !bootstrap_rules(engine) {
        error!("## ## bootstrap rule installation failed, engine exiting");
        return false;
    }

    load_package_table(engine);
    rehydrate_register(engine);

    engine.signal_startup_complete();
    info!("startup complete, sampler signalled");
    true
}

/// Polls `listOutputChain()` until `p30dw` appears or the attempt budget is
/// exhausted.
fn probe_precondition(engine: &Engine) -> bool {
    for attempt in 0..engine.config.poll_attempts {
        if engine.is_shutting_down() {
            return false;
        }

        let output = engine.driver.list_output_chain();
        if output.contains(HOOK_CHAIN) {
            return true;
        }

        warn!(
            "-- -- precondition hook not yet present (attempt {}/{})",
            attempt + 1,
            engine.config.poll_attempts
        );

        if !engine.interruptible_sleep(engine.config.poll_interval) {
            return false;
        }
    }

    false
}

/// Creates `p30_1000`, wires up `p30dw`'s bootstrap rules, and installs the
/// 100 MiB system guard. A nonzero accumulator aborts
/// the whole transaction before package-table loading begins.
fn bootstrap_rules(engine: &Engine) -> bool {
    let driver = engine.driver.as_ref();
    let mut result = 0;

    result |= driver.new_chain(SYSTEM_CHAIN);

    result |= driver.append_to_chain(
        HOOK_CHAIN,
        &["-m", "owner", "--uid-owner", "0", "-j", SYSTEM_CHAIN],
    );
    result |= driver.append_to_chain(
        HOOK_CHAIN,
        &[
            "-m",
            "owner",
            "--uid-owner",
            &SYSTEM_GID.to_string(),
            "-j",
            SYSTEM_CHAIN,
        ],
    );
    result |= driver.append_to_chain(
        HOOK_CHAIN,
        &["-p", "udp", "--sport", "53", "-j", "ACCEPT"],
    );
    result |= driver.append_to_chain(
        HOOK_CHAIN,
        &["-p", "udp", "--dport", "53", "-j", "ACCEPT"],
    );
    result |= driver.append_to_chain(
        HOOK_CHAIN,
        &["-j", "REJECT", "--reject-with", "icmp-net-prohibited"],
    );

    let quota_str = SYSTEM_QUOTA_KIB.to_string();
    result |= driver.append_to_chain(
        SYSTEM_CHAIN,
        &["-m", "quota2", "--quota", &quota_str, "-j", "ACCEPT"],
    );

    result == 0
}

/// Polls `packages.list` with the same 120×5s schedule and parses
/// whitespace-separated `<name> <uid> …` pairs, ignoring malformed lines.
/// While scanning, an `android.gsf` package gets a one-shot head rule into
/// `p30_1000`.
fn load_package_table(engine: &Engine) {
    for attempt in 0..engine.config.poll_attempts {
        if engine.is_shutting_down() {
            return;
        }

        match std::fs::read_to_string(&engine.config.packages_list_path) {
            Ok(contents) => {
                install_package_table(engine, &contents);
                return;
            }
            Err(e) => {
                warn!(
                    "-- -- packages.list not yet readable (attempt {}/{}): {}",
                    attempt + 1,
                    engine.config.poll_attempts,
                    e
                );
                if !engine.interruptible_sleep(engine.config.poll_interval) {
                    return;
                }
            }
        }
    }

    error!("## ## packages.list never became readable, starting with an empty package table");
}

fn install_package_table(engine: &Engine, contents: &str) {
    let mut packages = Vec::new();

    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        let name = match fields.next() {
            Some(n) => n,
            None => continue,
        };
        let uid: u32 = match fields.next().and_then(|u| u.parse().ok()) {
            Some(u) => u,
            None => continue,
        };

        if name.contains(GSF_MARKER) && !engine.state().gsf_hook_installed {
            engine.driver.insert_at_head(
                HOOK_CHAIN,
                1,
                &["-m", "owner", "--uid-owner", &uid.to_string(), "-j", SYSTEM_CHAIN],
            );
            engine.state().gsf_hook_installed = true;
        }

        packages.push(Package {
            name: name.to_owned(),
            uid,
        });
    }

    info!("loaded {} packages", packages.len());
    engine.state().packages = packages;
}

/// Loads the persisted register, resolves uid/gid by substring match
/// against the installed package table, and installs chains in two passes
/// — anchors first so no follower ever points at a missing chain.
fn rehydrate_register(engine: &Engine) {
    let loaded = engine.store.load();
    if loaded.is_empty() {
        return;
    }

    let mut entries = Vec::with_capacity(loaded.len());
    {
        let state = engine.state();
        for mut entry in loaded {
            if let Some(uid) = state.resolve_uid(&entry.package) {
                entry.uid = uid;
                if entry.gid == UNRESOLVED_GID {
                    entry.gid = uid;
                }
            }
            entries.push(entry);
        }
    }

    // The wire format carries no anchor bit (see model.rs), so it has to
    // be reconstructed here: per gid, the first entry whose own uid
    // equals that gid becomes the anchor. A shared-uid group can have
    // several entries satisfying `uid == gid`; only the first one (file
    // order) is picked, so the chain is still created exactly once.
    let mut anchor_gid_seen = std::collections::HashSet::new();
    for entry in entries.iter_mut() {
        entry.anchor =
            entry.is_resolved() && entry.uid == entry.gid && anchor_gid_seen.insert(entry.gid);
    }

    // First pass: anchors, so chains exist before any follower references them.
    for entry in entries.iter().filter(|e| e.is_anchor()) {
        install_anchor_chain(engine, entry);
    }

    // Second pass: followers. `uid > 0` guard — an entry whose own
    // package never resolved keeps gid from its group but must never
    // emit a `--uid-owner 0` rule.
    for entry in entries.iter().filter(|e| e.is_resolved() && !e.is_anchor() && e.uid > 0) {
        engine.driver.insert_at_head(
            HOOK_CHAIN,
            1,
            &[
                "-m",
                "owner",
                "--uid-owner",
                &entry.uid.to_string(),
                "-j",
                &entry.group_chain(),
            ],
        );
    }

    engine.state().registered = entries;
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

    engine.driver.insert_at_head(
        HOOK_CHAIN,
        1,
        &["-m", "owner", "--uid-owner", &entry.uid.to_string(), "-j", &chain],
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fw::tests::RecordingDriver;
    use crate::model::RegisteredEntry;
    use std::sync::Arc;

    fn test_engine() -> (Engine, Arc<RecordingDriver>) {
        let recorder = Arc::new(RecordingDriver::new());
        let engine = Engine {
            config: Config::default(),
            driver: Arc::clone(&recorder) as Arc<dyn crate::fw::FwDriver + Send + Sync>,
            store: crate::store::QuotaStore::new(std::env::temp_dir().join(format!(
                "startup-test-qtareg-{:?}",
                std::thread::current().id()
            ))),
            state: std::sync::Mutex::new(super::super::EngineState::new()),
            startup_done: std::sync::Mutex::new(false),
            startup_cv: std::sync::Condvar::new(),
            shutdown: std::sync::atomic::AtomicBool::new(false),
        };
        (engine, recorder)
    }

    #[test]
    fn precondition_succeeds_once_hook_present() {
        let (engine, recorder) = test_engine();
        recorder.set_probe_output("Chain OUTPUT (policy ACCEPT)\ntarget  prot opt source  destination\np30dw\n");

        assert!(probe_precondition(&engine));
    }

    #[test]
    fn bootstrap_installs_system_chain_and_hook_rules() {
        let (engine, recorder) = test_engine();
        assert!(bootstrap_rules(&engine));

        let calls = recorder.calls();
        assert!(calls.iter().any(|c| c == "-N p30_1000"));
        assert!(calls.iter().any(|c| c.contains("--uid-owner 0") && c.contains("p30_1000")));
        assert!(calls.iter().any(|c| c.contains("--sport 53")));
        assert!(calls.iter().any(|c| c.contains("icmp-net-prohibited")));
    }

    #[test]
    fn gsf_package_gets_one_shot_head_rule() {
        let (engine, recorder) = test_engine();
        install_package_table(&engine, "com.android.gsf.login 10021\ncom.example.a 10050\n");

        assert_eq!(engine.state().packages.len(), 2);
        assert!(engine.state().gsf_hook_installed);

        let calls = recorder.calls();
        assert!(calls.iter().any(|c| c.starts_with("-I p30dw 1")));
    }

    #[test]
    fn rehydrate_installs_anchors_before_followers() {
        let (engine, _recorder) = test_engine();
        install_package_table(&engine, "com.g.x 10100\ncom.g.y 10100\n");

        engine
            .store
            .save(&[
                RegisteredEntry {
                    package: "com.g.x".into(),
                    uid: 0,
                    gid: 10100,
                    quota_kib: 5120,
                    remaining_kib: None,
                    anchor: false,
                },
                RegisteredEntry {
                    package: "com.g.y".into(),
                    uid: 0,
                    gid: 10100,
                    quota_kib: 5120,
                    remaining_kib: None,
                    anchor: false,
                },
            ])
            .unwrap();

        rehydrate_register(&engine);

        let state = engine.state();
        assert_eq!(state.registered.len(), 2);
        // Both resolve to uid == gid == 10100 (shared-uid group), but
        // exactly one entry is the designated chain owner.
        assert!(state.registered.iter().all(|e| e.uid == e.gid));
        assert_eq!(state.registered.iter().filter(|e| e.is_anchor()).count(), 1);
    }

    #[test]
    fn rehydrate_dedupes_chain_creation_for_a_shared_uid_group() {
        let (engine, recorder) = test_engine();
        install_package_table(&engine, "com.g.x 10100\ncom.g.y 10100\n");

        engine
            .store
            .save(&[
                RegisteredEntry {
                    package: "com.g.x".into(),
                    uid: 0,
                    gid: 10100,
                    quota_kib: 5120,
                    remaining_kib: None,
                    anchor: false,
                },
                RegisteredEntry {
                    package: "com.g.y".into(),
                    uid: 0,
                    gid: 10100,
                    quota_kib: 5120,
                    remaining_kib: None,
                    anchor: false,
                },
            ])
            .unwrap();

        rehydrate_register(&engine);

        let new_chain_calls = recorder.calls().into_iter().filter(|c| c == "-N p30_10100").count();
        assert_eq!(new_chain_calls, 1, "a shared-uid group must create its chain exactly once");
    }
}
