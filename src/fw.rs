//! Thin, synchronous wrapper over the external firewall CLI.
//!
//! Every mutating operation is mirrored on IPv4 (`iptables`) and IPv6
//! (`ip6tables`). The trait seam is grounded in
//! `other_examples/9afe5f42` (`dfw`'s `IPTables` trait and its
//! `IPTablesLogger` test double): production code runs real subprocesses,
//! tests record the argv that would have been run.

use crate::config::Config;
use log::{debug, warn};
use std::process::Command;

/// Facade over `iptables`/`ip6tables`. Callers treat a nonzero return as
/// "noisy failure, continue" except where noted at the call
/// site (group-anchor `new_chain` during bootstrap).
pub trait FwDriver {
    /// Raw escape hatch: run `cmd` (the argv after the binary path) on both
    /// families.
    fn both(&self, cmd: &[&str]) -> i32;

    fn new_chain(&self, name: &str) -> i32 {
        self.both(&["-N", name])
    }

    fn append_to_chain(&self, name: &str, spec: &[&str]) -> i32 {
        let mut args = vec!["-A", name];
        args.extend_from_slice(spec);
        self.both(&args)
    }

    fn insert_at_head(&self, chain: &str, pos: u32, spec: &[&str]) -> i32 {
        let pos_str = pos.to_string();
        let mut args = vec!["-I", chain, pos_str.as_str()];
        args.extend_from_slice(spec);
        self.both(&args)
    }

    fn delete_rule(&self, chain: &str, spec: &[&str]) -> i32 {
        let mut args = vec!["-D", chain];
        args.extend_from_slice(spec);
        self.both(&args)
    }

    fn flush_chain(&self, name: &str) -> i32 {
        self.both(&["-F", name])
    }

    fn delete_chain(&self, name: &str) -> i32 {
        self.both(&["-X", name])
    }

    /// Destroys a group chain, flush-before-drop.
    fn destroy_chain(&self, name: &str) -> i32 {
        let flushed = self.flush_chain(name);
        let dropped = self.delete_chain(name);
        flushed | dropped
    }

    /// Runs `-nL OUTPUT` on IPv4 only and returns the captured text — used
    /// exclusively for the precondition probe.
    fn list_output_chain(&self) -> String;
}

/// Real backend: shells out to the configured `iptables`/`ip6tables`
/// binaries.
pub struct ProcessDriver {
    iptables_path: String,
    ip6tables_path: String,
}

impl ProcessDriver {
    pub fn new(config: &Config) -> ProcessDriver {
        ProcessDriver {
            iptables_path: config.iptables_path.clone(),
            ip6tables_path: config.ip6tables_path.clone(),
        }
    }

    fn run(&self, bin: &str, args: &[&str]) -> i32 {
        debug!("{} {}", bin, args.join(" "));

        match Command::new(bin).args(args).output() {
            Ok(output) => output.status.code().unwrap_or(1),
            Err(e) => {
                warn!("## ## failed to spawn '{} {}': {}", bin, args.join(" "), e);
                1
            }
        }
    }
}

impl FwDriver for ProcessDriver {
    fn both(&self, args: &[&str]) -> i32 {
        let v4 = self.run(&self.iptables_path, args);
        let v6 = self.run(&self.ip6tables_path, args);
        v4 | v6
    }

    fn list_output_chain(&self) -> String {
        match Command::new(&self.iptables_path).args(["-nL", "OUTPUT"]).output() {
            Ok(output) => String::from_utf8_lossy(&output.stdout).into_owned(),
            Err(e) => {
                warn!("## ## failed to run '{} -nL OUTPUT': {}", self.iptables_path, e);
                String::new()
            }
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every call instead of touching the kernel, grounded in
    /// `dfw`'s `IPTablesLogger`. Uses `Mutex` rather than `RefCell` so it
    /// can be shared behind the same `Arc<dyn FwDriver + Send + Sync>` the
    /// engine holds in production.
    #[derive(Default)]
    pub struct RecordingDriver {
        calls: Mutex<Vec<String>>,
        probe_output: Mutex<String>,
    }

    impl RecordingDriver {
        pub fn new() -> RecordingDriver {
            RecordingDriver::default()
        }

        pub fn set_probe_output(&self, text: &str) {
            *self.probe_output.lock().unwrap() = text.to_owned();
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl FwDriver for RecordingDriver {
        fn both(&self, args: &[&str]) -> i32 {
            self.calls.lock().unwrap().push(args.join(" "));
            0
        }

        fn list_output_chain(&self) -> String {
            self.probe_output.lock().unwrap().clone()
        }
    }

    #[test]
    fn append_builds_expected_argv() {
        let driver = RecordingDriver::new();
        driver.append_to_chain("p30_1000", &["-m", "owner", "--uid-owner", "1000", "-j", "p30_1000"]);

        assert_eq!(
            driver.calls()[0],
            "-A p30_1000 -m owner --uid-owner 1000 -j p30_1000"
        );
    }

    #[test]
    fn destroy_chain_flushes_before_dropping() {
        let driver = RecordingDriver::new();
        driver.destroy_chain("p30_10050");

        let calls = driver.calls();
        assert_eq!(calls[0], "-F p30_10050");
        assert_eq!(calls[1], "-X p30_10050");
    }

    #[test]
    fn insert_at_head_places_position_after_chain() {
        let driver = RecordingDriver::new();
        driver.insert_at_head("p30dw", 1, &["-m", "owner", "--uid-owner", "10050", "-j", "p30_10050"]);

        assert_eq!(
            driver.calls()[0],
            "-I p30dw 1 -m owner --uid-owner 10050 -j p30_10050"
        );
    }
}
