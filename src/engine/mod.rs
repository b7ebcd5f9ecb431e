//! `PolicyEngine`: owns the in-memory authoritative state (installed
//! `Package` table, the `Registered` set, and the chain graph
//! bookkeeping) and drives every `FwDriver` call and `QuotaStore` write.
//! Runs two long-lived workers — the control worker and the sampler
//! worker — coordinated through a single mutex and a single condition
//! variable used once, to signal the sampler that startup has completed.
//! That shape is grounded in the
//! `Mutex`+`Condvar` one-shot-signal pattern seen throughout the pack
//! (e.g. `orbstack-swift-nio/src/gruel/src/startup.rs`,
//! `GssMahadevan-gvthread`'s `ready_queue/simple.rs`).

pub mod control;
pub mod sampler;
pub mod startup;

use crate::config::Config;
use crate::fw::FwDriver;
use crate::model::{Package, RegisteredEntry};
use crate::store::QuotaStore;
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// State guarded by `engineLock`: the `Package` table, the `Registered`
/// set, chain-graph bookkeeping, and the last-serialized-register cache
pub struct EngineState {
    pub packages: Vec<Package>,
    pub registered: Vec<RegisteredEntry>,
    /// One-shot per startup: whether the `android.gsf` shared-system hook
    /// has already been installed.
    pub gsf_hook_installed: bool,
    pub last_serialized_register: String,
}

impl EngineState {
    fn new() -> EngineState {
        EngineState {
            packages: Vec::new(),
            registered: Vec::new(),
            gsf_hook_installed: false,
            last_serialized_register: String::new(),
        }
    }

    /// Resolves a reported package name against the installed table by
    /// substring match, installed-name-contains-reported-name, first match
    /// wins in table order.
    pub fn resolve_uid(&self, reported_name: &str) -> Option<u32> {
        self.packages
            .iter()
            .find(|p| p.name.contains(reported_name))
            .map(|p| p.uid)
    }
}

pub struct Engine {
    pub config: Config,
    pub driver: Arc<dyn FwDriver + Send + Sync>,
    pub store: QuotaStore,
    state: Mutex<EngineState>,
    startup_done: Mutex<bool>,
    startup_cv: Condvar,
    shutdown: AtomicBool,
}

impl Engine {
    pub fn new(config: Config, driver: Arc<dyn FwDriver + Send + Sync>) -> Arc<Engine> {
        let store = QuotaStore::new(config.register_path.clone());

        Arc::new(Engine {
            config,
            driver,
            store,
            state: Mutex::new(EngineState::new()),
            startup_done: Mutex::new(false),
            startup_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.startup_cv.notify_all();
    }

    /// Signals the sampler that startup has completed.
    pub fn signal_startup_complete(&self) {
        let mut done = self.startup_done.lock().unwrap();
        *done = true;
        self.startup_cv.notify_all();
    }

    /// Blocks until startup has signalled completion or shutdown was
    /// requested. Returns `false` in the shutdown case so the sampler can
    /// exit instead of running a first tick.
    pub fn wait_for_startup(&self) -> bool {
        let mut done = self.startup_done.lock().unwrap();
        while !*done && !self.is_shutting_down() {
            done = self.startup_cv.wait(done).unwrap();
        }
        !self.is_shutting_down()
    }

    /// Sleeps in short increments so a shutdown request interrupts the wait
    /// promptly instead of blocking for the full duration.
    pub fn interruptible_sleep(&self, duration: Duration) -> bool {
        const STEP: Duration = Duration::from_millis(200);
        let mut remaining = duration;

        while remaining > Duration::ZERO {
            if self.is_shutting_down() {
                return false;
            }
            let slice = std::cmp::min(STEP, remaining);
            thread::sleep(slice);
            remaining -= slice;
        }

        !self.is_shutting_down()
    }

    /// Spawns the control worker and the sampler worker. No attempt is made
    /// to unwind the firewall on shutdown — the next process start
    /// assumes stale state.
    pub fn run(self: &Arc<Engine>) -> (JoinHandle<()>, JoinHandle<()>) {
        let control_engine = Arc::clone(self);
        let control_handle = thread::spawn(move || {
            control::run(&control_engine);
        });

        let sampler_engine = Arc::clone(self);
        let sampler_handle = thread::spawn(move || {
            sampler::run(&sampler_engine);
        });

        (control_handle, sampler_handle)
    }
}

pub fn shutdown_and_join(engine: &Arc<Engine>, handles: (JoinHandle<()>, JoinHandle<()>)) {
    engine.request_shutdown();
    info!("waiting for workers to stop ...");
    let _ = handles.0.join();
    let _ = handles.1.join();
}
