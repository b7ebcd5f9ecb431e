mod args;
mod codec;
mod config;
mod engine;
mod error;
mod fw;
mod logging;
mod model;
mod store;

use clap::ArgMatches;
use fw::ProcessDriver;
use signal_hook::{consts::*, iterator::Signals};
use std::os::raw::c_int;
use std::sync::Arc;
use std::thread;

#[derive(Debug)]
pub enum StartupErr {
    ConfigFileLoadErr(config::ParseConfigError),
    LoggerError(String),
}

impl From<config::ParseConfigError> for StartupErr {
    fn from(e: config::ParseConfigError) -> Self {
        StartupErr::ConfigFileLoadErr(e)
    }
}

const SIGNALS: &[c_int] = &[SIGTERM, SIGQUIT, SIGINT, SIGHUP];

fn main() {
    let arguments = args::init();

    match run(&arguments) {
        Ok(_) => log::info!("stopped"),
        Err(StartupErr::ConfigFileLoadErr(err)) => {
            log::error!("failed to load config file: {:?}", err);
            std::process::exit(1);
        }
        Err(StartupErr::LoggerError(err)) => {
            eprintln!("failed to init logger: {}", err);
            std::process::exit(1);
        }
    }
}

fn run(arguments: &ArgMatches) -> Result<(), StartupErr> {
    let config = config::Config::new_from_file(args::get_config(arguments))?;

    logging::init(arguments).map_err(|e| StartupErr::LoggerError(e.to_string()))?;

    log::info!("quotad starting ...");

    let driver = Arc::new(ProcessDriver::new(&config));
    let eng = engine::Engine::new(config, driver);

    if args::get_once(arguments) {
        run_once(&eng);
        return Ok(());
    }

    let handles = eng.run();

    let mut signals = Signals::new(SIGNALS).unwrap();
    let shutdown_engine = Arc::clone(&eng);
    thread::spawn(move || {
        if signals.forever().next().is_some() {
            log::info!("signal received, shutting down");
            shutdown_engine.request_shutdown();
        }
    });

    engine::shutdown_and_join(&eng, handles);

    Ok(())
}

/// `--once` smoke-test mode: run startup synchronously, then a single
/// sampler tick and a single control round, then return without spawning
/// the long-lived workers.
fn run_once(eng: &Arc<engine::Engine>) {
    if !engine::startup::run_startup(eng) {
        return;
    }
    engine::sampler::tick_once(eng);
    engine::control::round_once(eng);
}
