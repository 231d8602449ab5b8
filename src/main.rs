#[macro_use] extern crate clap;
#[macro_use] extern crate log;
extern crate ting_rtt;

use std::process::exit;
use std::sync::mpsc::sync_channel;
use std::thread;
use clap::App;
use ting_rtt::cache::RttCache;
use ting_rtt::config::{Config, RelaySource};
use ting_rtt::controller::{Controller, CIRCUIT_BUILD_TIMEOUT};
use ting_rtt::engine::EngineConfig;
use ting_rtt::error::{ExitError, Failed};
use ting_rtt::log::Logger;
use ting_rtt::{pairs, results};
use ting_rtt::worker::WorkerPool;

fn _main() -> Result<(), ExitError> {
    Logger::init()?;
    let matches = Config::config_args(
        App::new("ting-rtt")
            .version(crate_version!())
            .author(crate_authors!())
            .about("measures pairwise relay round trip time over an overlay network")
    ).get_matches();
    let config = Config::from_arg_matches(&matches);
    Logger::switch(config.verbose, &config.log_target)?;

    let mut pairs = match config.relay_source {
        RelaySource::File => {
            let path = config.relay_source_file.as_ref().expect(
                "validated: relay-source=file requires relay-source-file"
            );
            pairs::from_file(path)?
        }
        RelaySource::Stdin => pairs::from_stdin()?,
        RelaySource::Internet => {
            let query_controller = Controller::connect(config.ctrl_port, CIRCUIT_BUILD_TIMEOUT)?;
            let relays = query_controller.list_measured_relays()?;
            info!(
                "Found {} measured relays; sampling up to {} pairs.",
                relays.len(), config.relay_max_pairs
            );
            pairs::sample_pairs(&relays, config.relay_max_pairs)
        }
    };
    if pairs.len() > config.relay_max_pairs {
        info!(
            "Truncating {} pairs down to the configured maximum of {}.",
            pairs.len(), config.relay_max_pairs
        );
        pairs = pairs.into_iter().take(config.relay_max_pairs).collect();
    }
    pairs::prune_recent(&mut pairs, &config.out_result_file, config.result_life)?;
    info!("Measuring {} pairs.", pairs.len());

    let cache = RttCache::load(
        config.out_cache_file.clone(),
        config.cache_3hop, config.cache_4hop,
        config.cache_3hop_life, config.cache_4hop_life,
        config.write_cache_every,
    )?;

    let results_controller = Controller::connect(
        config.ctrl_port, CIRCUIT_BUILD_TIMEOUT
    )?;
    let (results_tx, results_rx) = sync_channel(config.write_results_every.max(1));
    let out_result_file = config.out_result_file.clone();
    let write_results_every = config.write_results_every;
    let results_thread = thread::spawn(move || {
        results::run(results_rx, &results_controller, &out_result_file, write_results_every)
    });

    let engine_config = EngineConfig {
        w: config.w_relay.clone(),
        z: config.z_relay.clone(),
        target_host: config.target_host.clone(),
        target_port: config.target_port,
        samples: config.samples,
        circ_build_attempts: config.circ_build_attempts,
        measurement_attempts: config.measurement_attempts,
        socks_host: config.socks_host.clone(),
        socks_port: config.socks_port,
        socks_timeout: config.socks_timeout,
    };
    let pool = WorkerPool::new(config.ctrl_port, CIRCUIT_BUILD_TIMEOUT, config.threads);
    let pairs: Vec<_> = pairs.into_iter().collect();
    let run_result = pool.run(pairs, &cache, &engine_config, results_tx);

    cache.persist()?;
    run_result?;
    match results_thread.join() {
        Ok(result) => result?,
        Err(_) => {
            error!("The results manager thread panicked.");
            return Err(Failed.into())
        }
    }
    Ok(())
}

fn main() {
    match _main() {
        Ok(()) => exit(0),
        Err(ExitError::InvalidArgs) => exit(2),
        Err(ExitError::Generic) => exit(1),
    }
}
