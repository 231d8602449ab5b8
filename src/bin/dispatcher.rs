#[macro_use] extern crate clap;
#[macro_use] extern crate log;
extern crate ting_rtt;

use std::process::exit;
use clap::App;
use ting_rtt::config::DispatcherConfig;
use ting_rtt::dispatcher;
use ting_rtt::error::ExitError;
use ting_rtt::log::Logger;

fn _main() -> Result<(), ExitError> {
    Logger::init()?;
    let matches = DispatcherConfig::config_args(
        App::new("ting-dispatch")
            .version(crate_version!())
            .author(crate_authors!())
            .about("fans relay RTT measurement out across several engine instances")
    ).get_matches();
    let config = DispatcherConfig::from_arg_matches(&matches);
    Logger::switch(config.verbose, &config.log_target)?;

    info!(
        "Dispatching across {} engine instance(s).",
        config.engine_count()
    );
    dispatcher::run(&config)?;
    Ok(())
}

fn main() {
    match _main() {
        Ok(()) => exit(0),
        Err(ExitError::InvalidArgs) => exit(2),
        Err(ExitError::Generic) => exit(1),
    }
}
