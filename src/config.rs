//! Configuration.
//!
//! This module parses command line arguments for both binaries in this
//! crate (the measurement engine and the dispatcher) into validated,
//! immutable `Config` values. All fatal argument errors are logged and
//! turn into `process::exit` here rather than bubbling up as a `Result`,
//! mirroring how the fatal-setup error class in the design is meant to be
//! handled: there's nothing a caller could usefully do differently.

use std::{fs, process};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use clap::{App, Arg, ArgMatches};
use log::LevelFilter;

use crate::fingerprint::Fingerprint;


//------------ Defaults -------------------------------------------------------

const DEFAULT_CTRL_PORT: &str = "9051";
const DEFAULT_SOCKS_HOST: &str = "127.0.0.1";
const DEFAULT_SOCKS_PORT: &str = "9050";
const DEFAULT_SOCKS_TIMEOUT: &str = "10";
const DEFAULT_CIRC_BUILD_ATTEMPTS: &str = "3";
const DEFAULT_MEASUREMENT_ATTEMPTS: &str = "3";
const DEFAULT_SAMPLES: &str = "200";
const DEFAULT_TARGET_PORT: &str = "16667";
const DEFAULT_THREADS: &str = "1";
const DEFAULT_RELAY_MAX_PAIRS: &str = "10000";
const DEFAULT_OUT_CACHE_FILE: &str = "cache.json";
const DEFAULT_OUT_RESULT_FILE: &str = "results.json";
const DEFAULT_CACHE_LIFE: &str = "86400";
const DEFAULT_RESULT_LIFE: &str = "86400";
const DEFAULT_WRITE_RESULTS_EVERY: &str = "10";
const DEFAULT_WRITE_CACHE_EVERY: &str = "10";
const DEFAULT_STATS_INTERVAL: &str = "60";
const DEFAULT_CHUNK_SIZE: &str = "100";


//------------ RelaySource -----------------------------------------------------

/// Where the engine should get its relay pairs from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RelaySource {
    /// Query the overlay daemon's network status for a live relay set.
    Internet,
    /// Read pairs from a file (optionally `.gz`/`.xz` compressed).
    File,
    /// Read pairs from standard input.
    Stdin,
}

impl FromStr for RelaySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "internet" => Ok(RelaySource::Internet),
            "file" => Ok(RelaySource::File),
            "stdin" => Ok(RelaySource::Stdin),
            other => Err(format!("unknown relay source '{other}'")),
        }
    }
}


//------------ LogTarget -------------------------------------------------------

/// Where log output should go.
#[derive(Clone, Debug)]
pub enum LogTarget {
    Stderr,
    File(PathBuf),
    #[cfg(unix)]
    Syslog,
}

impl LogTarget {
    fn from_arg(value: &str) -> Result<Self, String> {
        if value == "stderr" {
            return Ok(LogTarget::Stderr)
        }
        #[cfg(unix)]
        if value == "syslog" {
            return Ok(LogTarget::Syslog)
        }
        if let Some(path) = value.strip_prefix("file:") {
            return Ok(LogTarget::File(PathBuf::from(path)))
        }
        Err(format!("unknown log target '{value}'"))
    }
}


//------------ Config (engine) -------------------------------------------------

/// The measurement engine's configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// The first anchor relay. Every circuit starts here.
    pub w_relay: Fingerprint,

    /// The second anchor relay. Every circuit ends here.
    pub z_relay: Fingerprint,

    /// TCP port of the overlay daemon's control port.
    pub ctrl_port: u16,

    /// Host of the overlay daemon's SOCKS5 proxy.
    pub socks_host: String,

    /// TCP port of the overlay daemon's SOCKS5 proxy.
    pub socks_port: u16,

    /// Per-socket timeout for SOCKS5 connect/send/recv.
    pub socks_timeout: Duration,

    /// Attempts to build a single circuit before giving up on it.
    pub circ_build_attempts: u32,

    /// Attempts to ting a single built circuit before giving up on it.
    pub measurement_attempts: u32,

    /// Number of 1-byte samples per ting invocation.
    pub samples: usize,

    /// Host of the echo server targeted by ting.
    pub target_host: String,

    /// Port of the echo server targeted by ting.
    pub target_port: u16,

    /// Number of worker threads.
    pub threads: usize,

    /// Where to obtain relay pairs from.
    pub relay_source: RelaySource,

    /// File to read pairs from when `relay_source == File`.
    pub relay_source_file: Option<PathBuf>,

    /// Upper bound on the number of pairs to measure in this run.
    pub relay_max_pairs: usize,

    /// Path of the RTT cache's JSON persistence file.
    pub out_cache_file: PathBuf,

    /// Path of the append-only results journal.
    pub out_result_file: PathBuf,

    /// Whether 3-hop paths are cached.
    pub cache_3hop: bool,

    /// Whether 4-hop paths are cached.
    pub cache_4hop: bool,

    /// Freshness lifetime for 3-hop cache entries.
    pub cache_3hop_life: Duration,

    /// Freshness lifetime for 4-hop cache entries.
    pub cache_4hop_life: Duration,

    /// How long a result record is considered fresh enough to skip
    /// re-measuring its pair.
    pub result_life: Duration,

    /// Flush the results journal after this many buffered records.
    pub write_results_every: usize,

    /// Persist the cache after this many completed measurements.
    pub write_cache_every: usize,

    /// Interval between progress log lines; `None` disables them.
    pub stats_interval: Option<Duration>,

    /// Maximum log level, derived from repeated `-v`.
    pub verbose: LevelFilter,

    /// Where to send log output.
    pub log_target: LogTarget,
}

impl Config {
    /// Builds the `clap` argument definition shared by `base_args`.
    ///
    /// Split out so the dispatcher can reuse the exact same flag
    /// definitions for its passthrough arguments (see
    /// [`DispatcherConfig::config_args`]).
    fn base_args<'a, 'b>(app: App<'a, 'b>) -> App<'a, 'b> {
        app
            .arg(Arg::with_name("w-relay")
                .long("w-relay").value_name("FP").takes_value(true)
                .required(true)
                .help("fingerprint of the first anchor relay"))
            .arg(Arg::with_name("z-relay")
                .long("z-relay").value_name("FP").takes_value(true)
                .required(true)
                .help("fingerprint of the second anchor relay"))
            .arg(Arg::with_name("samples")
                .long("samples").value_name("N").takes_value(true)
                .default_value(DEFAULT_SAMPLES)
                .help("number of 1-byte samples per ting"))
            .arg(Arg::with_name("target-host")
                .long("target-host").value_name("HOST").takes_value(true)
                .required(true)
                .help("host of the echo server"))
            .arg(Arg::with_name("target-port")
                .long("target-port").value_name("PORT").takes_value(true)
                .default_value(DEFAULT_TARGET_PORT)
                .help("port of the echo server"))
            .arg(Arg::with_name("threads")
                .long("threads").value_name("N").takes_value(true)
                .default_value(DEFAULT_THREADS)
                .help("number of worker threads"))
            .arg(Arg::with_name("out-cache-file")
                .long("out-cache-file").value_name("PATH").takes_value(true)
                .default_value(DEFAULT_OUT_CACHE_FILE)
                .help("path of the RTT cache JSON file"))
            .arg(Arg::with_name("out-result-file")
                .long("out-result-file").value_name("PATH").takes_value(true)
                .default_value(DEFAULT_OUT_RESULT_FILE)
                .help("path of the results journal"))
            .arg(Arg::with_name("stats-interval")
                .long("stats-interval").value_name("SECS").takes_value(true)
                .default_value(DEFAULT_STATS_INTERVAL)
                .help("seconds between progress log lines, 0 to disable"))
            .arg(Arg::with_name("verbose")
                .short("v").long("verbose").multiple(true)
                .help("print more (and more) diagnostic output"))
    }

    /// Adds the engine-only argument definitions to a `clap::App`.
    pub fn config_args<'a, 'b>(app: App<'a, 'b>) -> App<'a, 'b> {
        Self::base_args(app)
            .arg(Arg::with_name("ctrl-port")
                .long("ctrl-port").value_name("PORT").takes_value(true)
                .default_value(DEFAULT_CTRL_PORT)
                .help("TCP port of the overlay daemon's control port"))
            .arg(Arg::with_name("socks-host")
                .long("socks-host").value_name("HOST").takes_value(true)
                .default_value(DEFAULT_SOCKS_HOST)
                .help("host of the overlay daemon's SOCKS5 proxy"))
            .arg(Arg::with_name("socks-port")
                .long("socks-port").value_name("PORT").takes_value(true)
                .default_value(DEFAULT_SOCKS_PORT)
                .help("TCP port of the overlay daemon's SOCKS5 proxy"))
            .arg(Arg::with_name("socks-timeout")
                .long("socks-timeout").value_name("SECS").takes_value(true)
                .default_value(DEFAULT_SOCKS_TIMEOUT)
                .help("timeout for SOCKS5 connect/send/recv"))
            .arg(Arg::with_name("circ-build-attempts")
                .long("circ-build-attempts").value_name("N").takes_value(true)
                .default_value(DEFAULT_CIRC_BUILD_ATTEMPTS)
                .help("attempts to build one circuit before abandoning it"))
            .arg(Arg::with_name("measurement-attempts")
                .long("measurement-attempts").value_name("N").takes_value(true)
                .default_value(DEFAULT_MEASUREMENT_ATTEMPTS)
                .help("attempts to ting one circuit before abandoning it"))
            .arg(Arg::with_name("relay-source")
                .long("relay-source").value_name("SRC").takes_value(true)
                .possible_values(&["internet", "file", "stdin"])
                .default_value("stdin")
                .help("where to read relay pairs from"))
            .arg(Arg::with_name("relay-source-file")
                .long("relay-source-file").value_name("PATH").takes_value(true)
                .help("file to read pairs from (required if relay-source=file)"))
            .arg(Arg::with_name("relay-max-pairs")
                .long("relay-max-pairs").value_name("N").takes_value(true)
                .default_value(DEFAULT_RELAY_MAX_PAIRS)
                .help("maximum number of pairs to measure this run"))
            .arg(Arg::with_name("cache-3hop")
                .long("cache-3hop")
                .help("cache 3-hop (W-X-Z) circuit RTTs"))
            .arg(Arg::with_name("cache-4hop")
                .long("cache-4hop")
                .help("cache 4-hop (W-X-Y-Z) circuit RTTs"))
            .arg(Arg::with_name("cache-3hop-life")
                .long("cache-3hop-life").value_name("SECS").takes_value(true)
                .default_value(DEFAULT_CACHE_LIFE)
                .help("freshness lifetime of 3-hop cache entries"))
            .arg(Arg::with_name("cache-4hop-life")
                .long("cache-4hop-life").value_name("SECS").takes_value(true)
                .default_value(DEFAULT_CACHE_LIFE)
                .help("freshness lifetime of 4-hop cache entries"))
            .arg(Arg::with_name("result-life")
                .long("result-life").value_name("SECS").takes_value(true)
                .default_value(DEFAULT_RESULT_LIFE)
                .help("how long a result stays fresh enough to skip re-measuring"))
            .arg(Arg::with_name("write-results-every")
                .long("write-results-every").value_name("N").takes_value(true)
                .default_value(DEFAULT_WRITE_RESULTS_EVERY)
                .help("flush the results journal every N buffered records"))
            .arg(Arg::with_name("write-cache-every")
                .long("write-cache-every").value_name("N").takes_value(true)
                .default_value(DEFAULT_WRITE_CACHE_EVERY)
                .help("persist the cache every N completed measurements"))
            .arg(Arg::with_name("log-target")
                .long("log-target").value_name("TARGET").takes_value(true)
                .default_value("stderr")
                .help("stderr, syslog, or file:PATH"))
    }

    /// Builds a `Config` from parsed matches, exiting the process on any
    /// invalid value.
    pub fn from_arg_matches(matches: &ArgMatches) -> Self {
        Config {
            w_relay: required_fingerprint(matches, "w-relay"),
            z_relay: required_fingerprint(matches, "z-relay"),
            ctrl_port: required_port(matches, "ctrl-port"),
            socks_host: matches.value_of("socks-host").unwrap().to_string(),
            socks_port: required_port(matches, "socks-port"),
            socks_timeout: required_secs(matches, "socks-timeout"),
            circ_build_attempts: required_u32(matches, "circ-build-attempts"),
            measurement_attempts: required_u32(matches, "measurement-attempts"),
            samples: required_usize(matches, "samples"),
            target_host: matches.value_of("target-host").unwrap().to_string(),
            target_port: required_port(matches, "target-port"),
            threads: required_usize(matches, "threads").max(1),
            relay_source: matches.value_of("relay-source").unwrap()
                .parse().unwrap_or_else(|err| fail_arg(&err)),
            relay_source_file: matches.value_of("relay-source-file")
                .map(PathBuf::from),
            relay_max_pairs: required_usize(matches, "relay-max-pairs"),
            out_cache_file: matches.value_of("out-cache-file").unwrap().into(),
            out_result_file: matches.value_of("out-result-file").unwrap().into(),
            cache_3hop: matches.is_present("cache-3hop"),
            cache_4hop: matches.is_present("cache-4hop"),
            cache_3hop_life: required_secs(matches, "cache-3hop-life"),
            cache_4hop_life: required_secs(matches, "cache-4hop-life"),
            result_life: required_secs(matches, "result-life"),
            write_results_every: required_usize(matches, "write-results-every").max(1),
            write_cache_every: required_usize(matches, "write-cache-every").max(1),
            stats_interval: {
                let secs = required_u64(matches, "stats-interval");
                if secs == 0 { None } else { Some(Duration::from_secs(secs)) }
            },
            verbose: match matches.occurrences_of("verbose") {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            },
            log_target: matches.value_of("log-target").unwrap()
                .parse::<LogTargetArg>().unwrap_or_else(|err| fail_arg(&err)).0,
        }.validated()
    }

    /// Cross-field validation that can't be expressed via `clap` alone.
    fn validated(self) -> Self {
        if self.relay_source == RelaySource::File
            && self.relay_source_file.is_none()
        {
            fail_arg::<()>(
                "--relay-source=file requires --relay-source-file"
            );
        }
        self
    }
}

/// Thin wrapper so `LogTarget::from_arg` can be used with `.parse()`.
struct LogTargetArg(LogTarget);

impl FromStr for LogTargetArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogTarget::from_arg(s).map(LogTargetArg)
    }
}


//------------ DispatcherConfig ------------------------------------------------

/// The dispatcher's configuration.
///
/// The dispatcher passes most engine options straight through to each
/// spawned engine process; it only needs to know about them as opaque
/// strings, plus its own chunking and directory layout.
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Directory under which per-engine working directories are created.
    pub tmpdir: PathBuf,

    /// Directory that contains the relay list(s) to split into chunks.
    pub relaylist_dir: PathBuf,

    /// One SOCKS5 port per engine instance.
    pub socks_ports: Vec<u16>,

    /// One control port per engine instance. Must be the same length as
    /// `socks_ports`; that length is M, the number of engines.
    pub ctrl_ports: Vec<u16>,

    pub w_relay: Fingerprint,
    pub z_relay: Fingerprint,
    pub samples: usize,
    pub target_host: String,
    pub target_port: u16,
    pub threads: usize,
    pub out_cache_file: PathBuf,
    pub out_result_file: PathBuf,
    pub stats_interval: Option<Duration>,
    pub chunk_size: usize,
    pub verbose: LevelFilter,
    pub log_target: LogTarget,
}

impl DispatcherConfig {
    pub fn config_args<'a, 'b>(app: App<'a, 'b>) -> App<'a, 'b> {
        Config::base_args(app)
            .arg(Arg::with_name("log-target")
                .long("log-target").value_name("TARGET").takes_value(true)
                .default_value("stderr")
                .help("stderr, syslog, or file:PATH"))
            .arg(Arg::with_name("tmpdir")
                .long("tmpdir").value_name("DIR").takes_value(true)
                .required(true)
                .help("directory for per-engine working directories"))
            .arg(Arg::with_name("relaylist-dir")
                .long("relaylist-dir").value_name("DIR").takes_value(true)
                .required(true)
                .help("directory containing the relay list(s) to chunk"))
            .arg(Arg::with_name("socks-port")
                .long("socks-port").value_name("PORT").takes_value(true)
                .multiple(true).number_of_values(1)
                .required(true)
                .help("SOCKS5 port of one engine's overlay daemon (repeatable)"))
            .arg(Arg::with_name("ctrl-port")
                .long("ctrl-port").value_name("PORT").takes_value(true)
                .multiple(true).number_of_values(1)
                .required(true)
                .help("control port of one engine's overlay daemon (repeatable)"))
            .arg(Arg::with_name("chunk-size")
                .long("chunk-size").value_name("N").takes_value(true)
                .default_value(DEFAULT_CHUNK_SIZE)
                .help("number of pairs per chunk fed to one engine"))
    }

    pub fn from_arg_matches(matches: &ArgMatches) -> Self {
        let socks_ports: Vec<u16> = matches.values_of("socks-port")
            .unwrap()
            .map(|v| parse_port(v).unwrap_or_else(|err| fail_arg(&err)))
            .collect();
        let ctrl_ports: Vec<u16> = matches.values_of("ctrl-port")
            .unwrap()
            .map(|v| parse_port(v).unwrap_or_else(|err| fail_arg(&err)))
            .collect();
        if socks_ports.len() != ctrl_ports.len() {
            fail_arg::<()>(
                "--socks-port and --ctrl-port must be given the same \
                 number of times"
            );
        }
        let tmpdir: PathBuf = matches.value_of("tmpdir").unwrap().into();
        if fs::metadata(&tmpdir).map(|m| !m.is_dir()).unwrap_or(true) {
            fail_arg::<()>(&format!(
                "--tmpdir {} does not exist or is not a directory",
                tmpdir.display()
            ));
        }
        let relaylist_dir: PathBuf = matches.value_of("relaylist-dir").unwrap().into();
        if fs::metadata(&relaylist_dir).map(|m| !m.is_dir()).unwrap_or(true) {
            fail_arg::<()>(&format!(
                "--relaylist-dir {} does not exist or is not a directory",
                relaylist_dir.display()
            ));
        }
        DispatcherConfig {
            tmpdir,
            relaylist_dir,
            socks_ports,
            ctrl_ports,
            w_relay: required_fingerprint(matches, "w-relay"),
            z_relay: required_fingerprint(matches, "z-relay"),
            samples: required_usize(matches, "samples"),
            target_host: matches.value_of("target-host").unwrap().to_string(),
            target_port: required_port(matches, "target-port"),
            threads: required_usize(matches, "threads").max(1),
            out_cache_file: matches.value_of("out-cache-file").unwrap().into(),
            out_result_file: matches.value_of("out-result-file").unwrap().into(),
            stats_interval: {
                let secs = required_u64(matches, "stats-interval");
                if secs == 0 { None } else { Some(Duration::from_secs(secs)) }
            },
            chunk_size: required_usize(matches, "chunk-size").max(1),
            verbose: match matches.occurrences_of("verbose") {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            },
            log_target: matches.value_of("log-target").unwrap()
                .parse::<LogTargetArg>().unwrap_or_else(|err| fail_arg(&err)).0,
        }
    }

    /// Number of engine instances to run, derived from the port lists.
    pub fn engine_count(&self) -> usize {
        self.socks_ports.len()
    }
}


//------------ Parsing helpers -------------------------------------------------

fn fail_arg<T>(msg: &str) -> T {
    eprintln!("Fatal: {msg}.\nAborting.");
    process::exit(2)
}

fn required_fingerprint(matches: &ArgMatches, name: &str) -> Fingerprint {
    let value = matches.value_of(name).unwrap();
    Fingerprint::from_str(value).unwrap_or_else(|err| {
        fail_arg(&format!("invalid value '{value}' for --{name}: {err}"))
    })
}

fn parse_port(value: &str) -> Result<u16, String> {
    u16::from_str(value).map_err(|_| {
        format!("'{value}' is not a valid port number")
    })
}

fn required_port(matches: &ArgMatches, name: &str) -> u16 {
    let value = matches.value_of(name).unwrap();
    parse_port(value).unwrap_or_else(|err| fail_arg(&err))
}

fn required_usize(matches: &ArgMatches, name: &str) -> usize {
    let value = matches.value_of(name).unwrap();
    usize::from_str(value).unwrap_or_else(|_| {
        fail_arg(&format!("'{value}' is not a valid number for --{name}"))
    })
}

fn required_u32(matches: &ArgMatches, name: &str) -> u32 {
    let value = matches.value_of(name).unwrap();
    u32::from_str(value).unwrap_or_else(|_| {
        fail_arg(&format!("'{value}' is not a valid number for --{name}"))
    })
}

fn required_u64(matches: &ArgMatches, name: &str) -> u64 {
    let value = matches.value_of(name).unwrap();
    u64::from_str(value).unwrap_or_else(|_| {
        fail_arg(&format!("'{value}' is not a valid number for --{name}"))
    })
}

fn required_secs(matches: &ArgMatches, name: &str) -> Duration {
    Duration::from_secs(required_u64(matches, name))
}


#[cfg(test)]
mod test {
    use super::*;

    fn engine_matches<'a>(app: App<'a, 'a>, args: &[&str]) -> ArgMatches<'a> {
        Config::config_args(app).get_matches_from_safe(args).unwrap()
    }

    #[test]
    fn parses_minimal_engine_args() {
        let fp1 = "A".repeat(40);
        let fp2 = "B".repeat(40);
        let matches = engine_matches(App::new("ting-rtt"), &[
            "ting-rtt",
            "--w-relay", &fp1,
            "--z-relay", &fp2,
            "--target-host", "echo.example.org",
        ]);
        let config = Config::from_arg_matches(&matches);
        assert_eq!(config.w_relay.as_str(), fp1);
        assert_eq!(config.z_relay.as_str(), fp2);
        assert_eq!(config.ctrl_port, 9051);
        assert_eq!(config.samples, 200);
        assert_eq!(config.threads, 1);
        assert_eq!(config.relay_source, RelaySource::Stdin);
    }

    #[test]
    fn relay_source_round_trips() {
        assert_eq!("internet".parse(), Ok(RelaySource::Internet));
        assert_eq!("file".parse(), Ok(RelaySource::File));
        assert_eq!("stdin".parse(), Ok(RelaySource::Stdin));
        assert!("bogus".parse::<RelaySource>().is_err());
    }

    fn dispatcher_matches<'a>(app: App<'a, 'a>, args: &[&str]) -> ArgMatches<'a> {
        DispatcherConfig::config_args(app).get_matches_from_safe(args).unwrap()
    }

    #[test]
    fn parses_repeated_ports_and_derives_engine_count() {
        let dir = tempfile::tempdir().unwrap();
        let fp1 = "A".repeat(40);
        let fp2 = "B".repeat(40);
        let matches = dispatcher_matches(App::new("ting-dispatch"), &[
            "ting-dispatch",
            "--w-relay", &fp1,
            "--z-relay", &fp2,
            "--target-host", "echo.example.org",
            "--tmpdir", &dir.path().to_string_lossy(),
            "--relaylist-dir", &dir.path().to_string_lossy(),
            "--socks-port", "9100", "--socks-port", "9101",
            "--ctrl-port", "9150", "--ctrl-port", "9151",
            "--log-target", "file:/tmp/ting-dispatch.log",
        ]);
        let config = DispatcherConfig::from_arg_matches(&matches);
        assert_eq!(config.socks_ports, vec![9100, 9101]);
        assert_eq!(config.ctrl_ports, vec![9150, 9151]);
        assert_eq!(config.engine_count(), 2);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE.parse::<usize>().unwrap());
        assert!(matches!(config.log_target, LogTarget::File(_)));
    }
}
