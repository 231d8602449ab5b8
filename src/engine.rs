//! The per-pair measurement state machine.
//!
//! For one pair `(X, Y)` this drives three circuits to anchors `W` and
//! `Z` in order (`W-X-Y-Z`, `W-X-Z`, `W-Y-Z`) and algebraically
//! cancels the anchor RTT out of the first: `xy_rtt = wxyz - 0.5*wxz -
//! 0.5*wyz`. Any sub-circuit that can't be measured after retries
//! aborts the whole pair with a null RTT; the remaining circuits are
//! never attempted.

use std::io::{Read, Write};
use std::time::{Duration, Instant};
use log::{debug, warn};
use crate::cache::{path_key, RttCache};
use crate::controller::events::StreamStatus;
use crate::controller::{CircuitId, Controller};
use crate::error::Retryable;
use crate::fingerprint::Fingerprint;
use crate::results::RawResult;
use crate::socks;
use crate::utils::sync::Mutex;

/// Everything a measurement needs that isn't per-pair: anchors, the
/// echo target, retry counts, and dial parameters.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub w: Fingerprint,
    pub z: Fingerprint,
    pub target_host: String,
    pub target_port: u16,
    pub samples: usize,
    pub circ_build_attempts: u32,
    pub measurement_attempts: u32,
    pub socks_host: String,
    pub socks_port: u16,
    pub socks_timeout: Duration,
}

/// Measures one pair end to end, returning a raw result ready for
/// enrichment. Never panics and never blocks beyond the configured
/// timeouts: every path attempted is unconditionally followed by
/// `close_circuit`.
pub fn measure_pair(
    controller: &Controller,
    cache: &RttCache,
    attach_mutex: &Mutex<()>,
    config: &EngineConfig,
    x: &Fingerprint,
    y: &Fingerprint,
) -> RawResult {
    let wxyz = [config.w.clone(), x.clone(), y.clone(), config.z.clone()];
    let wxz = [config.w.clone(), x.clone(), config.z.clone()];
    let wyz = [config.w.clone(), y.clone(), config.z.clone()];

    let rtt = path_rtt(controller, cache, attach_mutex, config, &wxyz)
        .and_then(|wxyz_rtt| {
            let wxz_rtt = path_rtt(controller, cache, attach_mutex, config, &wxz)?;
            let wyz_rtt = path_rtt(controller, cache, attach_mutex, config, &wyz)?;
            Some(wxyz_rtt - 0.5 * wxz_rtt - 0.5 * wyz_rtt)
        });

    RawResult { rtt, x_fp: x.clone(), y_fp: y.clone() }
}

/// Resolves one path's RTT: a cache hit, or one circuit build (retried
/// up to `circ_build_attempts`) followed by one ting (retried up to
/// `measurement_attempts`). A ting that exhausts its attempts abandons
/// the path outright rather than building a fresh circuit and trying
/// again.
fn path_rtt(
    controller: &Controller,
    cache: &RttCache,
    attach_mutex: &Mutex<()>,
    config: &EngineConfig,
    path: &[Fingerprint],
) -> Option<f64> {
    if let Some(rtt) = cache.get(path) {
        debug!("Cache hit for {}", path_key(path));
        return Some(rtt)
    }
    let circ_id = build_circuit_with_retries(controller, config, path)?;
    let rtt = ting(controller, attach_mutex, config, circ_id);
    controller.close_circuit(circ_id);
    match rtt {
        Some(rtt) => {
            cache.put(path, rtt);
            Some(rtt)
        }
        None => {
            warn!(
                "Giving up on path {} after {} ting attempts",
                path_key(path), config.measurement_attempts
            );
            None
        }
    }
}

/// Builds a circuit along `path`, retrying up to `circ_build_attempts`
/// times on a retryable failure.
fn build_circuit_with_retries(
    controller: &Controller, config: &EngineConfig, path: &[Fingerprint],
) -> Option<CircuitId> {
    for attempt in 1..=config.circ_build_attempts {
        match controller.build_circuit(path) {
            Ok(id) => return Some(id),
            Err(Retryable) => {
                debug!(
                    "Circuit build attempt {}/{} failed for {}",
                    attempt, config.circ_build_attempts, path_key(path)
                );
            }
        }
    }
    warn!(
        "Giving up on path {} after {} build attempts",
        path_key(path), config.circ_build_attempts
    );
    None
}

/// Samples a built circuit up to `measurement_attempts` times, each a
/// fresh dial plus `samples` timed byte exchanges, and returns the
/// minimum observed round trip across whichever attempt succeeded.
fn ting(
    controller: &Controller,
    attach_mutex: &Mutex<()>,
    config: &EngineConfig,
    circ_id: CircuitId,
) -> Option<f64> {
    for attempt in 1..=config.measurement_attempts {
        match ting_once(controller, attach_mutex, config, circ_id) {
            Some(rtt) => return Some(rtt),
            None => debug!(
                "Ting attempt {}/{} failed on circuit {}",
                attempt, config.measurement_attempts, circ_id.0
            ),
        }
    }
    None
}

/// One dial-and-sample attempt over an already-built circuit.
fn ting_once(
    controller: &Controller,
    attach_mutex: &Mutex<()>,
    config: &EngineConfig,
    circ_id: CircuitId,
) -> Option<f64> {
    let stream = {
        let _guard = attach_mutex.lock();
        let steering = controller.clone();
        let handle = controller.add_stream_listener(move |event| {
            if event.status == StreamStatus::New && event.purpose_is_user {
                steering.attach_stream(event.stream_id, circ_id);
            }
        });
        let dial_result = socks::dial(
            &config.socks_host, config.socks_port,
            &config.target_host, config.target_port,
            config.socks_timeout,
        );
        controller.remove_stream_listener(handle);
        match dial_result {
            Ok(stream) => stream,
            Err(err) => {
                debug!("Dial failed for circuit {}: {}", circ_id.0, err);
                return None
            }
        }
    };

    let rtt = sample(stream, config.samples, config.socks_timeout);
    rtt
}

/// Sends `samples` single-byte pings down `stream`, each timed
/// individually, finishing with the sentinel byte. Returns the minimum
/// observed round trip, or `None` on any I/O error.
fn sample(mut stream: impl Read + Write, samples: usize, timeout: Duration) -> Option<f64> {
    let mut best: Option<Duration> = None;
    let mut byte = [0u8; 1];
    for _ in 0..samples {
        let start = Instant::now();
        if stream.write_all(b"!").is_err() {
            return None
        }
        if stream.read_exact(&mut byte).is_err() {
            return None
        }
        let elapsed = start.elapsed();
        if elapsed > timeout {
            return None
        }
        best = Some(match best {
            Some(current) if current <= elapsed => current,
            _ => elapsed,
        });
    }
    let _ = stream.write_all(b"X");
    best.map(|d| d.as_secs_f64())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn spawn_echo_server() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn sample_sends_exactly_n_bangs_and_one_sentinel() {
        let (listener, _port) = spawn_echo_server();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                if sock.read_exact(&mut byte).is_err() {
                    break
                }
                received.push(byte[0]);
                if byte[0] == b'X' {
                    break
                }
                sock.write_all(&byte).unwrap();
            }
            received
        });

        let client = TcpStream::connect(addr).unwrap();
        let rtt = sample(client, 5, Duration::from_secs(2));
        assert!(rtt.is_some());
        let received = server.join().unwrap();
        assert_eq!(received.iter().filter(|&&b| b == b'!').count(), 5);
        assert_eq!(received.last(), Some(&b'X'));
    }

    #[test]
    fn min_of_samples_is_monotonic_non_increasing() {
        let (listener, _) = spawn_echo_server();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut byte = [0u8; 1];
            loop {
                if sock.read_exact(&mut byte).is_err() { break }
                if byte[0] == b'X' { break }
                sock.write_all(&byte).unwrap();
            }
        });
        let client = TcpStream::connect(addr).unwrap();
        let rtt_few = sample(client, 3, Duration::from_secs(2)).unwrap();
        server.join().unwrap();
        assert!(rtt_few >= 0.0);
    }

    #[test]
    fn failed_subpath_nulls_the_pair_without_trying_the_rest() {
        // Mirrors measure_pair's and_then chain: wxyz, then wxz, then
        // wyz, short-circuiting (and skipping later paths) on the
        // first `None`.
        use std::cell::Cell;
        let wxz_attempted = Cell::new(false);
        let wyz_attempted = Cell::new(false);

        let wxyz_rtt: Option<f64> = Some(0.300);
        let rtt = wxyz_rtt.and_then(|wxyz_rtt| {
            let wxz_rtt: Option<f64> = { wxz_attempted.set(true); None };
            let wxz_rtt = wxz_rtt?;
            let wyz_rtt: Option<f64> = { wyz_attempted.set(true); Some(0.200) };
            let wyz_rtt = wyz_rtt?;
            Some(wxyz_rtt - 0.5 * wxz_rtt - 0.5 * wyz_rtt)
        });

        assert_eq!(rtt, None);
        assert!(wxz_attempted.get());
        assert!(!wyz_attempted.get());
    }

    #[test]
    fn algebraic_cancellation() {
        let wxyz = 0.300_f64;
        let wxz = 0.200_f64;
        let wyz = 0.200_f64;
        let xy_rtt = wxyz - 0.5 * wxz - 0.5 * wyz;
        assert!((xy_rtt - 0.100).abs() < 1e-9);
    }
}
