//! The overlay daemon control connection.
//!
//! [`Controller`] opens a line-oriented TCP session to the daemon's
//! control port, authenticates, and disables everything that would make
//! the daemon attach streams or build circuits on its own, since this
//! crate always asks for circuits and stream attachment explicitly. A
//! background reader thread decodes every line arriving on the
//! connection: ordinary command replies are routed back to whichever
//! call is waiting for them, and `650` events are dispatched to the
//! registered stream listeners and to any circuit-build waiter.
//!
//! Every command method takes `&self`, not `&mut self`: the stream
//! listener registered by `ting` runs on this module's background
//! reader thread and needs to call [`Controller::attach_stream`] from
//! there while the owning worker thread may simultaneously be waiting
//! on a different command, so the write half is behind its own mutex.

pub mod events;
mod proto;

use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use log::{debug, error, warn};
use crate::error::{Failed, Retryable};
use crate::fingerprint::Fingerprint;
use crate::utils::sync::Mutex;
use self::events::{ListenerHandle, StreamEvent, StreamListeners, StreamStatus};
use self::proto::{format_command, MultilineReply, ReplyLine};

/// The circuit build timeout set on the daemon and used to bound
/// `build_circuit`. Fixed rather than user-configurable: the original
/// measurement tooling this crate reimplements never exposed it as a
/// flag either.
pub const CIRCUIT_BUILD_TIMEOUT: Duration = Duration::from_secs(10);

/// The circuit identifier the daemon assigns, as reported in the
/// `EXTENDCIRCUIT` reply and every subsequent `CIRC` event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct CircuitId(pub u64);

/// The result of `GETINFO ns/id/<fp>`.
#[derive(Clone, Debug)]
pub struct NetworkStatus {
    pub address: String,
    pub nickname: String,
}

enum CircResult {
    Built,
    Failed,
}

struct Shared {
    write: Mutex<TcpStream>,
    pending_replies: Mutex<VecDeque<SyncSender<ReplyLine>>>,
    circ_waiters: Mutex<HashMap<u64, SyncSender<CircResult>>>,
    listeners: StreamListeners,
    build_timeout: Duration,
}

/// A connected, authenticated control session.
///
/// Cheap to clone: every clone shares the same connection, write lock,
/// and listener registry. Cloned mainly so a stream listener (which
/// must be `'static`) can hold its own handle back into the session
/// that registered it.
#[derive(Clone)]
pub struct Controller {
    shared: Arc<Shared>,
}

impl Controller {
    /// Connects to the control port, authenticates, and applies the
    /// startup configuration every circuit in this crate depends on:
    /// predicted circuits and automatic stream attachment are both
    /// disabled, and the circuit build timeout is fixed and
    /// non-adaptive.
    pub fn connect(ctrl_port: u16, build_timeout: Duration) -> Result<Self, Failed> {
        let stream = TcpStream::connect(("127.0.0.1", ctrl_port)).map_err(|err| {
            error!("Failed to connect to control port {}: {}", ctrl_port, err);
            Failed
        })?;
        let read = stream.try_clone().map_err(|err| {
            error!("Failed to clone control connection: {}", err);
            Failed
        })?;
        let shared = Arc::new(Shared {
            write: Mutex::new(stream),
            pending_replies: Mutex::new(VecDeque::new()),
            circ_waiters: Mutex::new(HashMap::new()),
            listeners: StreamListeners::new(),
            build_timeout,
        });
        let controller = Controller { shared: shared.clone() };
        spawn_reader(read, shared);

        controller.authenticate()?;
        controller.setconf("__DisablePredictedCircuits", "1")?;
        controller.setconf("__LeaveStreamsUnattached", "1")?;
        controller.setconf("LearnCircuitBuildTimeout", "0")?;
        controller.setconf(
            "CircuitBuildTimeout",
            &build_timeout.as_secs().to_string()
        )?;
        controller.send_command("SETEVENTS", &["STREAM", "CIRC"])?;
        Ok(controller)
    }

    fn authenticate(&self) -> Result<(), Failed> {
        self.send_command("AUTHENTICATE", &[])
    }

    fn setconf(&self, key: &str, value: &str) -> Result<(), Failed> {
        self.send_command("SETCONF", &[&format!("{key}={value}")])
    }

    /// Sends a command and waits for its (non-event) reply, failing
    /// fatally if the connection drops or the daemon rejects it.
    fn send_command(&self, verb: &str, args: &[&str]) -> Result<(), Failed> {
        self.raw_command(verb, args).and_then(|reply| {
            if reply.is_success() {
                Ok(())
            }
            else {
                error!("Control command '{verb}' failed: {}", reply.text);
                Err(Failed)
            }
        })
    }

    /// Sends a command and returns its reply.
    ///
    /// Holds the write lock for the whole enqueue-then-write sequence so
    /// that the pending-reply queue and the order replies actually
    /// arrive in can never disagree, even with several threads issuing
    /// commands over this one connection concurrently.
    fn raw_command(&self, verb: &str, args: &[&str]) -> Result<ReplyLine, Failed> {
        let (tx, rx) = sync_channel(1);
        {
            let mut write = self.shared.write.lock();
            self.shared.pending_replies.lock().push_back(tx);
            let line = format_command(verb, args);
            write.write_all(line.as_bytes()).map_err(|err| {
                error!("Control connection write failed: {}", err);
                Failed
            })?;
        }
        rx.recv_timeout(Duration::from_secs(30)).map_err(|_| {
            error!("Control connection did not reply to '{verb}'");
            Failed
        })
    }

    /// Builds a circuit along `path` and blocks until the daemon reports
    /// it built or failed, or `build_timeout` elapses.
    pub fn build_circuit(&self, path: &[Fingerprint]) -> Result<CircuitId, Retryable> {
        let fps: Vec<&str> = path.iter().map(Fingerprint::as_str).collect();
        let reply = self.raw_command("EXTENDCIRCUIT", &[
            "0", &fps.join(",")
        ]).map_err(|_| Retryable)?;
        if !reply.is_success() {
            warn!("Circuit build rejected: {}", reply.text);
            return Err(Retryable)
        }
        let id: u64 = reply.text.split_whitespace().nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                error!("Could not parse circuit id from '{}'", reply.text);
                Retryable
            })?;

        let (tx, rx) = sync_channel(1);
        self.shared.circ_waiters.lock().insert(id, tx);
        let outcome = rx.recv_timeout(self.shared.build_timeout);
        self.shared.circ_waiters.lock().remove(&id);
        match outcome {
            Ok(CircResult::Built) => Ok(CircuitId(id)),
            Ok(CircResult::Failed) => {
                warn!("Circuit {} failed to build", id);
                Err(Retryable)
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("Circuit {} timed out building", id);
                Err(Retryable)
            }
            Err(RecvTimeoutError::Disconnected) => {
                error!("Control connection lost while building circuit {}", id);
                Err(Retryable)
            }
        }
    }

    /// Closes a circuit. Unknown ids are silently ignored, matching the
    /// daemon's own idempotent `CLOSECIRCUIT` behaviour.
    pub fn close_circuit(&self, id: CircuitId) {
        let _ = self.raw_command("CLOSECIRCUIT", &[&id.0.to_string()]);
    }

    /// Looks up a relay's current address and nickname.
    ///
    /// Returns `Err(Failed)` if the daemon reports the descriptor as
    /// unavailable; callers that can tolerate that (the results
    /// manager) substitute placeholder values rather than treating it
    /// as fatal.
    pub fn network_status(&self, fp: &Fingerprint) -> Result<NetworkStatus, Failed> {
        let reply = self.raw_command("GETINFO", &[&format!("ns/id/{}", fp.as_str())])?;
        if !reply.is_success() {
            debug!("Descriptor unavailable for {}: {}", fp, reply.text);
            return Err(Failed)
        }
        let mut fields = reply.text.split_whitespace();
        let address = fields.next().unwrap_or("0.0.0.0").to_string();
        let nickname = fields.next().unwrap_or("(unknown)").to_string();
        Ok(NetworkStatus { address, nickname })
    }

    /// Queries the live relay directory and returns the fingerprints of
    /// every relay whose measurement state field reads "measured".
    pub fn list_measured_relays(&self) -> Result<Vec<Fingerprint>, Failed> {
        let reply = self.raw_command("GETINFO", &["ns/all"])?;
        if !reply.is_success() {
            error!("GETINFO ns/all failed: {}", reply.text);
            return Err(Failed)
        }
        Ok(parse_measured_relays(&reply.text))
    }

    /// Registers a stream listener, invoked for every `NEW` stream event
    /// with the `USER` purpose.
    pub fn add_stream_listener(
        &self, f: impl Fn(&StreamEvent) + Send + Sync + 'static
    ) -> ListenerHandle {
        self.shared.listeners.add(f)
    }

    pub fn remove_stream_listener(&self, handle: ListenerHandle) {
        self.shared.listeners.remove(handle)
    }

    /// Attaches an existing stream onto a circuit. An "invalid request"
    /// response (the stream already attached itself or vanished) is
    /// logged as a warning rather than treated as an error.
    pub fn attach_stream(&self, stream_id: u64, circ_id: CircuitId) {
        match self.raw_command(
            "ATTACHSTREAM", &[&stream_id.to_string(), &circ_id.0.to_string()]
        ) {
            Ok(reply) if !reply.is_success() => {
                warn!(
                    "Failed to attach stream {} to circuit {}: {}",
                    stream_id, circ_id.0, reply.text
                );
            }
            Err(_) => {
                warn!("Failed to attach stream {} to circuit {}", stream_id, circ_id.0);
            }
            Ok(_) => {}
        }
    }
}

fn spawn_reader(read: TcpStream, shared: Arc<Shared>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(read);
        let mut line = String::new();
        let mut multiline = MultilineReply::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let raw = line.trim_end_matches(['\r', '\n']);
            let reply = match multiline.feed(raw) {
                Ok(Some(reply)) => reply,
                Ok(None) => continue,
                Err(err) => {
                    warn!("Malformed control line: {}", err);
                    continue;
                }
            };
            if reply.is_async_event() {
                handle_event(&shared, &reply.text);
            }
            else if let Some(tx) = shared.pending_replies.lock().pop_front() {
                let _ = tx.send(reply);
            }
        }
    });
}

fn handle_event(shared: &Shared, text: &str) {
    let mut fields = text.split_whitespace();
    match fields.next() {
        Some("STREAM") => handle_stream_event(shared, fields),
        Some("CIRC") => handle_circ_event(shared, fields),
        _ => {}
    }
}

fn handle_stream_event<'a>(shared: &Shared, mut fields: impl Iterator<Item = &'a str>) {
    let stream_id = match fields.next().and_then(|s| s.parse().ok()) {
        Some(id) => id,
        None => return,
    };
    let status = StreamStatus::parse(fields.next().unwrap_or(""));
    // Following fields are circuit id, target, then purpose annotations;
    // we only care whether PURPOSE=USER shows up anywhere in the rest.
    let purpose_is_user = fields.any(|f| f == "PURPOSE=USER");
    shared.listeners.dispatch(&StreamEvent { stream_id, status, purpose_is_user });
}

fn handle_circ_event<'a>(shared: &Shared, mut fields: impl Iterator<Item = &'a str>) {
    let id = match fields.next().and_then(|s| s.parse().ok()) {
        Some(id) => id,
        None => return,
    };
    let status = fields.next().unwrap_or("");
    let result = match status {
        "BUILT" => CircResult::Built,
        "FAILED" | "CLOSED" => CircResult::Failed,
        _ => return,
    };
    if let Some(tx) = shared.circ_waiters.lock().remove(&id) {
        let _ = tx.send(result);
    }
}

/// Parses a `GETINFO ns/all` data reply: one line per relay, `FP
/// STATE ...`; extra fields are ignored. Malformed fingerprints are
/// skipped with a warning rather than failing the whole query.
fn parse_measured_relays(text: &str) -> Vec<Fingerprint> {
    let mut relays = Vec::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let fp = match fields.next() {
            Some(fp) => fp,
            None => continue,
        };
        if fields.next() != Some("measured") {
            continue
        }
        match fp.parse() {
            Ok(fp) => relays.push(fp),
            Err(err) => warn!("Skipping malformed fingerprint in ns/all: {}", err),
        }
    }
    relays
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn circuit_id_equality() {
        assert_eq!(CircuitId(3), CircuitId(3));
        assert_ne!(CircuitId(3), CircuitId(4));
    }

    #[test]
    fn parse_measured_relays_filters_by_state() {
        let a = "A".repeat(40);
        let b = "B".repeat(40);
        let text = format!("{a} measured nick-a\n{b} new nick-b\nshort measured\n");
        let relays = parse_measured_relays(&text);
        assert_eq!(relays, vec![a.parse::<Fingerprint>().unwrap()]);
    }
}
