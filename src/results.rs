//! Enriching and journaling measurement results.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::mpsc::Receiver;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use crate::controller::Controller;
use crate::error::Failed;
use crate::fingerprint::Fingerprint;
use crate::utils::date::now_unix;

/// A relay as it appears in a result record: its fingerprint plus
/// whatever address/nickname the controller reported at enrichment
/// time.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RelayInfo {
    pub fp: Fingerprint,
    pub ip: String,
    pub nick: String,
}

/// One line of the results journal.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ResultRecord {
    pub time: u64,
    pub rtt: Option<f64>,
    pub x: RelayInfo,
    pub y: RelayInfo,
}

/// A raw measurement as produced by a worker, before IP/nickname
/// enrichment.
#[derive(Clone, Debug)]
pub struct RawResult {
    pub rtt: Option<f64>,
    pub x_fp: Fingerprint,
    pub y_fp: Fingerprint,
}

const UNKNOWN_IP: &str = "0.0.0.0";
const UNKNOWN_NICK: &str = "(unknown)";

/// Runs the results manager loop: receives raw results until the
/// channel closes, enriches and buffers each one, and flushes the
/// buffer to `out_path` every `write_every` records and once more at
/// the end.
pub fn run(
    rx: Receiver<RawResult>,
    controller: &Controller,
    out_path: &Path,
    write_every: usize,
) -> Result<(), Failed> {
    let mut buffer = Vec::new();
    for raw in rx {
        let record = enrich(controller, raw);
        let line = serde_json::to_string(&record).map_err(|err| {
            error!("Failed to serialize result record: {}", err);
            Failed
        })?;
        buffer.push(line);
        if buffer.len() >= write_every {
            flush(out_path, &mut buffer)?;
        }
    }
    flush(out_path, &mut buffer)?;
    info!("Results manager exiting.");
    Ok(())
}

fn enrich(controller: &Controller, raw: RawResult) -> ResultRecord {
    ResultRecord {
        time: now_unix(),
        rtt: raw.rtt,
        x: enrich_relay(controller, raw.x_fp),
        y: enrich_relay(controller, raw.y_fp),
    }
}

fn enrich_relay(controller: &Controller, fp: Fingerprint) -> RelayInfo {
    match controller.network_status(&fp) {
        Ok(status) => RelayInfo { fp, ip: status.address, nick: status.nickname },
        Err(_) => RelayInfo {
            fp, ip: UNKNOWN_IP.to_string(), nick: UNKNOWN_NICK.to_string()
        },
    }
}

fn flush(out_path: &Path, buffer: &mut Vec<String>) -> Result<(), Failed> {
    if buffer.is_empty() {
        return Ok(())
    }
    let mut file = OpenOptions::new().create(true).append(true).open(out_path)
        .map_err(|err| {
            error!("Failed to open results journal {}: {}", out_path.display(), err);
            Failed
        })?;
    for line in buffer.drain(..) {
        if let Err(err) = writeln!(file, "{line}") {
            error!("Failed to write to results journal: {}", err);
            return Err(Failed)
        }
    }
    if let Err(err) = file.flush() {
        warn!("Failed to flush results journal: {}", err);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn record_round_trips_through_json() {
        let record = ResultRecord {
            time: 1_700_000_000,
            rtt: Some(0.123),
            x: RelayInfo {
                fp: "A".repeat(40).parse().unwrap(),
                ip: "1.2.3.4".into(),
                nick: "alice".into(),
            },
            y: RelayInfo {
                fp: "B".repeat(40).parse().unwrap(),
                ip: "5.6.7.8".into(),
                nick: "bob".into(),
            },
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: ResultRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.rtt, Some(0.123));
        assert_eq!(back.x.fp, record.x.fp);
    }

    #[test]
    fn null_rtt_round_trips() {
        let json = serde_json::json!({
            "time": 1, "rtt": null,
            "x": {"fp": "A".repeat(40), "ip": "0.0.0.0", "nick": "(unknown)"},
            "y": {"fp": "B".repeat(40), "ip": "0.0.0.0", "nick": "(unknown)"},
        }).to_string();
        let record: ResultRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record.rtt, None);
    }
}
