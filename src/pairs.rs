//! Enumerating relay pairs to measure.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead};
use std::path::Path;
use std::time::Duration;
use log::{info, warn};
use rand::seq::SliceRandom;
use rand::thread_rng;
use log::error;
use crate::error::Failed;
use crate::fingerprint::{Fingerprint, Pair};
use crate::results::ResultRecord;
use crate::utils::compress::open_lines;
use crate::utils::date::now_unix;

/// Parses pairs out of any line-based source: one pair per line as
/// `FP1 FP2`, blank lines and `#`-comments ignored.
pub fn parse_pairs(reader: impl BufRead) -> Result<HashSet<Pair>, Failed> {
    let mut pairs = HashSet::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.map_err(|err| {
            error!("Failed to read pair list at line {}: {}", lineno + 1, err);
            Failed
        })?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue
        }
        let mut fields = line.split_whitespace();
        let (a, b) = match (fields.next(), fields.next()) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                warn!("Ignoring malformed pair line {}: '{}'", lineno + 1, line);
                continue
            }
        };
        let a: Fingerprint = a.parse().map_err(|err| {
            error!("Bad fingerprint on line {}: {}", lineno + 1, err);
            Failed
        })?;
        let b: Fingerprint = b.parse().map_err(|err| {
            error!("Bad fingerprint on line {}: {}", lineno + 1, err);
            Failed
        })?;
        pairs.insert(Pair::new(a, b));
    }
    Ok(pairs)
}

/// Reads pairs from a file, transparently decompressing `.gz`/`.xz`.
pub fn from_file(path: &Path) -> Result<HashSet<Pair>, Failed> {
    parse_pairs(open_lines(path)?)
}

/// Reads pairs from standard input.
pub fn from_stdin() -> Result<HashSet<Pair>, Failed> {
    parse_pairs(io::BufReader::new(io::stdin()))
}

/// Samples random unordered pairs out of a live relay set until
/// `max_pairs` distinct pairs have been found.
///
/// Bounds the number of sampling attempts to a small multiple of
/// `max_pairs` so a relay set too small to fill the cap can't loop
/// forever; logs a warning if it comes up short.
pub fn sample_pairs(relays: &[Fingerprint], max_pairs: usize) -> HashSet<Pair> {
    let mut pairs = HashSet::new();
    if relays.len() < 2 || max_pairs == 0 {
        return pairs
    }
    let mut rng = thread_rng();
    let attempt_limit = max_pairs.saturating_mul(10).max(100);
    for _ in 0..attempt_limit {
        if pairs.len() >= max_pairs {
            break
        }
        let sample: Vec<&Fingerprint> = relays.choose_multiple(&mut rng, 2).collect();
        if let [a, b] = sample[..] {
            pairs.insert(Pair::new(a.clone(), b.clone()));
        }
    }
    if pairs.len() < max_pairs {
        warn!(
            "Only sampled {} of the requested {} pairs from {} relays.",
            pairs.len(), max_pairs, relays.len()
        );
    }
    pairs
}

/// Removes every pair whose most recent result in `result_journal` is
/// still fresh (`time + ttl >= now`), so reruns pick up where a previous
/// run left off.
pub fn prune_recent(
    pairs: &mut HashSet<Pair>, result_journal: &Path, ttl: Duration,
) -> Result<(), Failed> {
    let file = match File::open(result_journal) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            error!("Failed to open results journal {}: {}", result_journal.display(), err);
            return Err(Failed)
        }
    };
    let now = now_unix();
    let mut pruned = 0;
    for (lineno, line) in io::BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|err| {
            error!("Failed to read results journal at line {}: {}", lineno + 1, err);
            Failed
        })?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue
        }
        let record: ResultRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(err) => {
                warn!("Ignoring malformed result record at line {}: {}", lineno + 1, err);
                continue
            }
        };
        if record.time + ttl.as_secs() >= now {
            let pair = Pair::new(record.x.fp.clone(), record.y.fp.clone());
            if pairs.remove(&pair) {
                pruned += 1;
            }
        }
    }
    if pruned > 0 {
        info!("Pruned {} pairs with a result still fresh within {}s.", pruned, ttl.as_secs());
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn fp(c: char) -> Fingerprint {
        c.to_string().repeat(40).parse().unwrap()
    }

    #[test]
    fn parses_and_canonicalizes() {
        let a = "A".repeat(40);
        let b = "B".repeat(40);
        let text = format!("{b} {a}\n# comment\n\n{a} {b}\n");
        let pairs = parse_pairs(Cursor::new(text)).unwrap();
        assert_eq!(pairs.len(), 1);
        let pair = pairs.iter().next().unwrap();
        assert_eq!(pair.first().as_str(), a);
        assert_eq!(pair.second().as_str(), b);
    }

    #[test]
    fn rejects_bad_fingerprint() {
        let text = "short fingerprint\n";
        assert!(parse_pairs(Cursor::new(text)).is_err());
    }

    #[test]
    fn sampling_caps_at_max_pairs() {
        let relays: Vec<_> = ('A'..='J').map(fp).collect();
        let pairs = sample_pairs(&relays, 5);
        assert!(pairs.len() <= 5);
    }

    #[test]
    fn sampling_too_few_relays_is_empty() {
        let relays = vec![fp('A')];
        assert!(sample_pairs(&relays, 5).is_empty());
    }
}
