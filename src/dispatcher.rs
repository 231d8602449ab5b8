//! Multiplexing measurement work across several engine processes.
//!
//! Each engine instance owns its own overlay daemon (and so its own
//! control/SOCKS ports), which is the only way to get process-level
//! parallelism on top of one daemon's single control connection
//! limitations. The dispatcher's job is purely logistics: split work
//! into chunks, hand each chunk to one engine's working directory,
//! wait for engines to exit, and fold their output back together.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use log::{error, info, warn};
use crate::cache;
use crate::config::DispatcherConfig;
use crate::error::Failed;
use crate::fingerprint::Pair;
use crate::pairs;
use crate::utils::fatal;

const DONE_MARKER: &str = "done";

/// One chunk of pairs assigned to one engine working directory.
struct Chunk {
    index: usize,
    pairs: Vec<Pair>,
    workdir: PathBuf,
}

impl Chunk {
    fn cache_file(&self, config: &DispatcherConfig) -> PathBuf {
        self.workdir.join(&config.out_cache_file)
    }

    fn result_file(&self, config: &DispatcherConfig) -> PathBuf {
        self.workdir.join(&config.out_result_file)
    }

    fn done_marker(&self) -> PathBuf {
        self.workdir.join(format!("chunk-{}.{}", self.index, DONE_MARKER))
    }

    fn is_done(&self) -> bool {
        self.done_marker().exists()
    }
}

/// Reads every pair file under `relaylist_dir`, splits the union into
/// `chunk_size`-pair chunks, and assigns each chunk a working
/// directory under `tmpdir`.
fn plan_chunks(config: &DispatcherConfig) -> Result<Vec<Chunk>, Failed> {
    let mut all_pairs: HashSet<Pair> = HashSet::new();
    for entry in fatal::read_dir(&config.relaylist_dir)? {
        let entry = entry?;
        if !entry.is_file() {
            continue
        }
        all_pairs.extend(pairs::from_file(entry.path())?);
    }
    let mut all_pairs: Vec<Pair> = all_pairs.into_iter().collect();
    all_pairs.sort();

    let chunks: Vec<Chunk> = all_pairs
        .chunks(config.chunk_size)
        .enumerate()
        .map(|(index, slice)| {
            let workdir = config.tmpdir.join(format!("chunk-{index}"));
            Chunk { index, pairs: slice.to_vec(), workdir }
        })
        .collect();
    info!(
        "Planned {} chunks of up to {} pairs each from {} distinct pairs.",
        chunks.len(), config.chunk_size, all_pairs.len()
    );
    Ok(chunks)
}

/// Runs every not-yet-`done` chunk, up to M (`config.engine_count()`)
/// concurrently, then merges caches and journals into the global
/// output files.
pub fn run(config: &DispatcherConfig) -> Result<(), Failed> {
    fatal::create_dir_all(&config.tmpdir)?;
    let chunks = plan_chunks(config)?;
    let pending: Vec<&Chunk> = chunks.iter().filter(|c| !c.is_done()).collect();
    info!("{} of {} chunks already done; {} remaining.",
        chunks.len() - pending.len(), chunks.len(), pending.len());

    let m = config.engine_count();
    let mut in_flight: Vec<(usize, std::process::Child)> = Vec::new();
    let mut queue = pending.into_iter();

    loop {
        while in_flight.len() < m {
            let chunk = match queue.next() {
                Some(chunk) => chunk,
                None => break,
            };
            let engine_slot = in_flight.len();
            let child = spawn_engine(config, chunk, engine_slot)?;
            in_flight.push((chunk.index, child));
        }
        if in_flight.is_empty() {
            break
        }
        let (index, mut child) = in_flight.remove(0);
        match child.wait() {
            Ok(status) if status.success() => {
                if let Some(chunk) = chunks.iter().find(|c| c.index == index) {
                    finish_chunk(config, chunk)?;
                }
            }
            Ok(status) => {
                warn!("Engine for chunk {} exited with {}; leaving it undone.", index, status);
            }
            Err(err) => {
                error!("Failed to wait for engine on chunk {}: {}", index, err);
                return Err(Failed)
            }
        }
    }

    merge_outputs(config, &chunks)
}

fn spawn_engine(
    config: &DispatcherConfig, chunk: &Chunk, engine_slot: usize,
) -> Result<Child, Failed> {
    fatal::create_dir_all(&chunk.workdir)?;

    let ctrl_port = config.ctrl_ports[engine_slot % config.ctrl_ports.len()];
    let socks_port = config.socks_ports[engine_slot % config.socks_ports.len()];

    let mut command = Command::new(engine_binary_path());
    command
        .current_dir(&chunk.workdir)
        .arg("--w-relay").arg(config.w_relay.as_str())
        .arg("--z-relay").arg(config.z_relay.as_str())
        .arg("--target-host").arg(&config.target_host)
        .arg("--target-port").arg(config.target_port.to_string())
        .arg("--samples").arg(config.samples.to_string())
        .arg("--threads").arg(config.threads.to_string())
        .arg("--ctrl-port").arg(ctrl_port.to_string())
        .arg("--socks-port").arg(socks_port.to_string())
        .arg("--relay-source").arg("stdin")
        .arg("--out-cache-file").arg(chunk.cache_file(config))
        .arg("--out-result-file").arg(chunk.result_file(config))
        .stdin(Stdio::piped())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    info!("Spawning engine for chunk {} in {}", chunk.index, chunk.workdir.display());
    let mut child = command.spawn().map_err(|err| {
        error!("Failed to spawn engine for chunk {}: {}", chunk.index, err);
        Failed
    })?;
    feed_pairs(&mut child, chunk)?;
    Ok(child)
}

/// Writes the chunk's pairs onto the just-spawned engine's stdin, then
/// closes it so the engine sees EOF and starts measuring.
fn feed_pairs(child: &mut Child, chunk: &Chunk) -> Result<(), Failed> {
    let mut stdin = child.stdin.take().ok_or_else(|| {
        error!("Engine for chunk {} has no stdin pipe", chunk.index);
        Failed
    })?;
    stdin.write_all(pairs_text(&chunk.pairs).as_bytes()).map_err(|err| {
        error!("Failed to write pairs to engine stdin for chunk {}: {}", chunk.index, err);
        Failed
    })
}

/// Renders pairs as the line-based `FP1 FP2` format the engine's pair
/// source parses, one pair per line in canonical order.
fn pairs_text(pairs: &[Pair]) -> String {
    let mut text = String::new();
    for pair in pairs {
        text.push_str(&format!("{} {}\n", pair.first(), pair.second()));
    }
    text
}

/// Locates the engine binary next to this one: `ting-dispatch` and
/// `ting-rtt` are always installed side by side in the same directory.
fn engine_binary_path() -> PathBuf {
    match std::env::current_exe() {
        Ok(path) => path.with_file_name("ting-rtt"),
        Err(_) => PathBuf::from("ting-rtt"),
    }
}

fn finish_chunk(config: &DispatcherConfig, chunk: &Chunk) -> Result<(), Failed> {
    info!("Chunk {} finished.", chunk.index);
    File::create(chunk.done_marker()).map_err(|err| {
        error!("Failed to write done marker for chunk {}: {}", chunk.index, err);
        Failed
    })?;
    let _ = config;
    Ok(())
}

fn merge_outputs(config: &DispatcherConfig, chunks: &[Chunk]) -> Result<(), Failed> {
    let cache_sources: Vec<PathBuf> = chunks.iter()
        .map(|c| c.cache_file(config))
        .collect();
    cache::merge_files(&cache_sources, &config.out_cache_file)?;
    info!("Merged {} per-chunk caches into {}.",
        cache_sources.len(), config.out_cache_file.display());

    append_results(config, chunks)
}

fn append_results(config: &DispatcherConfig, chunks: &[Chunk]) -> Result<(), Failed> {
    let mut out = fs::OpenOptions::new().create(true).append(true)
        .open(&config.out_result_file)
        .map_err(|err| {
            error!(
                "Failed to open global results journal {}: {}",
                config.out_result_file.display(), err
            );
            Failed
        })?;
    for chunk in chunks {
        let path = chunk.result_file(config);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => {
                error!("Failed to open per-chunk results {}: {}", path.display(), err);
                return Err(Failed)
            }
        };
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|err| {
                error!("Failed to read per-chunk results {}: {}", path.display(), err);
                Failed
            })?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue
            }
            writeln!(out, "{trimmed}").map_err(|err| {
                error!("Failed to append to global results journal: {}", err);
                Failed
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;
    use crate::fingerprint::Fingerprint;

    fn fp(c: char) -> Fingerprint {
        Fingerprint::from_str(&c.to_string().repeat(40)).unwrap()
    }

    #[test]
    fn done_marker_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = Chunk {
            index: 3,
            pairs: vec![Pair::new(fp('A'), fp('B'))],
            workdir: dir.path().to_path_buf(),
        };
        assert!(!chunk.is_done());
        File::create(chunk.done_marker()).unwrap();
        assert!(chunk.is_done());
    }

    #[test]
    fn renders_one_line_per_pair_in_canonical_order() {
        let pairs = vec![Pair::new(fp('B'), fp('A')), Pair::new(fp('D'), fp('C'))];
        let text = pairs_text(&pairs);
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(format!("{} {}", fp('A'), fp('B'))).as_deref());
        assert_eq!(lines.next(), Some(format!("{} {}", fp('C'), fp('D'))).as_deref());
        assert_eq!(lines.next(), None);
    }
}
