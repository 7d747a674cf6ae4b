//! Offline replay of a raw capture.
//!
//! Feeds a file through the same decoder and parser as live ingest and
//! writes each sample's wire JSON on its own line. Useful for checking how
//! a capture from a new device firmware will be interpreted.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::Config;
use crate::constants::LINK_READ_CHUNK;
use crate::framing::LineDecoder;
use crate::record;

/// Counts from one replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    /// Samples written.
    pub samples: u64,
    /// Records the parser rejected.
    pub rejected: u64,
    /// Blank and diagnostic lines dropped.
    pub discarded: u64,
    /// Whether the input ended mid-line.
    pub truncated: bool,
}

/// Replay `path` to stdout using the decoder settings from `config`.
pub fn run(path: &Path, config: &Config) -> Result<ReplaySummary> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let decoder = LineDecoder::with_diagnostic_prefix(config.diagnostic_prefix.clone())
        .max_line_len(config.max_line_len);
    let stdout = std::io::stdout();
    let summary = replay(file, decoder, BufWriter::new(stdout.lock()))?;
    log::info!(
        "Replayed {}: {} samples, {} rejected, {} discarded",
        path.display(),
        summary.samples,
        summary.rejected,
        summary.discarded
    );
    Ok(summary)
}

/// Decode `input` in link-sized chunks and write one JSON line per sample.
pub fn replay<R, W>(mut input: R, mut decoder: LineDecoder, mut out: W) -> Result<ReplaySummary>
where
    R: Read,
    W: Write,
{
    let mut summary = ReplaySummary::default();
    let mut buf = vec![0u8; LINK_READ_CHUNK];

    loop {
        let n = input.read(&mut buf).context("Failed to read capture")?;
        if n == 0 {
            break;
        }
        for line in decoder.feed(&buf[..n]) {
            match record::parse(&line) {
                Ok(sample) => {
                    serde_json::to_writer(&mut out, &sample.wire())?;
                    out.write_all(b"\n")?;
                    summary.samples += 1;
                }
                Err(rejection) => {
                    log::debug!("Rejected {line:?}: {rejection}");
                    summary.rejected += 1;
                }
            }
        }
    }

    out.flush().context("Failed to flush output")?;
    summary.discarded = decoder.discarded();
    summary.truncated = decoder.has_partial();
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_replay_writes_wire_lines() {
        let input: &[u8] = b"[boot ok]\n1,00:00:01,dev,0.5,1\nlabel,only\n\n2,00:00:02,dev,7\n3,";
        let mut out = Vec::new();
        let summary = replay(input, LineDecoder::new(), &mut out).unwrap();

        assert_eq!(
            summary,
            ReplaySummary {
                samples: 2,
                rejected: 1,
                discarded: 2,
                truncated: true,
            }
        );

        let lines: Vec<Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["raw"], serde_json::json!([1.0, 0.5, 1.0]));
        assert_eq!(lines[1]["raw"], serde_json::json!([2.0, 7.0]));
        assert!(lines[0]["t"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_replay_uses_configured_prefix() {
        let input: &[u8] = b"# note,1\n[x],2\n";
        let mut out = Vec::new();
        let summary = replay(input, LineDecoder::with_diagnostic_prefix("#"), &mut out).unwrap();
        assert_eq!(summary.samples, 1);
        assert_eq!(summary.discarded, 1);
    }

    #[test]
    fn test_run_missing_file_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(run(&tmp.path().join("absent.txt"), &Config::default()).is_err());
    }
}
