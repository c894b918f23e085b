//! Tail-latency feed from the load generator's output.
//!
//! The load generator prints one line per reporting period, e.g.
//!
//! ```text
//! #type       avg     std     min     5th    10th    50th    90th    95th    99th
//! read      612.3   101.7   301.2   ...
//! 95%:   742us
//! ```
//!
//! Lines carrying the configured percentile are parsed to milliseconds and
//! published through a `watch` channel; consumers see each value at most once.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Poll interval while waiting for the file to grow or appear.
const TAIL_POLL: Duration = Duration::from_millis(50);

/// Extract `<percentile>%: <value><unit>` from a line, in milliseconds.
pub fn parse_percentile_ms(line: &str, percentile: u8) -> Option<f64> {
    let key = format!("{percentile}%:");
    let start = line.find(&key)? + key.len();
    let rest = line[start..].trim_start();

    let digits = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let value: f64 = rest[..digits].parse().ok()?;
    let unit = rest[digits..].trim_start();

    if unit.starts_with("us") {
        Some(value / 1000.0)
    } else if unit.starts_with("ms") {
        Some(value)
    } else if unit.starts_with('s') {
        Some(value * 1000.0)
    } else if unit.is_empty() {
        // Bare numbers are microseconds.
        Some(value / 1000.0)
    } else {
        None
    }
}

/// Latest tail latency observed by a background tail task.
pub struct LatencyFeed {
    rx: watch::Receiver<Option<f64>>,
}

impl LatencyFeed {
    /// Wrap an existing channel.
    pub fn from_receiver(rx: watch::Receiver<Option<f64>>) -> Self {
        Self { rx }
    }

    /// Follow `path` from its current end, publishing each parsed value.
    pub fn tail(
        path: PathBuf,
        percentile: u8,
        mut shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = watch::channel(None);

        let handle = tokio::spawn(async move {
            info!(path = %path.display(), percentile, "Following load generator output");
            tokio::select! {
                _ = follow(path, percentile, tx) => {}
                _ = shutdown.changed() => {
                    debug!("Latency feed stopping");
                }
            }
        });

        (Self { rx }, handle)
    }

    /// The newest value not yet taken, if any.
    pub fn take_latest(&mut self) -> Option<f64> {
        match self.rx.has_changed() {
            Ok(true) => *self.rx.borrow_and_update(),
            _ => None,
        }
    }
}

async fn follow(path: PathBuf, percentile: u8, tx: watch::Sender<Option<f64>>) {
    let file = loop {
        match tokio::fs::File::open(&path).await {
            Ok(f) => break f,
            Err(_) => tokio::time::sleep(TAIL_POLL).await,
        }
    };

    let mut reader = BufReader::new(file);
    let mut pos = match reader.seek(SeekFrom::End(0)).await {
        Ok(p) => p,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot seek latency source");
            return;
        }
    };

    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                // Start over if the file was truncated.
                if let Ok(meta) = tokio::fs::metadata(&path).await {
                    if meta.len() < pos {
                        debug!(path = %path.display(), "Latency source truncated");
                        pos = reader.seek(SeekFrom::Start(0)).await.unwrap_or(0);
                    }
                }
                tokio::time::sleep(TAIL_POLL).await;
            }
            Ok(n) => {
                pos += n as u64;
                if let Some(ms) = parse_percentile_ms(&line, percentile) {
                    if tx.send(Some(ms)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Reading latency source failed");
                tokio::time::sleep(TAIL_POLL).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    #[rstest]
    #[case("95%:   742us", 95, Some(0.742))]
    #[case("p 99%: 1.5ms", 99, Some(1.5))]
    #[case("95%: 2s", 95, Some(2000.0))]
    #[case("95%: 800", 95, Some(0.8))]
    #[case("99%: 742us", 95, None)]
    #[case("95%: fast", 95, None)]
    #[case("95%: 742 parsecs", 95, None)]
    fn test_parse_percentile(#[case] line: &str, #[case] percentile: u8, #[case] expected: Option<f64>) {
        assert_eq!(parse_percentile_ms(line, percentile), expected);
    }

    #[tokio::test]
    async fn test_tail_publishes_new_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcperf.txt");
        std::fs::write(&path, "95%: 9999us\n").unwrap();

        let (_tx, shutdown) = watch::channel(false);
        let (mut feed, handle) = LatencyFeed::tail(path.clone(), 95, shutdown);

        // Pre-existing content is skipped.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(feed.take_latest(), None);

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "read 1 2 3").unwrap();
        writeln!(file, "95%: 650us").unwrap();
        file.flush().unwrap();

        let mut seen = None;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            seen = feed.take_latest();
            if seen.is_some() {
                break;
            }
        }
        assert_eq!(seen, Some(0.65));
        assert_eq!(feed.take_latest(), None);

        handle.abort();
    }
}
