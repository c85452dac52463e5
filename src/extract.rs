// src/extract.rs

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to launch extractor: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("extractor exited with {0}")]
    Failed(String),
}

/// Unpacks a downloaded archive, reporting progress in `0.0..=1.0`.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        archive: &Path,
        destination: &Path,
        progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<(), ExtractError>;
}

/// Where an archive is unpacked: next to it, named after its stem.
pub fn extraction_dir(archive: &Path) -> PathBuf {
    archive.with_extension("")
}

/// Runs the 7-Zip command line tool.
pub struct SevenZipExtractor {
    binary: PathBuf,
}

impl SevenZipExtractor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }
}

#[async_trait]
impl Extractor for SevenZipExtractor {
    async fn extract(
        &self,
        archive: &Path,
        destination: &Path,
        progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<(), ExtractError> {
        tokio::fs::create_dir_all(destination).await?;
        info!(archive = %archive.display(), destination = %destination.display(), "extracting");

        let mut output_flag = std::ffi::OsString::from("-o");
        output_flag.push(destination);
        let mut child = Command::new(&self.binary)
            .arg("x")
            .arg(archive)
            .arg(output_flag)
            .args(["-y", "-bsp1", "-bso0"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(ExtractError::Spawn)?;

        if let Some(mut stdout) = child.stdout.take() {
            let mut parser = ProgressParser::default();
            let mut buf = [0u8; 1024];
            loop {
                let n = stdout.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                for percent in parser.feed(&buf[..n]) {
                    progress(f64::from(percent) / 100.0);
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(ExtractError::Failed(status.to_string()));
        }
        debug!(archive = %archive.display(), "extraction finished");
        progress(1.0);
        Ok(())
    }
}

/// Pulls `NN%` tokens out of 7-Zip's progress output, which redraws a single
/// line with backspaces and carriage returns.
#[derive(Debug, Default)]
pub struct ProgressParser {
    pending: String,
    last: Option<u8>,
}

impl ProgressParser {
    /// Returns each new percentage found in `chunk`, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.pending.push_str(&String::from_utf8_lossy(chunk));
        let is_separator = |c: char| c.is_whitespace() || c == '\u{8}';

        // The trailing token may be cut mid-number; keep it for the next chunk.
        let split_at = self
            .pending
            .char_indices()
            .rev()
            .find(|(_, c)| is_separator(*c))
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        let complete: String = self.pending.drain(..split_at).collect();

        let mut found = Vec::new();
        for token in complete.split(is_separator) {
            let Some(number) = token.strip_suffix('%') else { continue };
            let Ok(percent) = number.parse::<u8>() else { continue };
            if percent <= 100 && self.last != Some(percent) {
                self.last = Some(percent);
                found.push(percent);
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backspace_redrawn_progress() {
        let mut parser = ProgressParser::default();
        let out = parser.feed(b"  0%\x08\x08\x08\x08  12% 3 - Game/data.bin\x08\x08\x08\x08\x08 45% ");
        assert_eq!(out, vec![0, 12, 45]);
    }

    #[test]
    fn token_split_across_chunks_is_reassembled() {
        let mut parser = ProgressParser::default();
        assert!(parser.feed(b" 3").is_empty());
        assert_eq!(parser.feed(b"7% \r"), vec![37]);
        assert_eq!(parser.feed(b" 37% 100%\n"), vec![100]);
    }

    #[test]
    fn unrelated_output_is_ignored() {
        let mut parser = ProgressParser::default();
        assert!(parser.feed(b"Extracting archive: game.rar\n--\nPath = game.rar\n").is_empty());
    }

    #[test]
    fn archive_unpacks_next_to_itself() {
        assert_eq!(extraction_dir(Path::new("/games/My Game.rar")), PathBuf::from("/games/My Game"));
    }
}
