// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Stream capture listeners
//!
//! Every child stream gets a tee listener that forks bytes to the next
//! pipeline stage and/or a sink file while maintaining a running SHA-256,
//! the last kilobyte for postmortems, and byte/line counts.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

/// Bytes of tail kept per stream for postmortem reporting.
pub const TAIL_LENGTH: usize = 1024;

/// Block size of the copy loop.
pub const COPY_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Capture metadata for one stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamReport {
    /// SHA-256 of the full byte sequence, hex encoded.
    pub sha256: String,

    /// Last [`TAIL_LENGTH`] bytes, lossily decoded.
    pub tail: String,

    /// Total byte count.
    pub length: u64,

    /// Total newline count.
    pub lines: u64,

    /// Sink file the stream was redirected into, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sink: Option<PathBuf>,
}

/// Distinct listener failure kinds; both cause pipeline teardown.
#[derive(Debug)]
pub enum ListenerError {
    SinkWrite { sink: PathBuf, error: std::io::Error },
    PipeWrite { error: std::io::Error },
    Read { error: std::io::Error },
}

/// Copy `source` to exhaustion, forking each block to the optional
/// downstream pipe and sink file while accumulating capture metadata.
///
/// Runs on its own thread; returns when the source reaches EOF or a write
/// fails. A failed write to the downstream pipe (e.g. the next command
/// exited early) is reported as a distinct error kind so the supervisor
/// can tear the pipeline down.
pub fn run_listener(
    mut source: impl Read,
    mut downstream: Option<File>,
    sink_path: Option<PathBuf>,
) -> Result<StreamReport, ListenerError> {
    let mut sink = match &sink_path {
        Some(path) => Some(File::create(path).map_err(|error| ListenerError::SinkWrite {
            sink: path.clone(),
            error,
        })?),
        None => None,
    };

    let mut hasher = Sha256::new();
    let mut tail: Vec<u8> = Vec::with_capacity(TAIL_LENGTH);
    let mut length: u64 = 0;
    let mut lines: u64 = 0;
    let mut block = vec![0u8; COPY_BLOCK_SIZE];

    loop {
        let n = match source.read(&mut block) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(ListenerError::Read { error }),
        };
        let chunk = &block[..n];

        hasher.update(chunk);
        length += n as u64;
        lines += chunk.iter().filter(|&&b| b == b'\n').count() as u64;

        if n >= TAIL_LENGTH {
            tail.clear();
            tail.extend_from_slice(&chunk[n - TAIL_LENGTH..]);
        } else {
            let keep = TAIL_LENGTH - n;
            if tail.len() > keep {
                tail.drain(..tail.len() - keep);
            }
            tail.extend_from_slice(chunk);
        }

        if let Some(f) = sink.as_mut() {
            if let Err(error) = f.write_all(chunk) {
                return Err(ListenerError::SinkWrite {
                    sink: sink_path.clone().unwrap_or_default(),
                    error,
                });
            }
        }

        if let Some(f) = downstream.as_mut() {
            if let Err(error) = f.write_all(chunk) {
                return Err(ListenerError::PipeWrite { error });
            }
        }
    }

    // Dropping the downstream write end delivers EOF to the next stage.
    drop(downstream);
    if let Some(f) = sink.as_mut() {
        f.flush().map_err(|error| ListenerError::SinkWrite {
            sink: sink_path.clone().unwrap_or_default(),
            error,
        })?;
    }

    Ok(StreamReport {
        sha256: hex::encode(hasher.finalize()),
        tail: String::from_utf8_lossy(&tail).into_owned(),
        length,
        lines,
        sink: sink_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_empty_stream_hashes_empty_sequence() {
        let report = run_listener(Cursor::new(Vec::new()), None, None).unwrap();
        assert_eq!(
            report.sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(report.length, 0);
        assert_eq!(report.lines, 0);
        assert_eq!(report.tail, "");
    }

    #[test]
    fn test_counts_and_hash() {
        let data = b"abc\ndef\n".to_vec();
        let report = run_listener(Cursor::new(data.clone()), None, None).unwrap();
        assert_eq!(report.length, 8);
        assert_eq!(report.lines, 2);
        assert_eq!(report.sha256, hex::encode(Sha256::digest(&data)));
    }

    #[test]
    fn test_tail_keeps_last_kilobyte() {
        let mut data = vec![b'x'; 2000];
        data.extend_from_slice(b"THE-END");
        let report = run_listener(Cursor::new(data), None, None).unwrap();
        assert_eq!(report.tail.len(), TAIL_LENGTH);
        assert!(report.tail.ends_with("THE-END"));
    }

    #[test]
    fn test_sink_receives_copy() {
        let dir = tempfile::tempdir().unwrap();
        let sink = dir.path().join("out.txt");
        let report =
            run_listener(Cursor::new(b"hello\n".to_vec()), None, Some(sink.clone())).unwrap();
        assert_eq!(std::fs::read(&sink).unwrap(), b"hello\n");
        assert_eq!(report.sink, Some(sink));
    }
}
