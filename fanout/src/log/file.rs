use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::error::{ErrorKind, FanoutResult};
use crate::fanout_error;
use crate::log::LogReader;
use crate::types::{Seqno, TransactionEvent};

/// Reader over a log stored as one JSON encoded [`TransactionEvent`] per line.
///
/// Reaching the end of the file yields `None`; lines appended later are picked up by the next
/// call. A trailing line without its newline is held back until it is complete. Transactions
/// below the start position are skipped.
#[derive(Debug)]
pub struct JsonLinesLogReader {
    path: PathBuf,
    reader: BufReader<File>,
    start_seqno: Seqno,
    line: String,
    line_number: u64,
}

impl JsonLinesLogReader {
    /// Opens the log at `path`, positioned at the first transaction with a sequence number of
    /// at least `start_seqno`.
    pub async fn open(path: impl AsRef<Path>, start_seqno: Seqno) -> FanoutResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await.map_err(|err| {
            fanout_error!(
                ErrorKind::IoError,
                "Failed to open the log file",
                format!("{}: {err}", path.display()),
                source: err
            )
        })?;

        debug!(path = %path.display(), start_seqno, "opened json lines log");

        Ok(Self {
            path,
            reader: BufReader::new(file),
            start_seqno,
            line: String::new(),
            line_number: 0,
        })
    }

    async fn read_line(&mut self) -> FanoutResult<Option<String>> {
        loop {
            let read = self.reader.read_line(&mut self.line).await?;
            if read == 0 || !self.line.ends_with('\n') {
                return Ok(None);
            }

            self.line_number += 1;
            let line = std::mem::take(&mut self.line);
            if !line.trim().is_empty() {
                return Ok(Some(line));
            }
        }
    }
}

impl LogReader for JsonLinesLogReader {
    async fn next_event(&mut self) -> FanoutResult<Option<TransactionEvent>> {
        while let Some(line) = self.read_line().await? {
            let event: TransactionEvent = serde_json::from_str(&line).map_err(|err| {
                fanout_error!(
                    ErrorKind::DecodingError,
                    "Failed to decode a log line",
                    format!("{}:{}: {err}", self.path.display(), self.line_number),
                    source: err
                )
            })?;

            if event.seqno >= self.start_seqno {
                return Ok(Some(event));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const LINES: &str = concat!(
        r#"{"seqno":1,"fragno":0,"last_frag":true,"shard_id":"a","commit_timestamp":"2024-01-01T00:00:00Z"}"#,
        "\n",
        "\n",
        r#"{"seqno":2,"fragno":0,"last_frag":true,"shard_id":"b","commit_timestamp":"2024-01-01T00:00:01Z"}"#,
        "\n",
    );

    #[tokio::test]
    async fn reads_events_from_start_position() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(LINES.as_bytes()).unwrap();

        let mut reader = JsonLinesLogReader::open(file.path(), 2).await.unwrap();
        let event = reader.next_event().await.unwrap().unwrap();
        assert_eq!(event.seqno, 2);
        assert_eq!(event.shard_id.as_deref(), Some("b"));
        assert!(reader.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn incomplete_line_is_held_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"seqno":7,"fragno":0,"last_frag":true,"#)
            .unwrap();
        file.flush().unwrap();

        let mut reader = JsonLinesLogReader::open(file.path(), 0).await.unwrap();
        assert!(reader.next_event().await.unwrap().is_none());

        file.write_all(b"\"commit_timestamp\":\"2024-01-01T00:00:00Z\"}\n")
            .unwrap();
        file.flush().unwrap();
        assert_eq!(reader.next_event().await.unwrap().unwrap().seqno, 7);
    }

    #[tokio::test]
    async fn malformed_line_is_a_decoding_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not json\n").unwrap();

        let mut reader = JsonLinesLogReader::open(file.path(), 0).await.unwrap();
        let err = reader.next_event().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecodingError);
    }
}
