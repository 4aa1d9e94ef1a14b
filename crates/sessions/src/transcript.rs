//! Append-only JSONL transcripts.
//!
//! Each session gets a `<sessionId>.jsonl` file under the sessions directory.
//! The file opens with a `session` header record, followed by one
//! `message` record per inbound/outbound line.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use gw_domain::error::{Error, Result};
use gw_domain::trace::TraceEvent;

/// A single transcript line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptLine {
    pub timestamp: String,
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// The first record in a transcript file, written once by [`TranscriptWriter::ensure`].
/// Parses as neither a valid `TranscriptLine` nor a conscious error: [`TranscriptWriter::read`]
/// skips it the same way it skips any other malformed line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptHeader {
    #[serde(rename = "type")]
    pub record_type: String,
    pub version: u32,
    pub id: String,
    pub timestamp: String,
    pub cwd: String,
}

/// Default byte budget for [`TranscriptWriter::read_tail`]: read from the end of
/// the file until this many bytes have been scanned.
pub const DEFAULT_TAIL_BYTE_CAP: u64 = 1024 * 1024;
/// Default number of newest records `read_tail` returns when the caller doesn't ask for fewer.
pub const DEFAULT_TAIL_LIMIT: usize = 200;
/// No caller may request more than this many records from `read_tail`.
pub const MAX_TAIL_LIMIT: usize = 1000;

/// Writes append-only JSONL transcript files.
pub struct TranscriptWriter {
    base_dir: PathBuf,
}

impl TranscriptWriter {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
        }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{session_id}.jsonl"))
    }

    /// Write the session header record if the transcript file doesn't exist yet.
    /// Idempotent: a no-op if the file is already present.
    pub fn ensure(&self, session_id: &str, cwd: &str) -> Result<()> {
        let path = self.path_for(session_id);
        if path.exists() {
            return Ok(());
        }

        let header = TranscriptHeader {
            record_type: "session".to_string(),
            version: 1,
            id: session_id.to_owned(),
            timestamp: Utc::now().to_rfc3339(),
            cwd: cwd.to_owned(),
        };
        let json = serde_json::to_string(&header)
            .map_err(|e| Error::Other(format!("serializing transcript header: {e}")))?;

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(Error::Io)?;
        writeln!(file, "{json}").map_err(Error::Io)?;
        Ok(())
    }

    /// Append one or more lines to a session's transcript, creating the header
    /// record first if this is the first write to the file.
    pub fn append(
        &self,
        session_id: &str,
        lines: &[TranscriptLine],
    ) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }

        self.ensure(session_id, ".")?;

        let path = self.path_for(session_id);
        let mut buf = String::new();
        for line in lines {
            let json = serde_json::to_string(line)
                .map_err(|e| Error::Other(format!("serializing transcript line: {e}")))?;
            buf.push_str(&json);
            buf.push('\n');
        }

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(Error::Io)?;
        file.write_all(buf.as_bytes()).map_err(Error::Io)?;

        TraceEvent::TranscriptAppend {
            session_id: session_id.to_owned(),
            lines: lines.len(),
        }
        .emit();

        Ok(())
    }

    /// Helper to create a transcript line with the current timestamp.
    pub fn line(role: &str, content: &str) -> TranscriptLine {
        TranscriptLine {
            timestamp: Utc::now().to_rfc3339(),
            role: role.to_owned(),
            content: content.to_owned(),
            metadata: None,
        }
    }

    /// Read back a transcript in full (compaction needs the complete history
    /// to find its boundary; callers that only want recent context should use
    /// [`Self::read_tail`] instead).
    pub fn read(&self, session_id: &str) -> Result<Vec<TranscriptLine>> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        Ok(Self::parse_lines(session_id, raw.lines()))
    }

    /// Read only the newest records, bounded both by a byte budget scanned
    /// from the end of the file and by a record-count limit (clamped to
    /// [`MAX_TAIL_LIMIT`]). Used by transcript export / dashboard views where
    /// the full history isn't needed.
    pub fn read_tail(
        &self,
        session_id: &str,
        byte_cap: u64,
        limit: usize,
    ) -> Result<Vec<TranscriptLine>> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let limit = limit.min(MAX_TAIL_LIMIT).max(1);
        let meta = std::fs::metadata(&path).map_err(Error::Io)?;
        let size = meta.len();
        let start = size.saturating_sub(byte_cap);

        use std::io::{Read, Seek, SeekFrom};
        let mut file = std::fs::File::open(&path).map_err(Error::Io)?;
        file.seek(SeekFrom::Start(start)).map_err(Error::Io)?;
        let mut raw = String::new();
        file.read_to_string(&mut raw).map_err(Error::Io)?;

        // A seek into the middle of the file likely lands mid-line; drop the
        // first (possibly truncated) line unless we started at byte 0.
        let raw = if start > 0 {
            raw.splitn(2, '\n').nth(1).unwrap_or("")
        } else {
            raw.as_str()
        };

        let mut lines = Self::parse_lines(session_id, raw.lines());
        if lines.len() > limit {
            lines.drain(0..lines.len() - limit);
        }
        Ok(lines)
    }

    fn parse_lines<'a>(session_id: &str, raw_lines: impl Iterator<Item = &'a str>) -> Vec<TranscriptLine> {
        let mut lines = Vec::new();
        for line in raw_lines {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TranscriptLine>(line) {
                Ok(tl) => lines.push(tl),
                Err(e) => {
                    tracing::warn!(
                        session_id = session_id,
                        error = %e,
                        "skipping malformed transcript line"
                    );
                }
            }
        }
        lines
    }

    /// Logically delete a transcript by renaming it out of the active
    /// namespace rather than unlinking it, mirroring the "never truly
    /// delete, preserve for audit" posture of the OpenClaw import staging
    /// retention logic.
    pub fn mark_deleted(&self, session_id: &str) -> Result<()> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(());
        }
        let deleted_path = self
            .base_dir
            .join(format!("{session_id}.deleted.{}.jsonl", Utc::now().timestamp()));
        std::fs::rename(&path, &deleted_path).map_err(Error::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_writes_header_before_first_message() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TranscriptWriter::new(dir.path());
        writer.append("s1", &[TranscriptWriter::line("user", "hi")]).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("s1.jsonl")).unwrap();
        let first_line = raw.lines().next().unwrap();
        let header: TranscriptHeader = serde_json::from_str(first_line).unwrap();
        assert_eq!(header.record_type, "session");
        assert_eq!(header.id, "s1");
    }

    #[test]
    fn read_skips_header_and_returns_messages() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TranscriptWriter::new(dir.path());
        writer
            .append(
                "s1",
                &[
                    TranscriptWriter::line("user", "hi"),
                    TranscriptWriter::line("assistant", "hello"),
                ],
            )
            .unwrap();

        let lines = writer.read("s1").unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].role, "user");
        assert_eq!(lines[1].role, "assistant");
    }

    #[test]
    fn read_tail_limits_to_requested_count() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TranscriptWriter::new(dir.path());
        for i in 0..10 {
            writer
                .append("s1", &[TranscriptWriter::line("user", &format!("msg {i}"))])
                .unwrap();
        }

        let tail = writer.read_tail("s1", DEFAULT_TAIL_BYTE_CAP, 3).unwrap();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail.last().unwrap().content, "msg 9");
    }

    #[test]
    fn read_tail_clamps_limit_to_max() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TranscriptWriter::new(dir.path());
        writer.append("s1", &[TranscriptWriter::line("user", "hi")]).unwrap();

        // A limit above MAX_TAIL_LIMIT should not panic and should still
        // return the records actually present.
        let tail = writer.read_tail("s1", DEFAULT_TAIL_BYTE_CAP, MAX_TAIL_LIMIT + 500).unwrap();
        assert_eq!(tail.len(), 1);
    }

    #[test]
    fn mark_deleted_renames_instead_of_unlinking() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TranscriptWriter::new(dir.path());
        writer.append("s1", &[TranscriptWriter::line("user", "hi")]).unwrap();

        writer.mark_deleted("s1").unwrap();

        assert!(!dir.path().join("s1.jsonl").exists());
        let has_deleted_file = std::fs::read_dir(dir.path())
            .unwrap()
            .any(|e| e.unwrap().file_name().to_string_lossy().starts_with("s1.deleted."));
        assert!(has_deleted_file);
    }

    #[test]
    fn read_missing_session_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TranscriptWriter::new(dir.path());
        assert!(writer.read("does-not-exist").unwrap().is_empty());
    }
}
