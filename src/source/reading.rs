//! Turning downloaded files into events.

use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::FlowError;

/// What the event payload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingMode {
    /// Only the local path; the consumer opens the file itself.
    #[default]
    Ref,
    /// The whole file (base64 in JSON output).
    Contents,
    /// The file decoded as UTF-8 text, one entry per line. Invalid UTF-8
    /// fails the file rather than being replaced.
    Lines,
}

impl FromStr for ReadingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ref" => Ok(Self::Ref),
            "contents" => Ok(Self::Contents),
            "lines" => Ok(Self::Lines),
            other => Err(format!(
                "unknown reading mode '{other}' (expected ref, contents or lines)"
            )),
        }
    }
}

impl fmt::Display for ReadingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ref => "ref",
            Self::Contents => "contents",
            Self::Lines => "lines",
        })
    }
}

/// A downloaded file under its final local name. Owned by the consumer from
/// the moment its event is emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalStagedFile {
    pub local_path: PathBuf,
    pub source_remote_path: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    /// Hex digest of the bytes received.
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Payload {
    Ref,
    Contents {
        #[serde(serialize_with = "as_base64")]
        data: Vec<u8>,
    },
    Lines {
        lines: Vec<String>,
    },
}

fn as_base64<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
}

/// One event per ingested file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEvent {
    #[serde(flatten)]
    pub file: LocalStagedFile,
    pub payload: Payload,
}

impl FileEvent {
    /// Build the event for `file`, reading it back from disk when the mode
    /// needs its content.
    pub fn read(file: LocalStagedFile, mode: ReadingMode) -> Result<Self, FlowError> {
        let payload = match mode {
            ReadingMode::Ref => Payload::Ref,
            ReadingMode::Contents => Payload::Contents {
                data: std::fs::read(&file.local_path)
                    .map_err(|e| FlowError::local_io(&file.local_path, e))?,
            },
            ReadingMode::Lines => {
                let bytes = std::fs::read(&file.local_path)
                    .map_err(|e| FlowError::local_io(&file.local_path, e))?;
                let text = String::from_utf8(bytes).map_err(|e| {
                    FlowError::local_io(
                        &file.local_path,
                        std::io::Error::new(std::io::ErrorKind::InvalidData, e),
                    )
                })?;
                Payload::Lines {
                    lines: text.lines().map(str::to_string).collect(),
                }
            }
        };
        Ok(Self { file, payload })
    }
}

/// Where the source hands its events.
pub trait EventEmitter {
    fn emit(&mut self, event: FileEvent) -> Result<(), FlowError>;
}

impl EventEmitter for Vec<FileEvent> {
    fn emit(&mut self, event: FileEvent) -> Result<(), FlowError> {
        self.push(event);
        Ok(())
    }
}

/// Writes each event as one JSON line and flushes, so a downstream reader
/// sees it immediately.
pub struct JsonLinesEmitter<W: Write> {
    writer: W,
    emitted: usize,
}

impl<W: Write> JsonLinesEmitter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            emitted: 0,
        }
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> EventEmitter for JsonLinesEmitter<W> {
    fn emit(&mut self, event: FileEvent) -> Result<(), FlowError> {
        let write = |writer: &mut W| -> std::io::Result<()> {
            serde_json::to_writer(&mut *writer, &event)?;
            writer.write_all(b"\n")?;
            writer.flush()
        };
        write(&mut self.writer).map_err(|e| FlowError::Emit(e.to_string()))?;
        self.emitted += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(dir: &std::path::Path, name: &str, content: &[u8]) -> LocalStagedFile {
        let local_path = dir.join(name);
        std::fs::write(&local_path, content).unwrap();
        LocalStagedFile {
            local_path,
            source_remote_path: format!("/outbox/{name}"),
            size: content.len() as u64,
            modified: None,
            sha256: String::new(),
        }
    }

    #[test]
    fn test_reading_mode_parse() {
        assert_eq!("REF".parse::<ReadingMode>().unwrap(), ReadingMode::Ref);
        assert_eq!("lines".parse::<ReadingMode>().unwrap(), ReadingMode::Lines);
        assert!("raw".parse::<ReadingMode>().is_err());
        assert_eq!(ReadingMode::Contents.to_string(), "contents");
    }

    #[test]
    fn test_lines_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let file = staged(tmp.path(), "a.txt", b"one\ntwo\r\nthree");
        let event = FileEvent::read(file, ReadingMode::Lines).unwrap();
        assert_eq!(
            event.payload,
            Payload::Lines {
                lines: vec!["one".into(), "two".into(), "three".into()]
            }
        );
    }

    #[test]
    fn test_lines_rejects_invalid_utf8() {
        let tmp = tempfile::tempdir().unwrap();
        let file = staged(tmp.path(), "a.txt", b"ok\n\xff\xfe\n");
        match FileEvent::read(file.clone(), ReadingMode::Lines) {
            Err(FlowError::LocalIo { path, source }) => {
                assert_eq!(path, file.local_path);
                assert_eq!(source.kind(), std::io::ErrorKind::InvalidData);
            }
            other => panic!("expected LocalIo, got {other:?}"),
        }
        // The bytes are still fine as contents.
        assert!(FileEvent::read(file, ReadingMode::Contents).is_ok());
    }

    #[test]
    fn test_contents_serialized_as_base64() {
        let tmp = tempfile::tempdir().unwrap();
        let file = staged(tmp.path(), "a.bin", b"hi");
        let event = FileEvent::read(file, ReadingMode::Contents).unwrap();

        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["mode"], "contents");
        assert_eq!(json["payload"]["data"], "aGk=");
        assert_eq!(json["source_remote_path"], "/outbox/a.bin");
        assert!(json.get("modified").is_none());
    }

    #[test]
    fn test_missing_file_is_local_io() {
        let tmp = tempfile::tempdir().unwrap();
        let file = LocalStagedFile {
            local_path: tmp.path().join("gone.txt"),
            source_remote_path: "/outbox/gone.txt".into(),
            size: 0,
            modified: None,
            sha256: String::new(),
        };
        assert!(matches!(
            FileEvent::read(file.clone(), ReadingMode::Contents),
            Err(FlowError::LocalIo { .. })
        ));
        // Ref mode never touches the file.
        assert!(FileEvent::read(file, ReadingMode::Ref).is_ok());
    }

    #[test]
    fn test_json_lines_emitter() {
        let tmp = tempfile::tempdir().unwrap();
        let mut emitter = JsonLinesEmitter::new(Vec::new());
        for name in ["a.txt", "b.txt"] {
            let event = FileEvent::read(staged(tmp.path(), name, b"x"), ReadingMode::Ref).unwrap();
            emitter.emit(event).unwrap();
        }
        assert_eq!(emitter.emitted(), 2);

        let out = String::from_utf8(emitter.into_inner()).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["payload"]["mode"], "ref");
        assert_eq!(first["source_remote_path"], "/outbox/a.txt");
    }
}
