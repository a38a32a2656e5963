use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{ProctorError, Result};
use crate::recording::RecordingSession;

/// Finished bundle of per-participant recordings.
#[derive(Debug, Clone)]
pub struct Archive {
    pub file_name: String,
    pub bytes: Vec<u8>,
    /// Entry names in archive order
    pub entries: Vec<String>,
}

pub struct ArchiveExporter {
    extension: String,
}

impl ArchiveExporter {
    pub fn new(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
        }
    }

    pub fn export<'a>(
        &self,
        sessions: impl IntoIterator<Item = &'a RecordingSession>,
    ) -> Result<Archive> {
        self.export_at(sessions, Utc::now())
    }

    /// Bundles every stopped session with data. Zero qualifying sessions
    /// yield a valid empty archive.
    pub fn export_at<'a>(
        &self,
        sessions: impl IntoIterator<Item = &'a RecordingSession>,
        timestamp: DateTime<Utc>,
    ) -> Result<Archive> {
        let file_name = format!("exam-recordings-{}.zip", timestamp.format("%Y-%m-%d"));

        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

        let mut entries = Vec::new();
        let mut used = HashSet::new();

        for session in sessions {
            if !session.is_exportable() {
                tracing::debug!(
                    identity = %session.identity(),
                    state = ?session.state(),
                    "Skipping session without finished data"
                );
                continue;
            }
            let Some(output) = session.output() else {
                continue;
            };

            let name = self.entry_name(session, &mut used);
            writer.start_file(name.as_str(), options)?;
            writer
                .write_all(output)
                .map_err(|e| ProctorError::export(format!("Failed to write {}: {}", name, e)))?;

            tracing::debug!(entry = %name, bytes = output.len(), "Added recording to archive");
            entries.push(name);
        }

        let bytes = writer.finish()?.into_inner();

        tracing::info!(
            archive = %file_name,
            entries = entries.len(),
            bytes = bytes.len(),
            "Archive exported"
        );

        Ok(Archive {
            file_name,
            bytes,
            entries,
        })
    }

    fn entry_name(&self, session: &RecordingSession, used: &mut HashSet<String>) -> String {
        let mut name = format!("{}.{}", sanitize(session.label()), self.extension);
        if !used.insert(name.clone()) {
            name = format!(
                "{}-{}.{}",
                sanitize(session.label()),
                sanitize(session.identity()),
                self.extension
            );
            used.insert(name.clone());
        }
        name
    }

    /// Writes the archive into `dir`, creating it if needed.
    pub fn save(&self, archive: &Archive, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| ProctorError::export(format!("Failed to create {}: {}", dir.display(), e)))?;

        let path = dir.join(&archive.file_name);
        std::fs::write(&path, &archive.bytes)
            .map_err(|e| ProctorError::export(format!("Failed to write {}: {}", path.display(), e)))?;

        tracing::info!(path = %path.display(), "Archive saved");
        Ok(path)
    }
}

fn sanitize(stem: &str) -> String {
    let cleaned: String = stem
        .chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "recording".to_string()
    } else {
        cleaned
    }
}
