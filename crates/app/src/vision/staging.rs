//! Per-run temporary storage and input staging.

use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
};

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_EXTENSION: &str = "mp4";

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("failed to create staging directory under {root:?}")]
    CreateDir {
        root: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to prepare output directory {path:?}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to stage input into {path:?}")]
    WriteInput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Video handed to a run.
pub enum VideoInput {
    Path(PathBuf),
    /// Uploaded bytes; `file_name` only contributes its extension.
    Bytes {
        data: Vec<u8>,
        file_name: Option<String>,
    },
    Reader {
        reader: Box<dyn Read + Send>,
        file_name: Option<String>,
    },
}

impl VideoInput {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        VideoInput::Path(path.into())
    }

    pub fn bytes(data: impl Into<Vec<u8>>, file_name: Option<&str>) -> Self {
        VideoInput::Bytes {
            data: data.into(),
            file_name: file_name.map(str::to_owned),
        }
    }

    pub fn reader(reader: impl Read + Send + 'static, file_name: Option<&str>) -> Self {
        VideoInput::Reader {
            reader: Box::new(reader),
            file_name: file_name.map(str::to_owned),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            VideoInput::Path(path) => path.display().to_string(),
            VideoInput::Bytes { data, file_name } => format!(
                "{} ({} bytes)",
                file_name.as_deref().unwrap_or("<upload>"),
                data.len()
            ),
            VideoInput::Reader { file_name, .. } => {
                file_name.as_deref().unwrap_or("<stream>").to_string()
            }
        }
    }
}

impl std::fmt::Debug for VideoInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("VideoInput").field(&self.describe()).finish()
    }
}

/// Scratch space owned by one run.
///
/// The staging directory is deleted when the workspace is dropped, on every
/// exit path. The output path lives outside it and survives.
#[derive(Debug)]
pub struct RunWorkspace {
    run_id: Uuid,
    dir: Option<TempDir>,
    output_path: PathBuf,
}

impl RunWorkspace {
    pub fn create(
        run_id: Uuid,
        staging_root: Option<&Path>,
        output_dir: &Path,
    ) -> Result<Self, StagingError> {
        fs::create_dir_all(output_dir).map_err(|source| StagingError::OutputDir {
            path: output_dir.to_path_buf(),
            source,
        })?;

        let prefix = format!("annotate-{run_id}-");
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match staging_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|source| StagingError::CreateDir {
            root: staging_root
                .map(Path::to_path_buf)
                .unwrap_or_else(std::env::temp_dir),
            source,
        })?;

        let output_path = output_dir.join(format!("annotated-{run_id}.mp4"));
        debug!(
            run_id = %run_id,
            staging = %dir.path().display(),
            output = %output_path.display(),
            "created run workspace"
        );
        Ok(Self {
            run_id,
            dir: Some(dir),
            output_path,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn staging_dir(&self) -> Option<&Path> {
        self.dir.as_ref().map(TempDir::path)
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Make `input` available as a file the decoder can open.
    ///
    /// Paths are used in place and not checked here, so an unreadable file
    /// surfaces when the source opens it. Bytes and streams are written into
    /// the staging directory as `input-<run-id>.<ext>`.
    pub fn stage(&self, input: VideoInput) -> Result<PathBuf, StagingError> {
        match input {
            VideoInput::Path(path) => Ok(path),
            VideoInput::Bytes { data, file_name } => {
                let target = self.staged_input_path(file_name.as_deref())?;
                fs::write(&target, &data).map_err(|source| StagingError::WriteInput {
                    path: target.clone(),
                    source,
                })?;
                debug!(path = %target.display(), bytes = data.len(), "staged upload");
                Ok(target)
            }
            VideoInput::Reader {
                mut reader,
                file_name,
            } => {
                let target = self.staged_input_path(file_name.as_deref())?;
                let copied = fs::File::create(&target)
                    .and_then(|mut file| io::copy(&mut reader, &mut file))
                    .map_err(|source| StagingError::WriteInput {
                        path: target.clone(),
                        source,
                    })?;
                debug!(path = %target.display(), bytes = copied, "staged stream");
                Ok(target)
            }
        }
    }

    fn staged_input_path(&self, file_name: Option<&str>) -> Result<PathBuf, StagingError> {
        let dir = self.staging_dir().ok_or_else(|| StagingError::WriteInput {
            path: PathBuf::new(),
            source: io::Error::new(io::ErrorKind::NotFound, "workspace already released"),
        })?;
        let extension = file_name
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
        Ok(dir.join(format!("input-{}.{extension}", self.run_id)))
    }

    /// Remove the staging directory now. Failures are logged, not returned,
    /// so they never hide the run's own outcome.
    pub fn release(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(err) = dir.close() {
                warn!(run_id = %self.run_id, path = %path.display(), "failed to remove staging directory: {err}");
            }
        }
    }
}

impl Drop for RunWorkspace {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn names_are_unique_per_run() {
        let root = tempfile::tempdir().unwrap();
        let out = root.path().join("out");
        let a = RunWorkspace::create(Uuid::new_v4(), Some(root.path()), &out).unwrap();
        let b = RunWorkspace::create(Uuid::new_v4(), Some(root.path()), &out).unwrap();
        assert_ne!(a.staging_dir(), b.staging_dir());
        assert_ne!(a.output_path(), b.output_path());
        assert!(out.is_dir());

        let name = a.staging_dir().unwrap().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(&format!("annotate-{}-", a.run_id())));
        assert_eq!(
            a.output_path().file_name().unwrap().to_string_lossy(),
            format!("annotated-{}.mp4", a.run_id())
        );
    }

    #[test]
    fn staged_bytes_keep_the_extension_and_vanish_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let ws = RunWorkspace::create(Uuid::new_v4(), Some(root.path()), root.path()).unwrap();
        let staged = ws
            .stage(VideoInput::bytes(b"movie".to_vec(), Some("clip.MOV")))
            .unwrap();
        assert_eq!(staged.extension().unwrap(), "mov");
        assert_eq!(fs::read(&staged).unwrap(), b"movie");

        let staging_dir = ws.staging_dir().unwrap().to_path_buf();
        drop(ws);
        assert!(!staging_dir.exists());
        assert!(!staged.exists());
    }

    #[test]
    fn streams_default_to_mp4() {
        let root = tempfile::tempdir().unwrap();
        let ws = RunWorkspace::create(Uuid::new_v4(), Some(root.path()), root.path()).unwrap();
        let staged = ws
            .stage(VideoInput::reader(Cursor::new(vec![1u8, 2, 3]), None))
            .unwrap();
        assert_eq!(staged.extension().unwrap(), "mp4");
        assert_eq!(fs::read(&staged).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn paths_are_used_in_place_even_when_missing() {
        let root = tempfile::tempdir().unwrap();
        let ws = RunWorkspace::create(Uuid::new_v4(), Some(root.path()), root.path()).unwrap();
        let missing = root.path().join("nope.mp4");
        assert_eq!(ws.stage(VideoInput::path(&missing)).unwrap(), missing);
        assert_eq!(fs::read_dir(ws.staging_dir().unwrap()).unwrap().count(), 0);
    }

    #[test]
    fn release_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let mut ws = RunWorkspace::create(Uuid::new_v4(), Some(root.path()), root.path()).unwrap();
        ws.release();
        ws.release();
        assert!(ws.staging_dir().is_none());
    }
}
