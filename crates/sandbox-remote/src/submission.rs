//! Loading a student's submission into the working root

use async_trait::async_trait;
use sandbox_core::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::session::RemoteSession;

/// Identifies one student's submission for one assignment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubmissionKey {
    pub term: String,
    pub course: String,
    pub assignment: String,
    pub student: String,
}

impl SubmissionKey {
    pub fn new(
        term: impl Into<String>,
        course: impl Into<String>,
        assignment: impl Into<String>,
        student: impl Into<String>,
    ) -> Self {
        Self {
            term: term.into(),
            course: course.into(),
            assignment: assignment.into(),
            student: student.into(),
        }
    }

    /// Path segments, rejecting anything that would escape the store root
    pub fn segments(&self) -> Result<[&str; 4]> {
        let segments = [
            self.term.as_str(),
            self.course.as_str(),
            self.assignment.as_str(),
            self.student.as_str(),
        ];
        for segment in segments {
            if segment.is_empty()
                || segment == "."
                || segment == ".."
                || segment.contains(['/', '\\'])
            {
                return Err(SandboxError::Submission(format!(
                    "invalid submission key segment {:?}",
                    segment
                )));
            }
        }
        Ok(segments)
    }
}

impl std::fmt::Display for SubmissionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.term, self.course, self.assignment, self.student
        )
    }
}

/// Source of already-downloaded submission files
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Local directory holding the submission's files
    async fn locate(&self, key: &SubmissionKey) -> Result<PathBuf>;
}

/// Submissions laid out as `<root>/<term>/<course>/<assignment>/<student>`
#[derive(Debug, Clone)]
pub struct DirectorySubmissionStore {
    root: PathBuf,
}

impl DirectorySubmissionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl SubmissionStore for DirectorySubmissionStore {
    async fn locate(&self, key: &SubmissionKey) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for segment in key.segments()? {
            path.push(segment);
        }

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Ok(path),
            Ok(_) => Err(SandboxError::Submission(format!(
                "{} is not a directory",
                path.display()
            ))),
            Err(_) => Err(SandboxError::Submission(format!(
                "no submission found for {} (looked in {})",
                key,
                path.display()
            ))),
        }
    }
}

/// Clear the working root and copy the submission for `key` into it
pub async fn load_submission(
    session: &RemoteSession,
    store: &dyn SubmissionStore,
    key: &SubmissionKey,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    let local = store.locate(key).await?;
    session.replace_working_root(&local, cancel).await?;
    info!("Loaded submission {} into {}", key, session.working_directory());
    Ok(local)
}
