//! Managed configuration files

use std::path::Path;

use crate::probe::{ProbeError, StateProbe};
use crate::runner::Invocation;

/// A file whose full content is owned by a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedFile {
    /// Absolute path on the host
    pub path: String,
    /// Exact file content
    pub content: String,
    /// Octal permissions (e.g., "0644")
    pub mode: String,
    /// Owner and group, when not root
    pub owner: Option<String>,
}

impl ManagedFile {
    /// A root-owned file with mode 0644
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            mode: "0644".into(),
            owner: None,
        }
    }

    /// Set file permissions
    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    /// Set file owner (user and group of the same name)
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Whether the host file already has exactly this content
    pub fn matches(&self, probe: &StateProbe<'_>) -> Result<bool, ProbeError> {
        probe.file_matches(&self.path, &self.content)
    }

    /// Commands that create the parent directory and write the file.
    ///
    /// The content travels over stdin so it never appears in logs.
    pub fn invocations(&self) -> Vec<Invocation> {
        let mut cmds = vec![];

        if let Some(parent) = Path::new(&self.path).parent() {
            let parent = parent.to_string_lossy();
            if parent != "/" && !parent.is_empty() {
                cmds.push(Invocation::new("install").args(["-d", "-m", "0755", parent.as_ref()]));
            }
        }

        cmds.push(self.write_invocation());
        cmds
    }

    /// The write alone, for callers that manage the parent directory
    pub fn write_invocation(&self) -> Invocation {
        let mut write = Invocation::new("install").args(["-m", self.mode.as_str()]);
        if let Some(owner) = &self.owner {
            write = write.args(["-o", owner.as_str(), "-g", owner.as_str()]);
        }
        write
            .args(["/dev/stdin", self.path.as_str()])
            .stdin(self.content.clone())
    }
}
