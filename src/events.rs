use std::path::PathBuf;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
}

/// A file appeared in or disappeared from the content tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

impl ChangeEvent {
    pub fn added(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: ChangeKind::Added,
            path: path.into(),
        }
    }

    pub fn removed(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: ChangeKind::Removed,
            path: path.into(),
        }
    }

    /// JSON text frame sent to display clients.
    pub fn to_message(&self) -> String {
        let wire = WireMessage {
            kind: match self.kind {
                ChangeKind::Added => "new-file",
                ChangeKind::Removed => "file-deleted",
            },
            path: self.path.to_string_lossy(),
        };
        // Serializing two string fields cannot fail.
        serde_json::to_string(&wire).unwrap_or_default()
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    path: std::borrow::Cow<'a, str>,
}
