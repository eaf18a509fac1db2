use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use kiosk_model::{extract_subtitle, message_body};
use serde::Serialize;
use tracing::debug;
use walkdir::WalkDir;

/// URL prefix under which the content directory is served.
pub const DOWNLOADS_PREFIX: &str = "/downloads/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Image => "images",
            Self::Video => "videos",
        }
    }
}

/// A displayable file under `images/` or `videos/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEntry {
    pub kind: MediaKind,
    pub path: PathBuf,
    pub subtitle: Option<String>,
}

/// Listing item as the display client consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaItem {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub url: String,
    pub subtitle: String,
}

/// Directory layout of the synced content.
#[derive(Debug, Clone)]
pub struct ContentDir {
    root: PathBuf,
}

impl ContentDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn media_dir(&self, kind: MediaKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    pub fn texts_dir(&self) -> PathBuf {
        self.root.join("texts")
    }

    pub fn messages_dir(&self) -> PathBuf {
        self.root.join("messages")
    }

    pub fn ensure_layout(&self) -> io::Result<()> {
        for dir in [
            self.media_dir(MediaKind::Image),
            self.media_dir(MediaKind::Video),
            self.texts_dir(),
            self.messages_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Images then videos, each sorted by file name. Missing directories are empty.
    pub fn list_media(&self) -> Vec<MediaEntry> {
        let mut entries = Vec::new();
        for kind in [MediaKind::Image, MediaKind::Video] {
            for path in list_files(&self.media_dir(kind)) {
                let subtitle = self.subtitle_for(&path);
                entries.push(MediaEntry {
                    kind,
                    path,
                    subtitle,
                });
            }
        }
        entries
    }

    pub fn list_items(&self) -> Vec<MediaItem> {
        self.list_media()
            .into_iter()
            .map(|entry| MediaItem {
                kind: entry.kind,
                url: self.url_for(&entry.path),
                subtitle: entry.subtitle.unwrap_or_default(),
            })
            .collect()
    }

    /// Subtitle from `texts/<base name>.txt`, if that file has a `[Text]` block.
    pub fn subtitle_for(&self, media: &Path) -> Option<String> {
        let stem = media.file_stem()?;
        let mut name = stem.to_os_string();
        name.push(".txt");
        let sidecar = self.texts_dir().join(name);
        match fs::read_to_string(&sidecar) {
            Ok(raw) => extract_subtitle(&raw),
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    debug!(path = %sidecar.display(), error = %err, "unreadable sidecar");
                }
                None
            }
        }
    }

    pub fn url_for(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        format!("{DOWNLOADS_PREFIX}{rel}")
    }

    /// Maps a `/downloads/...` URL back to a file inside the content root.
    ///
    /// Returns `None` for URLs that would leave the root.
    pub fn resolve_url(&self, url: &str) -> Option<PathBuf> {
        let rel = url.strip_prefix(DOWNLOADS_PREFIX).unwrap_or(url);
        let rel = Path::new(rel);
        let mut normal = 0;
        for component in rel.components() {
            match component {
                Component::Normal(_) => normal += 1,
                Component::CurDir => {}
                _ => return None,
            }
        }
        (normal > 0).then(|| self.root.join(rel))
    }

    /// Standalone message files, sorted by name.
    pub fn list_messages(&self) -> Vec<String> {
        list_files(&self.messages_dir())
            .into_iter()
            .filter(|p| p.extension() == Some(OsStr::new("txt")))
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect()
    }

    pub fn read_message(&self, name: &str) -> io::Result<String> {
        let path = self.message_path(name)?;
        fs::read_to_string(path).map(|raw| message_body(&raw))
    }

    pub fn delete_message(&self, name: &str) -> io::Result<()> {
        fs::remove_file(self.message_path(name)?)
    }

    fn message_path(&self, name: &str) -> io::Result<PathBuf> {
        if !is_plain_file_name(name) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a plain file name: {name}"),
            ));
        }
        Ok(self.messages_dir().join(name))
    }
}

/// True for a single path component that is not `.` or `..`.
pub fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn list_files(dir: &Path) -> Vec<PathBuf> {
    if !dir.is_dir() {
        debug!(dir = %dir.display(), "media directory not found");
        return Vec::new();
    }
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}
