use std::path::{Path, PathBuf};

use base64::Engine;
use dotprompt_common::ImageRef;

use crate::error::{Result, RuntimeError};

/// Reads external files folded into the conversation by `.include` and `.image`.
pub trait ContentSource: Send + Sync {
    fn read_text(&self, path: &str) -> Result<String>;
    fn read_image(&self, path: &str) -> Result<ImageRef>;
}

/// Filesystem reader resolving relative paths against a base directory
/// (normally the script's directory).
#[derive(Debug, Clone)]
pub struct FsContent {
    base_dir: PathBuf,
}

impl FsContent {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_dir.join(p)
        }
    }
}

impl ContentSource for FsContent {
    fn read_text(&self, path: &str) -> Result<String> {
        let full = self.resolve(path);
        std::fs::read_to_string(&full).map_err(|e| {
            RuntimeError::Io(std::io::Error::new(
                e.kind(),
                format!("cannot read '{}': {}", full.display(), e),
            ))
        })
    }

    fn read_image(&self, path: &str) -> Result<ImageRef> {
        let full = self.resolve(path);
        let bytes = std::fs::read(&full).map_err(|e| {
            RuntimeError::Io(std::io::Error::new(
                e.kind(),
                format!("cannot read image '{}': {}", full.display(), e),
            ))
        })?;
        Ok(ImageRef {
            path: path.to_string(),
            media_type: media_type(path).to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        })
    }
}

/// Media type from a file extension.
pub fn media_type(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_types() {
        assert_eq!(media_type("a/b/photo.JPG"), "image/jpeg");
        assert_eq!(media_type("x.webp"), "image/webp");
        assert_eq!(media_type("noext"), "application/octet-stream");
    }

    #[test]
    fn reads_relative_to_base() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("note.txt"), "included text").unwrap();
        std::fs::write(dir.path().join("dot.png"), [0x89u8, b'P', b'N', b'G']).unwrap();

        let source = FsContent::new(dir.path());
        assert_eq!(source.read_text("note.txt").unwrap(), "included text");
        let image = source.read_image("dot.png").unwrap();
        assert_eq!(image.media_type, "image/png");
        assert_eq!(image.data, "iVBORw==");
        assert_eq!(image.path, "dot.png");
    }

    #[test]
    fn missing_file_is_io_error() {
        let source = FsContent::new("/nonexistent-dir");
        assert!(matches!(source.read_text("x.txt"), Err(RuntimeError::Io(_))));
    }
}
