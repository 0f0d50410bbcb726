use std::path::{Path, PathBuf};

use anyhow::Context;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Where published frames come from.
///
/// `capture` is called on every publish tick and should return quickly. `None`
/// means no frame is available right now and the tick is skipped.
pub trait FrameSource: Send + 'static {
    fn capture(&mut self) -> anyhow::Result<Option<String>>;
}

impl<F> FrameSource for F
where
    F: FnMut() -> anyhow::Result<Option<String>> + Send + 'static,
{
    fn capture(&mut self) -> anyhow::Result<Option<String>> {
        self()
    }
}

/// Re-reads an image file on every tick, so replacing the file changes the
/// published frame.
#[derive(Clone, Debug)]
pub struct FileFrameSource {
    path: PathBuf,
    mime: &'static str,
}

impl FileFrameSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mime = mime_for(&path);
        Self { path, mime }
    }
}

impl FrameSource for FileFrameSource {
    fn capture(&mut self) -> anyhow::Result<Option<String>> {
        let bytes = std::fs::read(&self.path)
            .with_context(|| format!("reading frame from {}", self.path.display()))?;
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(data_url(self.mime, &bytes)))
    }
}

pub fn data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    }
}
