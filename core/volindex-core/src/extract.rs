use std::fs;
use std::io::Read;
use std::path::Path;

use crate::config::ExtractorSettings;
use crate::error::{IndexError, Result};

/// Turns files into the plain text submitted to the index.
pub trait ContentExtractor: Send + Sync {
    /// Cheap check used at enqueue time: is there any chance `extract`
    /// produces text for this file?
    fn supports(&self, path: &Path) -> bool;

    /// `Ok(None)` means the file turned out not to be text after all.
    fn extract(&self, path: &Path) -> Result<Option<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainTextExtraction {
    pub content: Option<String>,
    pub bytes_read: usize,
    pub was_binary: bool,
}

/// Extractor for UTF-8 (or nearly UTF-8) text files.
#[derive(Debug, Clone)]
pub struct PlainTextExtractor {
    size_limit: usize,
    sniff_bytes: usize,
    skip_extensions: Vec<String>,
}

impl PlainTextExtractor {
    pub fn new(settings: &ExtractorSettings) -> Self {
        Self {
            size_limit: settings.max_bytes as usize,
            sniff_bytes: settings.sniff_bytes,
            skip_extensions: settings
                .skip_extensions
                .iter()
                .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
        }
    }

    fn skipped_extension(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| self.skip_extensions.contains(&ext))
    }
}

impl Default for PlainTextExtractor {
    fn default() -> Self {
        Self::new(&ExtractorSettings::default())
    }
}

impl ContentExtractor for PlainTextExtractor {
    fn supports(&self, path: &Path) -> bool {
        if self.skipped_extension(path) {
            return false;
        }
        let Ok(metadata) = fs::metadata(path) else {
            return false;
        };
        if !metadata.is_file() || metadata.len() > self.size_limit as u64 {
            return false;
        }
        let Ok(mut file) = fs::File::open(path) else {
            return false;
        };
        let mut head = vec![0u8; self.sniff_bytes.max(1)];
        match file.read(&mut head) {
            Ok(read) => !looks_binary(&head[..read]),
            Err(_) => false,
        }
    }

    fn extract(&self, path: &Path) -> Result<Option<String>> {
        if self.skipped_extension(path) {
            return Ok(None);
        }
        Ok(read_plain_text(path, self.size_limit, self.sniff_bytes)?.content)
    }
}

/// Read up to `size_limit` bytes from a plain-text file, sniffing the first
/// `sniff_bytes` to short-circuit obvious binaries. Files above the limit
/// yield no content at all rather than a truncated prefix.
pub fn read_plain_text<P: AsRef<Path>>(
    path: P,
    size_limit: usize,
    sniff_bytes: usize,
) -> Result<PlainTextExtraction> {
    let path = path.as_ref();
    let read_error = |source| IndexError::FileRead {
        path: path.to_path_buf(),
        source,
    };

    let metadata = fs::metadata(path).map_err(read_error)?;
    if metadata.len() > size_limit as u64 {
        return Ok(PlainTextExtraction {
            content: None,
            bytes_read: 0,
            was_binary: false,
        });
    }

    let mut file = fs::File::open(path).map_err(read_error)?;
    let max_bytes = metadata.len().min(size_limit as u64) as usize;
    let mut buffer = Vec::with_capacity(max_bytes);

    if sniff_bytes > 0 && max_bytes > 0 {
        let mut head = vec![0u8; sniff_bytes.min(max_bytes)];
        let read = file.read(&mut head).map_err(read_error)?;
        head.truncate(read);
        buffer.extend_from_slice(&head);
        if looks_binary(&head) {
            return Ok(PlainTextExtraction {
                content: None,
                bytes_read: buffer.len(),
                was_binary: true,
            });
        }
    }

    if buffer.len() < max_bytes {
        file.by_ref()
            .take((max_bytes - buffer.len()) as u64)
            .read_to_end(&mut buffer)
            .map_err(read_error)?;
    }

    let bytes_read = buffer.len();
    let content = match String::from_utf8(buffer) {
        Ok(text) => text,
        Err(err) => String::from_utf8_lossy(&err.into_bytes()).into_owned(),
    };

    Ok(PlainTextExtraction {
        content: Some(content),
        bytes_read,
        was_binary: false,
    })
}

pub fn looks_binary(head: &[u8]) -> bool {
    if head.is_empty() {
        return false;
    }
    if head.contains(&0) {
        return true;
    }
    let non_printable = head
        .iter()
        .filter(|&&b| b < 9 || (b > 13 && b < 32))
        .count();
    (non_printable as f32 / head.len() as f32) > 0.10
}
