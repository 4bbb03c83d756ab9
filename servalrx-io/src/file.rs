//! Memory-mapped file ingress.
#![allow(unsafe_code)]

use crate::error::Result;
use memmap2::Mmap;
use servalrx_pipeline::FrameParser;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Bytes fed to the parser per slice in file mode.
pub const DEFAULT_FEED_BYTES: usize = 1024 * 1024;

/// A memory-mapped capture file.
pub struct MappedFile {
    mmap: Mmap,
    path: PathBuf,
}

impl MappedFile {
    /// Opens a file for memory-mapped reading.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        // SAFETY: The file is opened read-only and we assume it is not
        // modified concurrently. This is the standard safety contract for
        // memory mapping.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self {
            mmap,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// File contents as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }

    /// File size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// True if the file is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Path the file was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// What a completed ingress run delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngressSummary {
    /// Whole-word bytes handed to the parser.
    pub bytes_delivered: u64,
    /// Words handed to the parser.
    pub words_delivered: u64,
    /// Trailing bytes that did not form a whole word.
    pub bytes_dropped_incomplete: u64,
}

/// File-mode ingress: feeds a capture file to the parser in word-aligned
/// slices.
pub struct FileIngress {
    file: MappedFile,
    feed_bytes: usize,
}

impl FileIngress {
    /// Opens `path` for ingestion.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            file: MappedFile::open(path)?,
            feed_bytes: DEFAULT_FEED_BYTES,
        })
    }

    /// Sets the slice size used when feeding the parser.
    #[must_use]
    pub fn with_feed_bytes(mut self, feed_bytes: usize) -> Self {
        self.feed_bytes = feed_bytes.max(8);
        self
    }

    /// File size in bytes.
    #[must_use]
    pub fn file_size(&self) -> usize {
        self.file.len()
    }

    /// Number of whole 8-byte words in the file.
    #[must_use]
    pub fn word_count(&self) -> usize {
        self.file.len() / 8
    }

    /// Feeds the whole file through `parser`. A file may end mid-word; the
    /// trailing bytes are counted and warned about, never parsed.
    pub fn run(&self, parser: &mut FrameParser) -> IngressSummary {
        let data = self.file.as_bytes();
        let aligned = data.len() - data.len() % 8;
        let dropped = (data.len() - aligned) as u64;

        let mut offset = 0;
        let mut words = 0u64;
        while offset < aligned {
            let end = (offset + self.feed_bytes).min(aligned);
            // Slices are a multiple of 8 except possibly the last, which is
            // aligned by construction.
            let end = end - (end - offset) % 8;
            words += parser.process(&data[offset..end]) as u64;
            offset = end;
        }
        parser.finish();

        if dropped > 0 {
            warn!(
                "file {} ends mid-word: {dropped} trailing byte(s) dropped",
                self.file.path().display()
            );
        }

        IngressSummary {
            bytes_delivered: aligned as u64,
            words_delivered: words,
            bytes_dropped_incomplete: dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use servalrx_core::packet::make_chunk_header;
    use servalrx_pipeline::Aggregator;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn write_words(file: &mut NamedTempFile, words: &[u64]) {
        for w in words {
            file.write_all(&w.to_le_bytes()).unwrap();
        }
        file.flush().unwrap();
    }

    #[test]
    fn test_mapped_file() {
        let mut file = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..64).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let mapped = MappedFile::open(file.path()).unwrap();
        assert_eq!(mapped.len(), 64);
        assert!(!mapped.is_empty());
        assert_eq!(mapped.as_bytes(), &data[..]);
    }

    #[test]
    fn test_open_missing_file_fails() {
        assert!(FileIngress::open("/nonexistent/servalrx.tpx3").is_err());
    }

    #[test]
    fn test_run_counts_words_and_hits() {
        let mut file = NamedTempFile::new().unwrap();
        write_words(
            &mut file,
            &[
                make_chunk_header(24, 0),
                0xB000_0000_0000_0000,
                0xB000_0000_0000_0000,
            ],
        );

        let agg = Arc::new(Aggregator::new(10));
        let mut parser = FrameParser::new(agg.clone());
        let ingress = FileIngress::open(file.path()).unwrap();
        let summary = ingress.run(&mut parser);

        assert_eq!(summary.words_delivered, 3);
        assert_eq!(summary.bytes_delivered, 24);
        assert_eq!(summary.bytes_dropped_incomplete, 0);
        assert_eq!(agg.snapshot().total_hits, 2);
    }

    #[test]
    fn test_trailing_bytes_dropped() {
        let mut file = NamedTempFile::new().unwrap();
        write_words(&mut file, &[make_chunk_header(16, 0), 0xB000_0000_0000_0000]);
        file.write_all(&[0xAA, 0xBB, 0xCC]).unwrap();
        file.flush().unwrap();

        let agg = Arc::new(Aggregator::new(10));
        let mut parser = FrameParser::new(agg.clone());
        let ingress = FileIngress::open(file.path()).unwrap();
        let summary = ingress.run(&mut parser);

        assert_eq!(summary.bytes_dropped_incomplete, 3);
        assert_eq!(summary.words_delivered, 2);
        assert_eq!(agg.snapshot().total_hits, 1);
    }

    #[test]
    fn test_small_feed_slices_match_whole_file() {
        let mut file = NamedTempFile::new().unwrap();
        let mut words = vec![make_chunk_header(8 * 130, 2)];
        words.extend(std::iter::repeat(0xB000_0000_0000_0000u64).take(129));
        write_words(&mut file, &words);

        let agg = Arc::new(Aggregator::new(0));
        let mut parser = FrameParser::new(agg.clone());
        let ingress = FileIngress::open(file.path())
            .unwrap()
            .with_feed_bytes(40);
        let summary = ingress.run(&mut parser);

        assert_eq!(summary.words_delivered, 130);
        assert_eq!(agg.snapshot().total_hits, 129);
        assert_eq!(agg.snapshot().chips[2].hits, 129);
    }
}
