//! Text index engine seam.
//!
//! Controllers only talk to [`IndexEngine`] and [`IndexHandle`]; the tantivy
//! implementation below is what the daemon runs with.

use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use tantivy::collector::Count;
use tantivy::directory::MmapDirectory;
use tantivy::merge_policy::LogMergePolicy;
use tantivy::query::{RegexQuery, TermQuery};
use tantivy::schema::{IndexRecordOption, TantivyDocument};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, Term};

use crate::config::WriterSettings;
use crate::error::{IndexError, Result};
use crate::query::{self, SearchHit, SearchQuery};
use crate::schema::{build_schema, IndexFields};

const MIN_HEAP_PER_THREAD: usize = 16 * 1024 * 1024;

/// One file as submitted to the index, keyed by `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDocument {
    pub path: String,
    pub name: String,
    pub ext: Option<String>,
    pub modified_at: i64,
    pub size: u64,
    pub contents: String,
}

impl IndexDocument {
    /// Builds the document for `path`, reading name, extension, size and
    /// modification time from the filesystem.
    pub fn for_file(path: &Path, contents: String) -> Result<Self> {
        let metadata = fs::metadata(path).map_err(|source| IndexError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;

        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let ext = path
            .extension()
            .map(|s| s.to_string_lossy().to_lowercase())
            .filter(|s| !s.is_empty());
        let modified_at = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|dur| dur.as_secs() as i64)
            .unwrap_or_default();

        Ok(Self {
            path: path.to_string_lossy().to_string(),
            name,
            ext,
            modified_at,
            size: metadata.len(),
            contents,
        })
    }
}

pub trait IndexEngine: Send + Sync {
    fn exists(&self, root: &Path) -> bool;

    /// Opens the index at `root` for reading and writing. Dropping the
    /// returned handle closes it and discards uncommitted changes.
    fn open(&self, root: &Path, create_if_missing: bool) -> Result<Box<dyn IndexHandle>>;
}

pub trait IndexHandle: Send {
    fn add_document(&mut self, doc: IndexDocument) -> Result<()>;

    /// Queues deletion of every document keyed by `path` and returns how many
    /// committed documents the deletion will remove.
    fn delete_by_path(&mut self, path: &str) -> Result<u64>;

    /// Queues deletion of every document whose path lies below the
    /// directory `dir`, and returns how many committed documents that is.
    fn delete_under(&mut self, dir: &str) -> Result<u64>;

    fn delete_all(&mut self) -> Result<()>;

    /// Persists every queued change and makes it visible to searches.
    fn commit(&mut self) -> Result<()>;

    fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>>;

    fn num_docs(&self) -> u64;
}

#[derive(Debug, Clone, Default)]
pub struct TantivyEngine {
    settings: WriterSettings,
}

impl TantivyEngine {
    pub fn new(settings: WriterSettings) -> Self {
        Self { settings }
    }

    fn writer_budget(&self) -> (usize, usize) {
        let threads = if self.settings.threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.settings.threads
        };
        let heap = self.settings.heap_bytes.max(threads * MIN_HEAP_PER_THREAD);
        (threads, heap)
    }
}

impl IndexEngine for TantivyEngine {
    fn exists(&self, root: &Path) -> bool {
        MmapDirectory::open(root)
            .ok()
            .and_then(|directory| Index::exists(&directory).ok())
            .unwrap_or(false)
    }

    fn open(&self, root: &Path, create_if_missing: bool) -> Result<Box<dyn IndexHandle>> {
        if create_if_missing {
            fs::create_dir_all(root)?;
        }
        let directory = MmapDirectory::open(root)
            .map_err(|err| IndexError::engine("open index directory", err))?;
        let index = if create_if_missing {
            Index::open_or_create(directory, build_schema())
        } else {
            Index::open(directory)
        }
        .map_err(|err| IndexError::engine("open index", err))?;

        let fields = IndexFields::resolve(&index.schema())?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(|err| IndexError::engine("open reader", err))?;

        let (threads, heap) = self.writer_budget();
        let writer: IndexWriter = index
            .writer_with_num_threads(threads, heap)
            .map_err(|err| IndexError::engine("open writer", err))?;

        let mut merge_policy = LogMergePolicy::default();
        merge_policy.set_level_log_size(1.2);
        writer.set_merge_policy(Box::new(merge_policy));

        Ok(Box::new(TantivyIndex {
            index,
            reader,
            writer,
            fields,
        }))
    }
}

struct TantivyIndex {
    index: Index,
    reader: IndexReader,
    writer: IndexWriter,
    fields: IndexFields,
}

impl IndexHandle for TantivyIndex {
    fn add_document(&mut self, doc: IndexDocument) -> Result<()> {
        let mut document = TantivyDocument::new();
        document.add_text(self.fields.path, &doc.path);
        document.add_text(self.fields.name, &doc.name);
        document.add_text(self.fields.name_raw, &doc.name);
        if let Some(ext) = &doc.ext {
            document.add_text(self.fields.ext, ext);
        }
        document.add_i64(self.fields.mtime, doc.modified_at);
        document.add_u64(self.fields.size, doc.size);
        if !doc.contents.is_empty() {
            document.add_text(self.fields.contents, &doc.contents);
        }

        self.writer
            .add_document(document)
            .map_err(|err| IndexError::engine("add document", err))?;
        Ok(())
    }

    fn delete_by_path(&mut self, path: &str) -> Result<u64> {
        let term = Term::from_field_text(self.fields.path, path);
        let matched = self
            .reader
            .searcher()
            .search(
                &TermQuery::new(term.clone(), IndexRecordOption::Basic),
                &Count,
            )
            .map_err(|err| IndexError::engine("count documents", err))?;
        self.writer.delete_term(term);
        Ok(matched as u64)
    }

    fn delete_under(&mut self, dir: &str) -> Result<u64> {
        let pattern = format!("{}/.*", regex::escape(dir.trim_end_matches('/')));
        let query = RegexQuery::from_pattern(&pattern, self.fields.path)
            .map_err(|err| IndexError::engine("build subtree query", err))?;
        let matched = self
            .reader
            .searcher()
            .search(&query, &Count)
            .map_err(|err| IndexError::engine("count documents", err))?;
        self.writer
            .delete_query(Box::new(query))
            .map_err(|err| IndexError::engine("delete subtree", err))?;
        Ok(matched as u64)
    }

    fn delete_all(&mut self) -> Result<()> {
        self.writer
            .delete_all_documents()
            .map_err(|err| IndexError::engine("delete all documents", err))?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.writer
            .commit()
            .map_err(|err| IndexError::engine("commit", err))?;
        self.reader
            .reload()
            .map_err(|err| IndexError::engine("reload reader", err))?;
        Ok(())
    }

    fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        query::run(&self.index, &self.reader.searcher(), &self.fields, query)
    }

    fn num_docs(&self) -> u64 {
        self.reader.searcher().num_docs()
    }
}
