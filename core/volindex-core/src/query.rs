use std::cmp::Ordering;

use globset::{GlobBuilder, GlobMatcher};
use regex::escape;
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, BoostQuery, Occur, Query, QueryParser, RegexQuery};
use tantivy::schema::{Field, TantivyDocument, Value};
use tantivy::{Index, Searcher};

use crate::error::{IndexError, Result};
use crate::schema::IndexFields;

/// Field a bare query term is matched against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SearchField {
    #[default]
    Contents,
    Name,
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub text: String,
    pub default_field: SearchField,
    pub path_glob: Option<String>,
    pub limit: usize,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, default_field: SearchField) -> Self {
        Self {
            text: text.into(),
            default_field,
            ..Self::default()
        }
    }
}

impl Default for SearchQuery {
    fn default() -> Self {
        SearchQuery {
            text: String::new(),
            default_field: SearchField::Contents,
            path_glob: None,
            limit: 50,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchHit {
    pub path: String,
    pub name: String,
    pub score: f32,
    pub modified_at: Option<i64>,
    pub size: Option<u64>,
}

pub(crate) fn run(
    index: &Index,
    searcher: &Searcher,
    fields: &IndexFields,
    query: &SearchQuery,
) -> Result<Vec<SearchHit>> {
    let trimmed = query.text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let default_field = match query.default_field {
        SearchField::Contents => fields.contents,
        SearchField::Name => fields.name,
    };
    let mut parser = QueryParser::for_index(index, vec![default_field]);
    parser.set_conjunction_by_default();
    let parsed = parser
        .parse_query(trimmed)
        .map_err(|err| IndexError::engine("parse query", err))?;

    // File names get an extra prefix match so "rep" finds "report.txt".
    let combined: Box<dyn Query> = if query.default_field == SearchField::Name
        && !trimmed.contains(char::is_whitespace)
    {
        let pattern = format!("^{}.*", escape(trimmed));
        match RegexQuery::from_pattern(&pattern, fields.name_raw) {
            Ok(prefix) => Box::new(BooleanQuery::new(vec![
                (Occur::Should, parsed),
                (
                    Occur::Should,
                    Box::new(BoostQuery::new(Box::new(prefix), 2.0)) as Box<dyn Query>,
                ),
            ])),
            Err(_) => parsed,
        }
    } else {
        parsed
    };

    let top_docs = searcher
        .search(&combined, &TopDocs::with_limit(query.limit.max(1)))
        .map_err(|err| IndexError::engine("search", err))?;

    let glob_matcher = build_glob_matcher(query.path_glob.as_deref())?;

    let mut hits = Vec::with_capacity(top_docs.len());
    for (score, address) in top_docs {
        let doc: TantivyDocument = searcher
            .doc(address)
            .map_err(|err| IndexError::engine("fetch document", err))?;

        let path = field_text(&doc, fields.path).unwrap_or_default().to_string();
        if let Some(ref matcher) = glob_matcher {
            if !matcher.is_match(&path) {
                continue;
            }
        }

        hits.push(SearchHit {
            name: field_text(&doc, fields.name).unwrap_or_default().to_string(),
            path,
            score,
            modified_at: field_i64(&doc, fields.mtime),
            size: field_u64(&doc, fields.size),
        });
    }

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.modified_at.unwrap_or(0).cmp(&a.modified_at.unwrap_or(0)))
    });

    Ok(hits)
}

fn build_glob_matcher(pattern: Option<&str>) -> Result<Option<GlobMatcher>> {
    let Some(raw) = pattern.map(str::trim).filter(|p| !p.is_empty()) else {
        return Ok(None);
    };

    let glob = GlobBuilder::new(raw)
        .case_insensitive(true)
        .build()
        .map_err(|err| IndexError::engine("parse glob", err))?;

    Ok(Some(glob.compile_matcher()))
}

fn field_text(doc: &TantivyDocument, field: Field) -> Option<&str> {
    doc.get_first(field).and_then(|value| value.as_str())
}

fn field_i64(doc: &TantivyDocument, field: Field) -> Option<i64> {
    doc.get_first(field).and_then(|value| value.as_i64())
}

fn field_u64(doc: &TantivyDocument, field: Field) -> Option<u64> {
    doc.get_first(field).and_then(|value| value.as_u64())
}
