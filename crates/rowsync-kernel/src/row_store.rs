//! Authoritative row storage with paginated, filterable reads.
//!
//! # Concurrency Model
//!
//! - DashMap for per-document concurrent access
//! - Each document's rows live in one `Vec` ordered by `row_num`, with an
//!   id → position index for writes

use std::collections::HashMap;

use dashmap::DashMap;
use rowsync_types::{
    DocumentId, PageRequest, PageResponse, Row, RowId, RowWrite, TransportError, TransportResult,
};
use tracing::{debug, info};

use crate::constants::MAX_PAGE_SIZE;

/// Rows of a single document.
#[derive(Debug, Default)]
pub struct DocumentRows {
    rows: Vec<Row>,
    by_id: HashMap<RowId, usize>,
}

impl DocumentRows {
    /// Build from rows in any order. Rows are sorted and renumbered densely.
    pub fn new(mut rows: Vec<Row>) -> Self {
        rows.sort_by_key(|r| r.row_num);
        let mut by_id = HashMap::with_capacity(rows.len());
        for (i, row) in rows.iter_mut().enumerate() {
            row.row_num = i as u64 + 1;
            by_id.insert(row.id, i);
        }
        Self { rows, by_id }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, row_id: RowId) -> Option<&Row> {
        self.by_id.get(&row_id).and_then(|&i| self.rows.get(i))
    }

    fn page(&self, page: u64, page_size: u64, search: Option<&str>) -> PageResponse {
        let start = usize::try_from((page - 1).saturating_mul(page_size)).unwrap_or(usize::MAX);
        let size = usize::try_from(page_size).unwrap_or(usize::MAX);

        match search.map(str::trim).filter(|s| !s.is_empty()) {
            None => PageResponse {
                rows: self.rows.iter().skip(start).take(size).cloned().collect(),
                total: self.rows.len() as u64,
            },
            Some(needle) => {
                let needle = needle.to_lowercase();
                let matching: Vec<&Row> =
                    self.rows.iter().filter(|r| matches_search(r, &needle)).collect();
                // Filtered views are renumbered so row_num stays dense and 1-based.
                let rows = matching
                    .iter()
                    .enumerate()
                    .skip(start)
                    .take(size)
                    .map(|(i, r)| Row { row_num: i as u64 + 1, ..(*r).clone() })
                    .collect();
                PageResponse { rows, total: matching.len() as u64 }
            }
        }
    }

    fn write(&mut self, write: &RowWrite) -> Option<Row> {
        let &i = self.by_id.get(&write.row_id)?;
        let row = self.rows.get_mut(i)?;
        row.target = write.target.clone();
        row.status = write.status;
        Some(row.clone())
    }
}

fn matches_search(row: &Row, needle_lower: &str) -> bool {
    row.string_id.to_lowercase().contains(needle_lower)
        || row.source.to_lowercase().contains(needle_lower)
        || row.target.to_lowercase().contains(needle_lower)
}

/// Store of all documents' rows.
#[derive(Debug, Default)]
pub struct RowStore {
    docs: DashMap<DocumentId, DocumentRows>,
}

impl RowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a document.
    pub fn insert_document(&self, doc_id: DocumentId, rows: Vec<Row>) {
        let doc = DocumentRows::new(rows);
        info!("Loaded document {} with {} rows", doc_id, doc.len());
        self.docs.insert(doc_id, doc);
    }

    pub fn contains(&self, doc_id: DocumentId) -> bool {
        self.docs.contains_key(&doc_id)
    }

    pub fn row_count(&self, doc_id: DocumentId) -> Option<usize> {
        self.docs.get(&doc_id).map(|d| d.len())
    }

    pub fn get_row(&self, doc_id: DocumentId, row_id: RowId) -> Option<Row> {
        self.docs.get(&doc_id).and_then(|d| d.get(row_id).cloned())
    }

    /// Paginated read. Idempotent.
    pub fn fetch_page(&self, req: &PageRequest) -> TransportResult<PageResponse> {
        if req.page == 0 {
            return Err(TransportError::Rejected("page numbers start at 1".into()));
        }
        if req.page_size == 0 || req.page_size > MAX_PAGE_SIZE {
            return Err(TransportError::Rejected(format!(
                "page_size must be in 1..={MAX_PAGE_SIZE}, got {}",
                req.page_size
            )));
        }
        let doc = self
            .docs
            .get(&req.doc_id)
            .ok_or_else(|| TransportError::Rejected(format!("unknown document {}", req.doc_id)))?;
        let resp = doc.page(req.page, req.page_size, req.search.as_deref());
        debug!(
            "fetch_page doc={} page={} size={} -> {} rows (total {})",
            req.doc_id,
            req.page,
            req.page_size,
            resp.rows.len(),
            resp.total
        );
        Ok(resp)
    }

    /// Apply a row write, returning the updated row.
    pub fn write_row(&self, write: &RowWrite) -> TransportResult<Row> {
        let mut doc = self
            .docs
            .get_mut(&write.doc_id)
            .ok_or_else(|| TransportError::Rejected(format!("unknown document {}", write.doc_id)))?;
        doc.write(write)
            .ok_or_else(|| TransportError::Rejected(format!("unknown row {}", write.row_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rowsync_types::RowStatus;

    fn rows(n: u64) -> Vec<Row> {
        (1..=n)
            .map(|i| Row {
                id: RowId(1000 + i),
                row_num: i,
                string_id: format!("key.{i}"),
                source: if i % 10 == 0 { format!("Tenth {i}") } else { format!("Source {i}") },
                target: String::new(),
                status: RowStatus::Pending,
            })
            .collect()
    }

    fn req(doc_id: DocumentId, page: u64, search: Option<&str>) -> PageRequest {
        PageRequest { doc_id, page, page_size: 100, search: search.map(String::from) }
    }

    #[test]
    fn test_fetch_pages() {
        let store = RowStore::new();
        let doc = DocumentId::new();
        store.insert_document(doc, rows(250));

        let p1 = store.fetch_page(&req(doc, 1, None)).unwrap();
        assert_eq!(p1.total, 250);
        assert_eq!(p1.rows.len(), 100);
        assert_eq!(p1.rows[0].row_num, 1);

        let p3 = store.fetch_page(&req(doc, 3, None)).unwrap();
        assert_eq!(p3.rows.len(), 50);
        assert_eq!(p3.rows[0].row_num, 201);

        let p4 = store.fetch_page(&req(doc, 4, None)).unwrap();
        assert!(p4.rows.is_empty());
        assert_eq!(p4.total, 250);
    }

    #[test]
    fn test_fetch_is_idempotent() {
        let store = RowStore::new();
        let doc = DocumentId::new();
        store.insert_document(doc, rows(120));
        let a = store.fetch_page(&req(doc, 2, None)).unwrap();
        let b = store.fetch_page(&req(doc, 2, None)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_search_renumbers_densely() {
        let store = RowStore::new();
        let doc = DocumentId::new();
        store.insert_document(doc, rows(250));

        let page = store.fetch_page(&req(doc, 1, Some("TENTH"))).unwrap();
        assert_eq!(page.total, 25);
        let nums: Vec<u64> = page.rows.iter().map(|r| r.row_num).collect();
        assert_eq!(nums, (1..=25).collect::<Vec<_>>());
        assert_eq!(page.rows[0].id, RowId(1010));
    }

    #[test]
    fn test_bad_requests_rejected() {
        let store = RowStore::new();
        let doc = DocumentId::new();
        store.insert_document(doc, rows(5));
        assert!(matches!(store.fetch_page(&req(doc, 0, None)), Err(TransportError::Rejected(_))));
        assert!(matches!(
            store.fetch_page(&req(DocumentId::new(), 1, None)),
            Err(TransportError::Rejected(_))
        ));
        let mut big = req(doc, 1, None);
        big.page_size = MAX_PAGE_SIZE + 1;
        assert!(store.fetch_page(&big).is_err());
    }

    #[test]
    fn test_write_row() {
        let store = RowStore::new();
        let doc = DocumentId::new();
        store.insert_document(doc, rows(3));

        let written = store
            .write_row(&RowWrite {
                doc_id: doc,
                row_id: RowId(1002),
                target: "Hola".into(),
                status: RowStatus::Translated,
            })
            .unwrap();
        assert_eq!(written.target, "Hola");
        assert_eq!(store.get_row(doc, RowId(1002)).unwrap().status, RowStatus::Translated);

        let missing = store.write_row(&RowWrite {
            doc_id: doc,
            row_id: RowId(1),
            target: String::new(),
            status: RowStatus::Pending,
        });
        assert!(matches!(missing, Err(TransportError::Rejected(_))));
    }

    #[test]
    fn test_insert_sorts_and_renumbers() {
        let mut input = rows(3);
        input.reverse();
        input[0].row_num = 40;
        let doc = DocumentRows::new(input);
        assert_eq!(doc.get(RowId(1003)).unwrap().row_num, 3);
        assert_eq!(doc.get(RowId(1001)).unwrap().row_num, 1);
    }
}
