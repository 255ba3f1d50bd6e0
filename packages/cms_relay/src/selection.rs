//! Document selection and user focus.
//!
//! The selection is an ordered, bounded list of document references, most
//! recently touched first. The focus is a single process-wide pointer to
//! where the user currently is. Both are updated together on every
//! `document_focus` frame.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tokio::sync::RwLock;

/// Default cap on the number of tracked documents.
pub const DEFAULT_MAX_DOCUMENTS: usize = 10;

/// Metadata-only pointer to a content item managed by the CMS.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentReference {
    pub id: String,
    pub doc_type: Option<String>,
    pub title: String,
    /// Field locator inside the document
    pub path: Option<String>,
    pub last_modified: DateTime<Utc>,
}

/// Where the user is right now. Overwritten wholesale on every focus change.
#[derive(Debug, Clone, PartialEq)]
pub struct UserFocus {
    pub document_id: String,
    pub path: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// A focus change as received from a client.
#[derive(Debug, Clone, Default)]
pub struct FocusChange {
    pub document_id: String,
    pub path: Option<String>,
    pub title: Option<String>,
    pub doc_type: Option<String>,
}

#[derive(Debug, Default)]
struct SelectionState {
    documents: VecDeque<DocumentReference>,
    focus: Option<UserFocus>,
}

pub struct SelectionTracker {
    state: RwLock<SelectionState>,
    max_documents: usize,
}

impl SelectionTracker {
    pub fn new(max_documents: usize) -> Self {
        Self {
            state: RwLock::new(SelectionState::default()),
            max_documents: max_documents.max(1),
        }
    }

    /// Apply a focus change and return the resulting selection.
    ///
    /// An id already in the selection is moved to the front with its path and
    /// timestamp refreshed; a new id is inserted at the front and the oldest
    /// entries beyond the cap are evicted.
    pub async fn focus(&self, change: FocusChange) -> Vec<DocumentReference> {
        self.focus_at(change, Utc::now()).await
    }

    pub(crate) async fn focus_at(
        &self,
        change: FocusChange,
        now: DateTime<Utc>,
    ) -> Vec<DocumentReference> {
        let mut state = self.state.write().await;

        state.focus = Some(UserFocus {
            document_id: change.document_id.clone(),
            path: change.path.clone(),
            last_updated: now,
        });

        let existing = state
            .documents
            .iter()
            .position(|d| d.id == change.document_id)
            .and_then(|idx| state.documents.remove(idx));

        let doc = match existing {
            Some(mut doc) => {
                doc.path = change.path;
                doc.last_modified = now;
                if let Some(title) = change.title {
                    doc.title = title;
                }
                if change.doc_type.is_some() {
                    doc.doc_type = change.doc_type;
                }
                doc
            }
            None => DocumentReference {
                title: change.title.unwrap_or_else(|| change.document_id.clone()),
                id: change.document_id,
                doc_type: change.doc_type,
                path: change.path,
                last_modified: now,
            },
        };

        state.documents.push_front(doc);
        state.documents.truncate(self.max_documents);
        state.documents.iter().cloned().collect()
    }

    /// Current selection, most recent first.
    pub async fn documents(&self) -> Vec<DocumentReference> {
        self.state.read().await.documents.iter().cloned().collect()
    }

    pub async fn current_focus(&self) -> Option<UserFocus> {
        self.state.read().await.focus.clone()
    }

    pub fn max_documents(&self) -> usize {
        self.max_documents
    }
}

impl Default for SelectionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DOCUMENTS)
    }
}
