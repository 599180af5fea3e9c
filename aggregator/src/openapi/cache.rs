//! Cache nodes for lazily merged documents.
//!
//! A [`LeafNode`] holds the last document downloaded for one source together
//! with its ETag and the last download error. A [`MergeNode`] memoizes a merge
//! over a list of leaves and only recomputes it when the list of
//! `(name, etag)` inputs changes.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

#[derive(Debug)]
pub struct CachedValue<T> {
    pub value: Option<Arc<T>>,
    pub etag: String,
    pub error: Option<String>,
}

impl<T> Clone for CachedValue<T> {
    fn clone(&self) -> Self {
        CachedValue {
            value: self.value.clone(),
            etag: self.etag.clone(),
            error: self.error.clone(),
        }
    }
}

impl<T> Default for CachedValue<T> {
    fn default() -> Self {
        CachedValue {
            value: None,
            etag: String::new(),
            error: None,
        }
    }
}

#[derive(Debug)]
pub struct LeafNode<T> {
    state: RwLock<CachedValue<T>>,
    /// Static leaves never change once they hold a value.
    is_static: bool,
}

impl<T> LeafNode<T> {
    pub fn new() -> Self {
        LeafNode {
            state: RwLock::new(CachedValue::default()),
            is_static: false,
        }
    }

    pub fn new_static() -> Self {
        LeafNode {
            state: RwLock::new(CachedValue::default()),
            is_static: true,
        }
    }

    pub fn get(&self) -> CachedValue<T> {
        self.state.read().clone()
    }

    pub fn etag(&self) -> String {
        self.state.read().etag.clone()
    }

    pub fn needs_fetch(&self) -> bool {
        !self.is_static || self.state.read().value.is_none()
    }

    pub fn set(&self, value: T, etag: String) {
        *self.state.write() = CachedValue {
            value: Some(Arc::new(value)),
            etag,
            error: None,
        };
    }

    /// Records a failed refresh. The previous value keeps being served.
    pub fn set_error(&self, error: String) {
        self.state.write().error = Some(error);
    }

    /// The source stopped publishing a document.
    pub fn clear(&self) {
        *self.state.write() = CachedValue::default();
    }
}

impl<T> Default for LeafNode<T> {
    fn default() -> Self {
        LeafNode::new()
    }
}

struct Memo<M> {
    key: Vec<(String, String)>,
    value: Arc<M>,
}

pub struct MergeNode<M> {
    memo: Mutex<Option<Memo<M>>>,
}

impl<M> MergeNode<M> {
    pub fn new() -> Self {
        MergeNode {
            memo: Mutex::new(None),
        }
    }

    /// Returns the merge for `key`, running `merge` only if the key differs from
    /// the memoized one. A failed merge returns the last successful result.
    pub fn get<F>(&self, key: Vec<(String, String)>, merge: F) -> Option<Arc<M>>
    where
        F: FnOnce() -> Result<M, String>,
    {
        let mut memo = self.memo.lock();
        if let Some(current) = memo.as_ref()
            && current.key == key
        {
            return Some(current.value.clone());
        }

        match merge() {
            Ok(value) => {
                let value = Arc::new(value);
                *memo = Some(Memo {
                    key,
                    value: value.clone(),
                });
                Some(value)
            }
            Err(e) => {
                tracing::error!(error = %e, "Merge failed, serving last merged document");
                memo.as_ref().map(|m| m.value.clone())
            }
        }
    }

    pub fn invalidate(&self) {
        *self.memo.lock() = None;
    }
}

impl<M> Default for MergeNode<M> {
    fn default() -> Self {
        MergeNode::new()
    }
}
