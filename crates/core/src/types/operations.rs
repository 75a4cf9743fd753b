//! Query options and batch operation descriptors

use super::http::{Request, Response};
use super::newtypes::BlobId;
use serde::{Deserialize, Serialize};

/// Matching knobs shared by match, match-all, keys and delete
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Compare URLs with their query component removed
    pub ignore_search: bool,
    /// Match requests regardless of method
    pub ignore_method: bool,
    /// Skip `Vary` header matching
    pub ignore_vary: bool,
}

impl QueryOptions {
    pub fn ignoring_search() -> Self {
        Self {
            ignore_search: true,
            ..Self::default()
        }
    }

    pub fn ignoring_vary() -> Self {
        Self {
            ignore_vary: true,
            ..Self::default()
        }
    }

    pub fn ignoring_method() -> Self {
        Self {
            ignore_method: true,
            ..Self::default()
        }
    }
}

/// One suboperation of a cache batch
#[derive(Debug, Clone)]
pub enum BatchOperation {
    Put {
        request: Request,
        response: Response,
        body: Option<BlobId>,
    },
    Delete {
        request: Request,
        options: QueryOptions,
    },
}

impl BatchOperation {
    pub fn is_put(&self) -> bool {
        matches!(self, BatchOperation::Put { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, BatchOperation::Delete { .. })
    }
}
