use async_trait::async_trait;

use crate::error::TubeError;
use crate::types::{ContactRef, HandleId};

/// Resolves protocol handles into shared contact objects.
///
/// The directory owns its contacts; callers keep `Arc` references. A lookup
/// may return fewer contacts than handles it was given.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn contacts_for_handles(&self, handles: &[HandleId])
        -> Result<Vec<ContactRef>, TubeError>;
}
