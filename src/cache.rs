use std::convert::Infallible;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionResult, TransactionError, TransactionalTree};
use sled::{IVec, Transactional, Tree};
use tracing::debug;

use crate::error::{Result, ToneError};
use crate::models::{CommentId, CommentView};

/// Generation key bumped by `clear_all`
const EPOCH_KEY: &[u8] = b"__epoch__";

#[derive(Serialize, Deserialize)]
struct CacheEntry<T> {
    value: T,
    timestamp: DateTime<Utc>,
}

/// Proof of the cache generation observed before reading from the database.
///
/// A write-back through a ticket only lands if no invalidation of its key (and
/// no `clear_all`) happened since the ticket was taken, so a slow reader can
/// never put a view back that an invalidation already evicted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewTicket {
    key: String,
    epoch: u64,
    generation: u64,
}

impl ViewTicket {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Cache of rendered comment views, backed by sled.
///
/// Keys are derived from the comment id (`comment:{id}`) and from the SKU for
/// the per-product listing (`sku:{sku}`), so a tone change only evicts the
/// views that embed that comment. Every key also has a generation counter in a
/// second tree; invalidation bumps it in the same transaction that removes the
/// view.
#[derive(Clone)]
pub struct ViewCache {
    db: sled::Db,
    views: Tree,
    generations: Tree,
}

impl ViewCache {
    /// Open (creating if needed) a cache directory
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(path.as_ref())?;
        Self::from_db(sled::open(path.as_ref())?)
    }

    /// Cache that lives only as long as this handle
    pub fn temporary() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let views = db.open_tree("views")?;
        let generations = db.open_tree("generations")?;
        Ok(Self {
            db,
            views,
            generations,
        })
    }

    /// Key of a single comment's view
    #[must_use]
    pub fn comment_key(id: CommentId) -> String {
        format!("comment:{id}")
    }

    /// Key of the listing of one SKU
    #[must_use]
    pub fn sku_key(sku: &str) -> String {
        format!("sku:{sku}")
    }

    /// Key of the listing of every comment
    #[must_use]
    pub fn all_key() -> String {
        "all".to_string()
    }

    fn listing_key(sku: Option<&str>) -> String {
        sku.map_or_else(Self::all_key, Self::sku_key)
    }

    fn ticket(&self, key: String) -> Result<ViewTicket> {
        let epoch = read_counter(self.generations.get(EPOCH_KEY)?);
        let generation = read_counter(self.generations.get(key.as_bytes())?);
        Ok(ViewTicket {
            key,
            epoch,
            generation,
        })
    }

    /// Take before loading a comment from the database
    pub fn comment_ticket(&self, id: CommentId) -> Result<ViewTicket> {
        self.ticket(Self::comment_key(id))
    }

    /// Take before loading a listing from the database
    pub fn listing_ticket(&self, sku: Option<&str>) -> Result<ViewTicket> {
        self.ticket(Self::listing_key(sku))
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        if let Some(data) = self.views.get(key.as_bytes())? {
            let entry: CacheEntry<T> = bincode::deserialize(&data)?;
            Ok(Some(entry.value))
        } else {
            Ok(None)
        }
    }

    /// Store `value` under the ticket's key unless it was invalidated since.
    /// Returns whether the value was written.
    fn put<T: Serialize>(&self, ticket: &ViewTicket, value: T) -> Result<bool> {
        let entry = CacheEntry {
            value,
            timestamp: Utc::now(),
        };
        let data = bincode::serialize(&entry)?;
        let key = ticket.key.as_bytes();

        let written = (&self.views, &self.generations)
            .transaction(
                |(views, generations)| -> ConflictableTransactionResult<bool, Infallible> {
                    let epoch = read_counter(generations.get(EPOCH_KEY)?);
                    let generation = read_counter(generations.get(key)?);
                    if epoch != ticket.epoch || generation != ticket.generation {
                        return Ok(false);
                    }
                    views.insert(key, data.as_slice())?;
                    Ok(true)
                },
            )
            .map_err(storage_error)?;

        if !written {
            debug!(key = %ticket.key, "Skipped write-back of a view invalidated meanwhile");
        }
        Ok(written)
    }

    pub fn get_comment(&self, id: CommentId) -> Result<Option<CommentView>> {
        self.get(&Self::comment_key(id))
    }

    /// Write back a view loaded after `ticket` was taken
    pub fn cache_comment(&self, ticket: &ViewTicket, view: &CommentView) -> Result<bool> {
        debug_assert_eq!(ticket.key, Self::comment_key(view.id));
        self.put(ticket, view)
    }

    /// Cached listing for `sku`, or for every comment when `sku` is `None`
    pub fn get_listing(&self, sku: Option<&str>) -> Result<Option<Vec<CommentView>>> {
        self.get(&Self::listing_key(sku))
    }

    /// Write back a listing loaded after `ticket` was taken
    pub fn cache_listing(&self, ticket: &ViewTicket, views: &[CommentView]) -> Result<bool> {
        self.put(ticket, views)
    }

    fn invalidate(&self, keys: &[String]) -> Result<()> {
        (&self.views, &self.generations)
            .transaction(
                |(views, generations)| -> ConflictableTransactionResult<(), Infallible> {
                    for key in keys {
                        views.remove(key.as_bytes())?;
                        bump(generations, key.as_bytes())?;
                    }
                    Ok(())
                },
            )
            .map_err(storage_error)
    }

    /// Evict every view that embeds the given comment
    pub fn invalidate_comment(&self, id: CommentId, sku: &str) -> Result<()> {
        self.invalidate(&[Self::comment_key(id), Self::sku_key(sku), Self::all_key()])?;
        debug!(comment_id = id, sku, "Invalidated cached comment views");
        Ok(())
    }

    /// Evict the listings of a SKU, for comments moving between products
    pub fn invalidate_sku(&self, sku: &str) -> Result<()> {
        self.invalidate(&[Self::sku_key(sku)])
    }

    /// Drop everything; fallback when the affected keys are unknown
    pub fn clear_all(&self) -> Result<()> {
        // Outstanding tickets go stale before the views disappear
        self.generations
            .transaction(|generations| -> ConflictableTransactionResult<(), Infallible> {
                bump(generations, EPOCH_KEY)?;
                Ok(())
            })
            .map_err(storage_error)?;
        self.views.clear()?;
        self.db.flush()?;
        Ok(())
    }

    /// Number of cached views
    #[must_use]
    pub fn len(&self) -> usize {
        self.views.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

fn read_counter(value: Option<IVec>) -> u64 {
    value
        .and_then(|bytes| <[u8; 8]>::try_from(bytes.as_ref()).ok())
        .map_or(0, u64::from_be_bytes)
}

fn bump(
    generations: &TransactionalTree,
    key: &[u8],
) -> ConflictableTransactionResult<(), Infallible> {
    let next = read_counter(generations.get(key)?).wrapping_add(1);
    generations.insert(key, next.to_be_bytes().to_vec())?;
    Ok(())
}

fn storage_error(err: TransactionError<Infallible>) -> ToneError {
    match err {
        TransactionError::Abort(never) => match never {},
        TransactionError::Storage(e) => e.into(),
    }
}
