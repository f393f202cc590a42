//! Key-value store seam.
//!
//! The storage layer talks to a two-table wide-column store through
//! [`KeyValueStore`]. Items are attribute maps addressed by a partition key
//! (`pk`) and a sort key (`sk`). [`crate::dynamo::DynamoStore`] is the
//! production implementation; [`MemoryStore`] backs tests and local runs and
//! paginates the same way the real store does.

use crate::error::{Result, StorageError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

/// Partition key attribute name
pub const ATTR_PK: &str = "pk";
/// Sort key attribute name
pub const ATTR_SK: &str = "sk";

/// A persisted attribute value
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    S(String),
    /// Numbers travel as decimal strings so no binary rounding happens in transit
    N(String),
    Bool(bool),
    L(Vec<AttrValue>),
    M(HashMap<String, AttrValue>),
    Null,
}

impl AttrValue {
    pub fn as_s(&self) -> Option<&str> {
        match self {
            AttrValue::S(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_n(&self) -> Option<&str> {
        match self {
            AttrValue::N(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_l(&self) -> Option<&[AttrValue]> {
        match self {
            AttrValue::L(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_m(&self) -> Option<&HashMap<String, AttrValue>> {
        match self {
            AttrValue::M(m) => Some(m),
            _ => None,
        }
    }
}

/// One stored record
pub type Item = HashMap<String, AttrValue>;

/// The two logical tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Readings, partitioned by spatial bucket
    Readings,
    /// Routes and the org/group/layer/user hierarchy
    Organization,
}

/// Primary key of an item
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub pk: String,
    pub sk: String,
}

impl ItemKey {
    pub fn new(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
        }
    }

    /// Extract the key attributes of an item
    pub fn of(item: &Item) -> Result<Self> {
        let pk = item
            .get(ATTR_PK)
            .and_then(AttrValue::as_s)
            .ok_or_else(|| StorageError::malformed("item without pk"))?;
        let sk = item
            .get(ATTR_SK)
            .and_then(AttrValue::as_s)
            .ok_or_else(|| StorageError::malformed("item without sk"))?;
        Ok(Self::new(pk, sk))
    }

    /// Key attributes as an item, the form native pagination tokens take
    pub fn to_item(&self) -> Item {
        HashMap::from([
            (ATTR_PK.to_string(), AttrValue::S(self.pk.clone())),
            (ATTR_SK.to_string(), AttrValue::S(self.sk.clone())),
        ])
    }
}

/// Partition-scoped range query
#[derive(Debug, Clone, Default)]
pub struct KeyQuery {
    pub pk: String,
    /// Restrict to sort keys beginning with this prefix
    pub sk_prefix: Option<String>,
    /// Page size cap; the store may return fewer
    pub limit: Option<usize>,
}

impl KeyQuery {
    pub fn partition(pk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            ..Default::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.sk_prefix = Some(prefix.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One page of results plus the continuation key, `None` when exhausted
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<Item>,
    pub next: Option<Item>,
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn put_item(&self, table: Table, item: Item) -> Result<()>;

    async fn get_item(&self, table: Table, key: &ItemKey) -> Result<Option<Item>>;

    async fn delete_item(&self, table: Table, key: &ItemKey) -> Result<()>;

    async fn query(&self, table: Table, query: &KeyQuery, start: Option<Item>) -> Result<Page>;

    async fn scan(&self, table: Table, start: Option<Item>) -> Result<Page>;

    /// Bulk write; chunking and unprocessed-item resubmission are the
    /// implementation's concern
    async fn batch_write(&self, table: Table, items: Vec<Item>) -> Result<()>;

    async fn batch_delete(&self, table: Table, keys: Vec<ItemKey>) -> Result<()>;

    /// Drain every page of a query
    async fn query_all(&self, table: Table, query: &KeyQuery) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        let mut start = None;

        loop {
            let page = self.query(table, query, start.take()).await?;
            items.extend(page.items);
            match page.next {
                Some(next) => start = Some(next),
                None => break,
            }
        }

        Ok(items)
    }
}

/// In-memory store ordered by `(pk, sk)`, with a fixed native page size
pub struct MemoryStore {
    tables: RwLock<HashMap<Table, BTreeMap<ItemKey, Item>>>,
    page_size: usize,
}

impl MemoryStore {
    pub const DEFAULT_PAGE_SIZE: usize = 1000;

    pub fn new() -> Self {
        Self::with_page_size(Self::DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            page_size: page_size.max(1),
        }
    }

    /// Number of items in a table
    pub fn len(&self, table: Table) -> usize {
        self.tables.read().get(&table).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, table: Table) -> bool {
        self.len(table) == 0
    }

    fn start_bound(start: Option<Item>) -> Result<Bound<ItemKey>> {
        Ok(match start {
            Some(item) => Bound::Excluded(ItemKey::of(&item)?),
            None => Bound::Unbounded,
        })
    }

    fn paginate<'a>(
        &self,
        rows: impl Iterator<Item = (&'a ItemKey, &'a Item)>,
        limit: usize,
    ) -> Page {
        let mut items = Vec::new();
        let mut last_key = None;
        let mut more = false;

        for (key, item) in rows {
            if items.len() == limit {
                more = true;
                break;
            }
            items.push(item.clone());
            last_key = Some(key.clone());
        }

        Page {
            items,
            next: if more { last_key.map(|k| k.to_item()) } else { None },
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn put_item(&self, table: Table, item: Item) -> Result<()> {
        let key = ItemKey::of(&item)?;
        self.tables
            .write()
            .entry(table)
            .or_default()
            .insert(key, item);
        Ok(())
    }

    async fn get_item(&self, table: Table, key: &ItemKey) -> Result<Option<Item>> {
        Ok(self
            .tables
            .read()
            .get(&table)
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    async fn delete_item(&self, table: Table, key: &ItemKey) -> Result<()> {
        if let Some(rows) = self.tables.write().get_mut(&table) {
            rows.remove(key);
        }
        Ok(())
    }

    async fn query(&self, table: Table, query: &KeyQuery, start: Option<Item>) -> Result<Page> {
        let lower = match Self::start_bound(start)? {
            Bound::Unbounded => Bound::Included(ItemKey::new(&query.pk, "")),
            bound => bound,
        };
        let limit = query.limit.unwrap_or(self.page_size).min(self.page_size);
        let prefix = query.sk_prefix.as_deref().unwrap_or("");

        let tables = self.tables.read();
        let Some(rows) = tables.get(&table) else {
            return Ok(Page::default());
        };

        let matching = rows
            .range((lower, Bound::Unbounded))
            .take_while(|(key, _)| key.pk == query.pk)
            .filter(|(key, _)| key.sk.starts_with(prefix));

        Ok(self.paginate(matching, limit))
    }

    async fn scan(&self, table: Table, start: Option<Item>) -> Result<Page> {
        let lower = Self::start_bound(start)?;
        let tables = self.tables.read();
        let Some(rows) = tables.get(&table) else {
            return Ok(Page::default());
        };

        Ok(self.paginate(rows.range((lower, Bound::Unbounded)), self.page_size))
    }

    async fn batch_write(&self, table: Table, items: Vec<Item>) -> Result<()> {
        let keyed = items
            .into_iter()
            .map(|item| Ok((ItemKey::of(&item)?, item)))
            .collect::<Result<Vec<_>>>()?;

        self.tables.write().entry(table).or_default().extend(keyed);
        Ok(())
    }

    async fn batch_delete(&self, table: Table, keys: Vec<ItemKey>) -> Result<()> {
        if let Some(rows) = self.tables.write().get_mut(&table) {
            for key in &keys {
                rows.remove(key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(pk: &str, sk: &str) -> Item {
        ItemKey::new(pk, sk).to_item()
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        let key = ItemKey::new("a", "b");

        store.put_item(Table::Readings, key.to_item()).await.unwrap();
        assert!(store.get_item(Table::Readings, &key).await.unwrap().is_some());
        assert!(store
            .get_item(Table::Organization, &key)
            .await
            .unwrap()
            .is_none());

        store.delete_item(Table::Readings, &key).await.unwrap();
        assert!(store.get_item(Table::Readings, &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_query_is_partition_scoped_and_prefix_filtered() {
        let store = MemoryStore::new();
        store
            .batch_write(
                Table::Readings,
                vec![
                    item("p1", "image#1"),
                    item("p1", "prediction#1"),
                    item("p1", "prediction#2"),
                    item("p2", "prediction#3"),
                ],
            )
            .await
            .unwrap();

        let all = store
            .query_all(Table::Readings, &KeyQuery::partition("p1"))
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let predictions = store
            .query_all(
                Table::Readings,
                &KeyQuery::partition("p1").with_prefix("prediction#"),
            )
            .await
            .unwrap();
        assert_eq!(predictions.len(), 2);
    }

    #[tokio::test]
    async fn test_query_paginates_with_continuation_key() {
        let store = MemoryStore::with_page_size(2);
        let items = (0..5).map(|i| item("p", &format!("s{i}"))).collect();
        store.batch_write(Table::Readings, items).await.unwrap();

        let query = KeyQuery::partition("p");
        let first = store.query(Table::Readings, &query, None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(first.next.is_some());

        let second = store
            .query(Table::Readings, &query, first.next)
            .await
            .unwrap();
        assert_eq!(second.items.len(), 2);

        let third = store
            .query(Table::Readings, &query, second.next)
            .await
            .unwrap();
        assert_eq!(third.items.len(), 1);
        assert!(third.next.is_none());

        assert_eq!(store.query_all(Table::Readings, &query).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_scan_walks_every_partition() {
        let store = MemoryStore::with_page_size(3);
        let items = (0..7)
            .map(|i| item(&format!("p{}", i % 3), &format!("s{i}")))
            .collect();
        store.batch_write(Table::Organization, items).await.unwrap();

        let mut seen = 0;
        let mut start = None;
        loop {
            let page = store.scan(Table::Organization, start).await.unwrap();
            seen += page.items.len();
            match page.next {
                Some(next) => start = Some(next),
                None => break,
            }
        }
        assert_eq!(seen, 7);
    }

    #[tokio::test]
    async fn test_put_rejects_keyless_item() {
        let store = MemoryStore::new();
        let result = store.put_item(Table::Readings, Item::new()).await;
        assert!(matches!(result, Err(StorageError::MalformedItem(_))));
    }
}
