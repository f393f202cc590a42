//! DynamoDB-backed [`KeyValueStore`].

use crate::config::DynamoConfig;
use crate::error::{Result, StorageError};
use crate::kv::{AttrValue, Item, ItemKey, KeyQuery, KeyValueStore, Page, Table, ATTR_PK, ATTR_SK};
use async_trait::async_trait;
use aws_sdk_dynamodb::types::{AttributeValue, DeleteRequest, PutRequest, WriteRequest};
use aws_sdk_dynamodb::Client;
use aws_smithy_types::timeout::TimeoutConfig;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Maximum requests per BatchWriteItem call
pub const BATCH_WRITE_LIMIT: usize = 25;

/// Unprocessed-item resubmissions before a batch is reported as failed
const MAX_UNPROCESSED_ATTEMPTS: u32 = 8;

type NativeItem = HashMap<String, AttributeValue>;

pub struct DynamoStore {
    client: Client,
    readings_table: String,
    organization_table: String,
}

impl DynamoStore {
    /// Create a store inheriting from the shared SDK config, then applying
    /// region, endpoint and timeout overrides
    pub fn new(sdk_config: &aws_config::SdkConfig, config: &DynamoConfig) -> Self {
        let mut builder = aws_sdk_dynamodb::config::Builder::from(sdk_config);

        if let Some(ref region) = config.region {
            builder = builder.region(aws_sdk_dynamodb::config::Region::new(region.clone()));
        }

        // e.g. DynamoDB Local
        if let Some(ref endpoint) = config.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }

        if let Some(timeout_ms) = config.timeout_ms {
            let timeout_config = TimeoutConfig::builder()
                .operation_timeout(Duration::from_millis(timeout_ms))
                .build();
            builder = builder.timeout_config(timeout_config);
        }

        Self::from_client(
            Client::from_conf(builder.build()),
            config.readings_table.clone(),
            config.organization_table.clone(),
        )
    }

    /// Create from a pre-built client
    pub fn from_client(client: Client, readings_table: String, organization_table: String) -> Self {
        Self {
            client,
            readings_table,
            organization_table,
        }
    }

    fn table_name(&self, table: Table) -> &str {
        match table {
            Table::Readings => &self.readings_table,
            Table::Organization => &self.organization_table,
        }
    }

    fn native_key(key: &ItemKey) -> NativeItem {
        HashMap::from([
            (ATTR_PK.to_string(), AttributeValue::S(key.pk.clone())),
            (ATTR_SK.to_string(), AttributeValue::S(key.sk.clone())),
        ])
    }

    /// Submit write requests in chunks, resubmitting whatever the service
    /// reports back as unprocessed
    async fn write_requests(&self, table: Table, requests: Vec<WriteRequest>) -> Result<()> {
        let table_name = self.table_name(table).to_string();

        for chunk in requests.chunks(BATCH_WRITE_LIMIT) {
            let mut pending = chunk.to_vec();
            let mut attempt = 0;

            while !pending.is_empty() {
                if attempt == MAX_UNPROCESSED_ATTEMPTS {
                    return Err(StorageError::backend(format!(
                        "DynamoDB BatchWriteItem left {} items unprocessed",
                        pending.len()
                    )));
                }
                if attempt > 0 {
                    warn!(
                        table = %table_name,
                        unprocessed = pending.len(),
                        attempt,
                        "Resubmitting unprocessed batch items"
                    );
                    tokio::time::sleep(Duration::from_millis(50 * 2u64.pow(attempt))).await;
                }

                let response = self
                    .client
                    .batch_write_item()
                    .request_items(&table_name, pending)
                    .send()
                    .await
                    .map_err(|e| {
                        StorageError::backend(format!("DynamoDB BatchWriteItem failed: {}", e))
                    })?;

                pending = response
                    .unprocessed_items()
                    .and_then(|unprocessed| unprocessed.get(&table_name))
                    .cloned()
                    .unwrap_or_default();
                attempt += 1;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for DynamoStore {
    async fn put_item(&self, table: Table, item: Item) -> Result<()> {
        self.client
            .put_item()
            .table_name(self.table_name(table))
            .set_item(Some(to_native_item(item)))
            .send()
            .await
            .map_err(|e| StorageError::backend(format!("DynamoDB PutItem failed: {}", e)))?;
        Ok(())
    }

    async fn get_item(&self, table: Table, key: &ItemKey) -> Result<Option<Item>> {
        let response = self
            .client
            .get_item()
            .table_name(self.table_name(table))
            .set_key(Some(Self::native_key(key)))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| StorageError::backend(format!("DynamoDB GetItem failed: {}", e)))?;

        response.item().map(from_native_item).transpose()
    }

    async fn delete_item(&self, table: Table, key: &ItemKey) -> Result<()> {
        self.client
            .delete_item()
            .table_name(self.table_name(table))
            .set_key(Some(Self::native_key(key)))
            .send()
            .await
            .map_err(|e| StorageError::backend(format!("DynamoDB DeleteItem failed: {}", e)))?;
        Ok(())
    }

    #[instrument(skip(self, start), fields(pk = %query.pk))]
    async fn query(&self, table: Table, query: &KeyQuery, start: Option<Item>) -> Result<Page> {
        let mut request = self
            .client
            .query()
            .table_name(self.table_name(table))
            .expression_attribute_names("#pk", ATTR_PK)
            .expression_attribute_values(":pk", AttributeValue::S(query.pk.clone()));

        request = match query.sk_prefix {
            Some(ref prefix) => request
                .key_condition_expression("#pk = :pk AND begins_with(#sk, :prefix)")
                .expression_attribute_names("#sk", ATTR_SK)
                .expression_attribute_values(":prefix", AttributeValue::S(prefix.clone())),
            None => request.key_condition_expression("#pk = :pk"),
        };

        if let Some(limit) = query.limit {
            request = request.limit(i32::try_from(limit).unwrap_or(i32::MAX));
        }

        if let Some(start) = start {
            request = request.set_exclusive_start_key(Some(to_native_item(start)));
        }

        let response = request
            .send()
            .await
            .map_err(|e| StorageError::backend(format!("DynamoDB Query failed: {}", e)))?;

        let items = response
            .items()
            .iter()
            .map(from_native_item)
            .collect::<Result<Vec<_>>>()?;
        debug!(count = items.len(), "Query page");

        Ok(Page {
            items,
            next: next_page_key(response.last_evaluated_key())?,
        })
    }

    async fn scan(&self, table: Table, start: Option<Item>) -> Result<Page> {
        let mut request = self.client.scan().table_name(self.table_name(table));

        if let Some(start) = start {
            request = request.set_exclusive_start_key(Some(to_native_item(start)));
        }

        let response = request
            .send()
            .await
            .map_err(|e| StorageError::backend(format!("DynamoDB Scan failed: {}", e)))?;

        Ok(Page {
            items: response
                .items()
                .iter()
                .map(from_native_item)
                .collect::<Result<Vec<_>>>()?,
            next: next_page_key(response.last_evaluated_key())?,
        })
    }

    #[instrument(skip(self, items), fields(count = items.len()))]
    async fn batch_write(&self, table: Table, items: Vec<Item>) -> Result<()> {
        let requests = items
            .into_iter()
            .map(|item| {
                let put = PutRequest::builder()
                    .set_item(Some(to_native_item(item)))
                    .build()
                    .map_err(|e| StorageError::precondition(format!("invalid put request: {}", e)))?;
                Ok(WriteRequest::builder().put_request(put).build())
            })
            .collect::<Result<Vec<_>>>()?;

        self.write_requests(table, requests).await
    }

    #[instrument(skip(self, keys), fields(count = keys.len()))]
    async fn batch_delete(&self, table: Table, keys: Vec<ItemKey>) -> Result<()> {
        let requests = keys
            .iter()
            .map(|key| {
                let delete = DeleteRequest::builder()
                    .set_key(Some(Self::native_key(key)))
                    .build()
                    .map_err(|e| {
                        StorageError::precondition(format!("invalid delete request: {}", e))
                    })?;
                Ok(WriteRequest::builder().delete_request(delete).build())
            })
            .collect::<Result<Vec<_>>>()?;

        self.write_requests(table, requests).await
    }
}

fn next_page_key(last_evaluated_key: Option<&NativeItem>) -> Result<Option<Item>> {
    match last_evaluated_key {
        Some(key) if !key.is_empty() => from_native_item(key).map(Some),
        _ => Ok(None),
    }
}

fn to_native_item(item: Item) -> NativeItem {
    item.into_iter()
        .map(|(name, value)| (name, to_native(value)))
        .collect()
}

fn to_native(value: AttrValue) -> AttributeValue {
    match value {
        AttrValue::S(s) => AttributeValue::S(s),
        AttrValue::N(n) => AttributeValue::N(n),
        AttrValue::Bool(b) => AttributeValue::Bool(b),
        AttrValue::L(list) => AttributeValue::L(list.into_iter().map(to_native).collect()),
        AttrValue::M(map) => AttributeValue::M(to_native_item(map)),
        AttrValue::Null => AttributeValue::Null(true),
    }
}

fn from_native_item(item: &NativeItem) -> Result<Item> {
    item.iter()
        .map(|(name, value)| Ok((name.clone(), from_native(name, value)?)))
        .collect()
}

fn from_native(name: &str, value: &AttributeValue) -> Result<AttrValue> {
    Ok(match value {
        AttributeValue::S(s) => AttrValue::S(s.clone()),
        AttributeValue::N(n) => AttrValue::N(n.clone()),
        AttributeValue::Bool(b) => AttrValue::Bool(*b),
        AttributeValue::L(list) => AttrValue::L(
            list.iter()
                .map(|v| from_native(name, v))
                .collect::<Result<Vec<_>>>()?,
        ),
        AttributeValue::M(map) => AttrValue::M(from_native_item(map)?),
        AttributeValue::Null(_) => AttrValue::Null,
        other => {
            return Err(StorageError::malformed(format!(
                "attribute {name} has unsupported type {other:?}"
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_conversion_round_trip() {
        let item: Item = HashMap::from([
            (ATTR_PK.to_string(), AttrValue::S("GEO#1.00#2.00".to_string())),
            (ATTR_SK.to_string(), AttrValue::S("position#a".to_string())),
            ("lat".to_string(), AttrValue::N("1.0000000000".to_string())),
            (
                "entities".to_string(),
                AttrValue::L(vec![AttrValue::M(HashMap::from([(
                    "present".to_string(),
                    AttrValue::N("1".to_string()),
                )]))]),
            ),
            ("gone".to_string(), AttrValue::Null),
        ]);

        let native = to_native_item(item.clone());
        assert_eq!(native["lat"], AttributeValue::N("1.0000000000".to_string()));
        assert_eq!(from_native_item(&native).unwrap(), item);
    }

    #[test]
    fn test_unsupported_native_type_is_malformed() {
        let native = HashMap::from([(
            "tags".to_string(),
            AttributeValue::Ss(vec!["a".to_string()]),
        )]);
        assert!(matches!(
            from_native_item(&native),
            Err(StorageError::MalformedItem(_))
        ));
    }

    #[test]
    fn test_empty_last_evaluated_key_ends_pagination() {
        assert!(next_page_key(None).unwrap().is_none());
        assert!(next_page_key(Some(&HashMap::new())).unwrap().is_none());
    }
}
