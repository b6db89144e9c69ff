//! MongoDB source adapter.

use crate::config::SourceConfig;
use crate::error::{Error, Result, with_timeout};
use crate::source::{DocumentSource, SourceQuery};
use crate::value::{NodeId, RawDocument, RawValue, format_timestamp};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{TryFutureExt, TryStreamExt};
use mongodb::bson::{Bson, Document, doc};
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// MongoDB client wrapper.
pub struct MongoSource {
    db: Database,
    call_timeout: Duration,
}

impl MongoSource {
    /// Connect to MongoDB.
    ///
    /// The driver connects lazily; `timeout` bounds server selection,
    /// socket connects and each later round trip.
    #[instrument(skip(config), fields(database = %config.database))]
    pub async fn connect(config: &SourceConfig, timeout: Duration) -> Result<Self> {
        info!("Connecting to MongoDB...");

        let mut options = ClientOptions::parse(config.uri.as_str())
            .await
            .map_err(|e| Error::source_connection("Invalid MongoDB URI", e))?;
        options.app_name = Some("mongo-stage-sync".to_string());
        options.connect_timeout = Some(timeout);
        options.server_selection_timeout = Some(timeout);

        let client = Client::with_options(options)
            .map_err(|e| Error::source_connection("Failed to create MongoDB client", e))?;

        Ok(Self {
            db: client.database(&config.database),
            call_timeout: timeout,
        })
    }
}

#[async_trait]
impl DocumentSource for MongoSource {
    #[instrument(skip(self), fields(collection = %query.collection))]
    async fn find_newer(&self, query: SourceQuery<'_>) -> Result<Vec<RawDocument>> {
        let filter = build_filter(&query);
        let mut sort = Document::new();
        sort.insert(query.timestamp_field, -1);

        debug!("Executing find: filter={} sort={}", filter, sort);

        let collection = self.db.collection::<Document>(query.collection);
        let find = collection
            .find(filter)
            .sort(sort)
            .into_future()
            .map_err(|e| Error::source_query(query.collection, "Find failed", Some(e)));
        let mut cursor = with_timeout("find", self.call_timeout, find).await?;

        // The cursor refills one server batch at a time; each refill gets
        // its own deadline
        let mut documents = Vec::new();
        loop {
            let next = cursor
                .try_next()
                .map_err(|e| Error::source_query(query.collection, "Cursor failed", Some(e)));
            match with_timeout("read cursor", self.call_timeout, next).await? {
                Some(document) => documents.push(from_bson_document(&document)),
                None => break,
            }
        }

        debug!("Fetched {} documents from {}", documents.len(), query.collection);
        Ok(documents)
    }

    async fn ping(&self) -> Result<()> {
        let ping = self
            .db
            .run_command(doc! { "ping": 1 })
            .into_future()
            .map_err(|e| Error::source_connection("Ping failed", e));
        with_timeout("ping source", self.call_timeout, ping).await?;
        Ok(())
    }
}

/// Documents newer than `after`, or `{}` for a full scan.
///
/// `$gt` never matches across BSON types, so a Date bound alone would skip
/// every document whose timestamp is stored as a string. The second branch
/// compares those strings against the canonical `YYYY-MM-DD HH:MM:SS` text
/// of the watermark. `T`-separated strings from the watermark's own day
/// sort above that bound and are refetched; their ids are already staged.
fn build_filter(query: &SourceQuery<'_>) -> Document {
    let mut filter = Document::new();
    if let Some(after) = query.after {
        let as_date = mongodb::bson::DateTime::from_millis(after.timestamp_millis());
        let mut newer_date = Document::new();
        newer_date.insert(query.timestamp_field, doc! { "$gt": as_date });
        let mut newer_text = Document::new();
        newer_text.insert(query.timestamp_field, doc! { "$gt": format_timestamp(&after) });
        filter.insert("$or", vec![newer_date, newer_text]);
    }
    filter
}

/// Convert a BSON document into the source-neutral document graph.
pub fn from_bson_document(document: &Document) -> RawDocument {
    let mut raw = RawDocument::new();
    let root = raw.root();
    fill_map(&mut raw, root, document);
    raw
}

fn fill_map(raw: &mut RawDocument, node: NodeId, document: &Document) {
    for (key, value) in document {
        let converted = convert(raw, value);
        raw.insert(node, key.as_str(), converted);
    }
}

fn convert(raw: &mut RawDocument, value: &Bson) -> RawValue {
    match value {
        Bson::Null | Bson::Undefined => RawValue::Null,
        Bson::Boolean(b) => RawValue::Bool(*b),
        Bson::Int32(n) => RawValue::Int(i64::from(*n)),
        Bson::Int64(n) => RawValue::Int(*n),
        Bson::Double(f) => RawValue::Float(*f),
        Bson::String(s) => RawValue::Text(s.clone()),
        Bson::ObjectId(oid) => RawValue::Identifier(oid.to_hex()),
        Bson::DateTime(dt) => DateTime::<Utc>::from_timestamp_millis(dt.timestamp_millis())
            .map(RawValue::Timestamp)
            .unwrap_or_else(|| RawValue::Identifier(dt.to_string())),
        Bson::Array(items) => {
            RawValue::Sequence(items.iter().map(|item| convert(raw, item)).collect())
        }
        Bson::Document(sub) => {
            let child = raw.add_map();
            fill_map(raw, child, sub);
            RawValue::Map(child)
        }
        other => RawValue::Identifier(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitize::sanitize;
    use chrono::TimeZone;
    use mongodb::bson::oid::ObjectId;
    use serde_json::json;

    #[test]
    fn test_filter_with_watermark() {
        let after = Utc.with_ymd_and_hms(2025, 2, 17, 0, 0, 0).unwrap();
        let filter = build_filter(&SourceQuery {
            collection: "ads",
            timestamp_field: "created_at",
            after: Some(after),
        });
        let expected = mongodb::bson::DateTime::from_millis(after.timestamp_millis());
        assert_eq!(
            filter,
            doc! { "$or": [
                { "created_at": { "$gt": expected } },
                { "created_at": { "$gt": "2025-02-17 00:00:00" } },
            ] }
        );
    }

    #[test]
    fn test_filter_without_watermark_is_empty() {
        let filter = build_filter(&SourceQuery {
            collection: "ads",
            timestamp_field: "created_at",
            after: None,
        });
        assert!(filter.is_empty());
    }

    #[test]
    fn test_bson_conversion() {
        let oid = ObjectId::parse_str("65d0a1f2c3b4a5968778695a").unwrap();
        let created = Utc.with_ymd_and_hms(2025, 2, 17, 8, 0, 0).unwrap();
        let document = doc! {
            "_id": oid,
            "created_at": mongodb::bson::DateTime::from_millis(created.timestamp_millis()),
            "budget": 1200.5,
            "clicks": 17_i32,
            "tags": ["spa", "nails"],
            "campaign": { "name": "spring", "score": f64::NAN },
        };

        let raw = from_bson_document(&document);
        assert_eq!(raw.get("_id"), Some(&RawValue::Identifier("65d0a1f2c3b4a5968778695a".into())));
        assert_eq!(raw.get("created_at"), Some(&RawValue::Timestamp(created)));
        assert_eq!(raw.node_count(), 2);

        assert_eq!(
            sanitize(&raw),
            json!({
                "_id": "65d0a1f2c3b4a5968778695a",
                "created_at": "2025-02-17 08:00:00",
                "budget": 1200.5,
                "clicks": 17,
                "tags": ["spa", "nails"],
                "campaign": { "name": "spring", "score": null },
            })
        );
    }
}
