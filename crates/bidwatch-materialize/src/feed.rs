use crate::client::MaterializeClient;
use anyhow::anyhow;
use async_trait::async_trait;
use bidwatch_domain::{
    ChangeEvent, ChangeFeedSource, DomainError, DomainResult, FeedSession, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_postgres::SimpleQueryMessage;
use tracing::{debug, info, warn};

const CURSOR_NAME: &str = "bidwatch_feed";

/// Which relation to subscribe to and how its rows map onto change events.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedConfig {
    /// Source relation, e.g. a `winning_bids` view.
    pub relation: String,
    /// Column carrying the event's unique identifier.
    pub id_column: String,
    /// Column identifying the notification recipient.
    pub recipient_column: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            relation: "winning_bids".to_string(),
            id_column: "id".to_string(),
            recipient_column: "buyer".to_string(),
        }
    }
}

/// Change feed over a Materialize SUBSCRIBE cursor.
///
/// Each subscription runs on its own dedicated connection: `BEGIN`, then
/// `DECLARE ... CURSOR FOR SUBSCRIBE`, then repeated non-blocking fetches.
/// The subscription is opened without a snapshot, so only changes after the
/// resume point (or after subscription time, when starting fresh) are
/// delivered.
pub struct MaterializeChangeFeed {
    client: MaterializeClient,
    config: FeedConfig,
}

impl MaterializeChangeFeed {
    pub fn new(client: MaterializeClient, config: FeedConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl ChangeFeedSource for MaterializeChangeFeed {
    async fn subscribe(
        &self,
        resume_from: Option<Timestamp>,
    ) -> DomainResult<Box<dyn FeedSession>> {
        let (client, driver) = self
            .client
            .connect_dedicated()
            .await
            .map_err(DomainError::Feed)?;

        let declare = subscribe_statement(&self.config, resume_from);
        debug!(statement = %declare, "declaring subscribe cursor");
        client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| DomainError::Feed(e.into()))?;
        client
            .batch_execute(&declare)
            .await
            .map_err(|e| DomainError::Feed(e.into()))?;

        info!(
            relation = %self.config.relation,
            resume = ?resume_from,
            "subscribed to change feed"
        );
        Ok(Box::new(MaterializeFeedSession {
            client,
            driver,
            config: self.config.clone(),
        }))
    }
}

pub struct MaterializeFeedSession {
    client: tokio_postgres::Client,
    driver: JoinHandle<()>,
    config: FeedConfig,
}

#[async_trait]
impl FeedSession for MaterializeFeedSession {
    async fn poll(&mut self) -> DomainResult<Vec<ChangeEvent>> {
        // Zero timeout keeps the fetch non-blocking; the consumer loop owns
        // the idle wait.
        let fetch = format!("FETCH ALL {CURSOR_NAME} WITH (timeout = '0s')");
        let messages = self
            .client
            .simple_query(&fetch)
            .await
            .map_err(|e| DomainError::Feed(e.into()))?;

        let mut events = Vec::new();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                let columns: Vec<(String, Option<String>)> = row
                    .columns()
                    .iter()
                    .enumerate()
                    .map(|(i, col)| (col.name().to_string(), row.get(i).map(str::to_string)))
                    .collect();
                events.push(decode_row(&self.config, &columns)?);
            }
        }

        if !events.is_empty() {
            debug!(count = events.len(), "fetched change events");
        }
        Ok(events)
    }

    async fn close(&mut self) -> DomainResult<()> {
        let close = format!("CLOSE {CURSOR_NAME}; COMMIT");
        if let Err(e) = self.client.batch_execute(&close).await {
            warn!(error = %e, "failed to close subscribe cursor");
        }
        self.driver.abort();
        Ok(())
    }
}

fn subscribe_statement(config: &FeedConfig, resume_from: Option<Timestamp>) -> String {
    let mut statement = format!(
        "DECLARE {CURSOR_NAME} CURSOR FOR SUBSCRIBE (SELECT * FROM {})",
        config.relation
    );
    if let Some(ts) = resume_from {
        statement.push_str(&format!(" AS OF {ts}"));
    }
    statement.push_str(" WITH (SNAPSHOT = FALSE)");
    statement
}

/// Decodes one text-protocol SUBSCRIBE row into a change event.
///
/// `mz_timestamp` becomes the event's `ts`; every other column, `mz_diff`
/// included, lands in the opaque payload keyed by column name.
fn decode_row(
    config: &FeedConfig,
    columns: &[(String, Option<String>)],
) -> DomainResult<ChangeEvent> {
    let mut ts = None;
    let mut fields = serde_json::Map::new();

    for (name, value) in columns {
        if name == "mz_timestamp" {
            let raw = value
                .as_deref()
                .ok_or_else(|| DomainError::Feed(anyhow!("row with null mz_timestamp")))?;
            let parsed = raw.parse::<Timestamp>().map_err(|e| {
                DomainError::Feed(anyhow!("unparseable mz_timestamp {raw:?}: {e}"))
            })?;
            ts = Some(parsed);
        } else {
            fields.insert(name.clone(), text_to_json(value.as_deref()));
        }
    }

    let ts = ts.ok_or_else(|| DomainError::Feed(anyhow!("row without mz_timestamp column")))?;
    let id = identity_string(fields.get(&config.id_column)).ok_or_else(|| {
        DomainError::Feed(anyhow!("row without id column {:?}", config.id_column))
    })?;
    let recipient = identity_string(fields.get(&config.recipient_column)).ok_or_else(|| {
        DomainError::Feed(anyhow!(
            "row without recipient column {:?}",
            config.recipient_column
        ))
    })?;

    Ok(ChangeEvent {
        id,
        ts,
        recipient,
        fields: Value::Object(fields),
    })
}

fn identity_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Best-effort coercion of a text-protocol value: integers, floats and
/// booleans become JSON scalars, everything else stays a string.
fn text_to_json(raw: Option<&str>) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };
    if let Ok(n) = raw.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    match raw {
        "t" | "true" => Value::Bool(true),
        "f" | "false" => Value::Bool(false),
        _ => Value::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn winning_bid_row() -> Vec<(String, Option<String>)> {
        vec![
            ("mz_timestamp".to_string(), Some("1757".to_string())),
            ("mz_diff".to_string(), Some("1".to_string())),
            ("id".to_string(), Some("bid-17".to_string())),
            ("buyer".to_string(), Some("ada".to_string())),
            ("auction_id".to_string(), Some("3".to_string())),
            ("amount".to_string(), Some("149.50".to_string())),
            (
                "bid_time".to_string(),
                Some("2025-05-01 12:00:00+00".to_string()),
            ),
            ("item".to_string(), Some("vintage radio".to_string())),
            ("seller".to_string(), None),
        ]
    }

    #[test]
    fn subscribe_statement_without_resume_point() {
        let statement = subscribe_statement(&FeedConfig::default(), None);
        assert_eq!(
            statement,
            "DECLARE bidwatch_feed CURSOR FOR SUBSCRIBE (SELECT * FROM winning_bids) \
             WITH (SNAPSHOT = FALSE)"
        );
    }

    #[test]
    fn subscribe_statement_with_resume_point() {
        let statement = subscribe_statement(&FeedConfig::default(), Some(1757));
        assert_eq!(
            statement,
            "DECLARE bidwatch_feed CURSOR FOR SUBSCRIBE (SELECT * FROM winning_bids) \
             AS OF 1757 WITH (SNAPSHOT = FALSE)"
        );
    }

    #[test]
    fn decodes_row_into_change_event() {
        let event = decode_row(&FeedConfig::default(), &winning_bid_row()).unwrap();

        assert_eq!(event.ts, 1757);
        assert_eq!(event.id, "bid-17");
        assert_eq!(event.recipient, "ada");
        // The timestamp column is lifted out, everything else rides along.
        assert!(event.fields.get("mz_timestamp").is_none());
        assert_eq!(event.fields["mz_diff"], 1);
        assert_eq!(event.fields["auction_id"], 3);
        assert_eq!(event.fields["amount"], 149.5);
        assert_eq!(event.fields["item"], "vintage radio");
        assert_eq!(event.fields["seller"], Value::Null);
    }

    #[test]
    fn numeric_identity_columns_are_stringified() {
        let mut row = winning_bid_row();
        row[3].1 = Some("42".to_string());

        let event = decode_row(&FeedConfig::default(), &row).unwrap();
        assert_eq!(event.recipient, "42");
    }

    #[test]
    fn row_without_timestamp_is_a_feed_error() {
        let row = vec![("buyer".to_string(), Some("ada".to_string()))];
        let err = decode_row(&FeedConfig::default(), &row).unwrap_err();
        assert!(matches!(err, DomainError::Feed(_)));
    }

    #[test]
    fn row_without_recipient_is_a_feed_error() {
        let mut row = winning_bid_row();
        row.retain(|(name, _)| name != "buyer");
        let err = decode_row(&FeedConfig::default(), &row).unwrap_err();
        assert!(matches!(err, DomainError::Feed(_)));
    }

    #[test]
    fn coerces_text_values_into_json_scalars() {
        assert_eq!(text_to_json(Some("12")), Value::from(12));
        assert_eq!(text_to_json(Some("12.5")), Value::from(12.5));
        assert_eq!(text_to_json(Some("t")), Value::Bool(true));
        assert_eq!(text_to_json(Some("false")), Value::Bool(false));
        assert_eq!(text_to_json(Some("radio")), Value::from("radio"));
        assert_eq!(text_to_json(None), Value::Null);
    }
}
