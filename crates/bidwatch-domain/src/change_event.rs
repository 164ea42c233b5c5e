/// Logical commit timestamp tagging every change event. Events sharing a
/// timestamp belong to one transactional instant on the source.
pub type Timestamp = u64;

/// One row-level change received from the feed.
///
/// `fields` is the full row payload and is opaque to the core; `id`,
/// `recipient` and `ts` are the only values the core interprets.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub id: String,
    pub ts: Timestamp,
    pub recipient: String,
    pub fields: serde_json::Value,
}
