use crate::change_event::{ChangeEvent, Timestamp};
use crate::error::{DomainError, DomainResult};

/// All change events sharing one logical commit timestamp, the atomic unit
/// of dispatch and checkpointing.
#[derive(Debug, Clone)]
pub struct Group {
    ts: Timestamp,
    events: Vec<ChangeEvent>,
}

impl Group {
    fn open(first: ChangeEvent) -> Self {
        Self {
            ts: first.ts,
            events: vec![first],
        }
    }

    pub fn ts(&self) -> Timestamp {
        self.ts
    }

    pub fn events(&self) -> &[ChangeEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Buffers events sharing one timestamp and decides when a group is
/// complete.
///
/// A group is complete when an event with a strictly greater `ts` arrives
/// (`observe` returns the previous group) or when the feed reports nothing
/// available (`flush_if_nonempty`). Events arrive already ordered; a `ts`
/// decrease is a protocol violation, not something to sort around.
#[derive(Debug, Default)]
pub struct GroupAccumulator {
    open: Option<Group>,
    last_closed: Option<Timestamp>,
}

impl GroupAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `event` to the open group, or closes it when `event.ts`
    /// crosses the group boundary. The first event of the stream opens a
    /// group with no boundary check.
    pub fn observe(&mut self, event: ChangeEvent) -> DomainResult<Option<Group>> {
        match self.open.take() {
            None => {
                // An equal ts after a flush is the inclusive resume boundary,
                // only a strict decrease is a violation.
                if let Some(closed) = self.last_closed {
                    if event.ts < closed {
                        return Err(DomainError::StreamOrder {
                            current: closed,
                            observed: event.ts,
                        });
                    }
                }
                self.open = Some(Group::open(event));
                Ok(None)
            }
            Some(mut group) => {
                if event.ts == group.ts {
                    group.events.push(event);
                    self.open = Some(group);
                    Ok(None)
                } else if event.ts > group.ts {
                    self.last_closed = Some(group.ts);
                    self.open = Some(Group::open(event));
                    Ok(Some(group))
                } else {
                    let current = group.ts;
                    self.open = Some(group);
                    Err(DomainError::StreamOrder {
                        current,
                        observed: event.ts,
                    })
                }
            }
        }
    }

    /// Closes the open group when a poll comes back empty. A no-op while no
    /// group is open, so repeated idle polls flush at most once.
    pub fn flush_if_nonempty(&mut self) -> Option<Group> {
        let group = self.open.take()?;
        self.last_closed = Some(group.ts);
        Some(group)
    }

    /// Discards the open group without closing it. Used before
    /// re-subscribing: the feed redelivers from the committed watermark, so
    /// a partially accumulated group would otherwise double up.
    pub fn reset(&mut self) {
        self.open = None;
    }
}
