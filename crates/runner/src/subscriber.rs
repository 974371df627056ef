use std::sync::atomic::{AtomicU64, Ordering};

use spacelink_client::{ClientEvent, EventPayload, EventSubscriber};
use spacelink_domain::{ConnectionState, EntityKind, Player};

/// Logs every event it receives and counts table changes.
#[derive(Debug, Default)]
pub struct LoggingSubscriber {
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
}

impl LoggingSubscriber {
    /// (inserts, updates, deletes) seen so far
    pub fn totals(&self) -> (u64, u64, u64) {
        (
            self.inserts.load(Ordering::Relaxed),
            self.updates.load(Ordering::Relaxed),
            self.deletes.load(Ordering::Relaxed),
        )
    }
}

impl EventSubscriber for LoggingSubscriber {
    fn on_event(&self, event: &ClientEvent) -> anyhow::Result<()> {
        match &event.payload {
            EventPayload::ConnectionLifecycle {
                previous,
                current,
                reason,
            } => {
                if *current == ConnectionState::Error {
                    tracing::warn!(
                        connection_id = %event.source,
                        from = %previous,
                        reason = reason.as_deref().unwrap_or(""),
                        "Connection failed"
                    );
                } else {
                    tracing::info!(
                        connection_id = %event.source,
                        from = %previous,
                        to = %current,
                        "Connection state changed"
                    );
                }
            }
            EventPayload::TableInsert(row) => {
                self.inserts.fetch_add(1, Ordering::Relaxed);
                if row.kind == EntityKind::Player {
                    let player: Player = row.decode()?;
                    tracing::info!(identity = %player.identity, name = %player.name, "Player joined");
                } else {
                    tracing::debug!(table = %row.table, "Row inserted");
                }
            }
            EventPayload::TableUpdate(update) => {
                self.updates.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(table = %update.table, "Row updated");
            }
            EventPayload::TableDelete(row) => {
                self.deletes.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(table = %row.table, "Row deleted");
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "runner-log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use spacelink_client::RowEvent;
    use spacelink_domain::ConnectionId;

    fn insert(table: &str, row: serde_json::Value) -> ClientEvent {
        ClientEvent::new(
            ConnectionId::new(),
            EventPayload::TableInsert(RowEvent {
                table: table.to_string(),
                kind: EntityKind::from_table_name(table),
                row,
            }),
        )
    }

    #[test]
    fn counts_table_changes() {
        let subscriber = LoggingSubscriber::default();
        subscriber
            .on_event(&insert("food", json!({"entity_id": 4})))
            .unwrap();
        subscriber
            .on_event(&ClientEvent::lifecycle(
                ConnectionId::new(),
                ConnectionState::Connected,
                ConnectionState::Subscribed,
                None,
            ))
            .unwrap();

        assert_eq!(subscriber.totals(), (1, 0, 0));
    }

    #[test]
    fn malformed_player_row_is_an_error() {
        let subscriber = LoggingSubscriber::default();
        let result = subscriber.on_event(&insert("player", json!({"name": "no identity"})));
        assert!(result.is_err());
    }
}
