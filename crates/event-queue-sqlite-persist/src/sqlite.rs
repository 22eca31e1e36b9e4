//! SQLite-backed event queue.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use dispatch_types::{
    DestinationId, Event, EventId, ParkedChange, ParkedEvent, ParkedKind, QueueItem,
};
use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

use crate::{migrations, EventQueueStorage, QueueResult, QueueStorageError, StoreReport};

/// Capacity used when the caller does not configure one.
pub const DEFAULT_CAPACITY: usize = 100;

/// Persistent queue keeping one row per event and one row per pending
/// destination of that event.
pub struct SqliteEventQueue {
    conn: Connection,
    capacity: usize,
    expiration: Option<Duration>,
}

impl SqliteEventQueue {
    /// Open a queue database at the given path, running migrations if needed.
    pub fn open(path: &Path, capacity: usize) -> QueueResult<Self> {
        if capacity == 0 {
            return Err(QueueStorageError::InvalidCapacity(capacity));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
        ",
        )?;
        migrations::run_migrations(&conn)?;

        info!(path = %path.display(), capacity, "Opened event queue");
        Ok(Self {
            conn,
            capacity,
            expiration: None,
        })
    }

    /// Open an in-memory queue for testing.
    pub fn open_in_memory(capacity: usize) -> QueueResult<Self> {
        if capacity == 0 {
            return Err(QueueStorageError::InvalidCapacity(capacity));
        }
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn,
            capacity,
            expiration: None,
        })
    }

    /// Every stored item with its pending destinations, oldest first.
    pub fn items(&self) -> QueueResult<Vec<QueueItem>> {
        let mut destinations: BTreeMap<String, BTreeSet<DestinationId>> = BTreeMap::new();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT event_id, destination FROM queue_destinations")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (event_id, destination) = row?;
                destinations
                    .entry(event_id)
                    .or_default()
                    .insert(DestinationId::from_string(destination));
            }
        }

        let mut stmt = self.conn.prepare(
            "SELECT event_id, event_blob FROM queue_events ORDER BY timestamp_ms ASC, seq ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (event_id, blob) = row?;
            let event: Event = serde_json::from_str(&blob)?;
            items.push(QueueItem {
                event,
                destinations: destinations.remove(&event_id).unwrap_or_default(),
            });
        }
        Ok(items)
    }

    /// Events older than this timestamp are expired.
    fn expiry_cutoff(&self) -> Option<i64> {
        self.expiration.map(|ttl| {
            let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            Utc::now().timestamp_millis().saturating_sub(ttl_ms)
        })
    }
}

fn query_ids<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> QueueResult<Vec<EventId>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(params, |row| row.get::<_, String>(0))?
        .map(|row| row.map(EventId::from_string))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn delete_item(conn: &Connection, id: &EventId) -> QueueResult<bool> {
    conn.execute(
        "DELETE FROM queue_destinations WHERE event_id = ?1",
        params![id.as_str()],
    )?;
    let removed = conn.execute(
        "DELETE FROM queue_events WHERE event_id = ?1",
        params![id.as_str()],
    )?;
    Ok(removed > 0)
}

fn delete_items(conn: &Connection, ids: &[EventId]) -> QueueResult<()> {
    for id in ids {
        delete_item(conn, id)?;
    }
    Ok(())
}

fn purge_expired(conn: &Connection, cutoff: Option<i64>) -> QueueResult<Vec<EventId>> {
    let Some(cutoff) = cutoff else {
        return Ok(Vec::new());
    };
    let expired = query_ids(
        conn,
        "SELECT event_id FROM queue_events WHERE timestamp_ms < ?1 ORDER BY timestamp_ms ASC, seq ASC",
        params![cutoff],
    )?;
    delete_items(conn, &expired)?;
    Ok(expired)
}

fn evict_over_capacity(conn: &Connection, capacity: usize) -> QueueResult<Vec<EventId>> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM queue_events", [], |row| row.get(0))?;
    let capacity = i64::try_from(capacity).unwrap_or(i64::MAX);
    if count <= capacity {
        return Ok(Vec::new());
    }

    let evicted = query_ids(
        conn,
        "SELECT event_id FROM queue_events ORDER BY timestamp_ms ASC, seq ASC LIMIT ?1",
        params![count - capacity],
    )?;
    delete_items(conn, &evicted)?;
    Ok(evicted)
}

fn delete_orphans(conn: &Connection) -> QueueResult<Vec<EventId>> {
    let orphans = query_ids(
        conn,
        "SELECT e.event_id FROM queue_events e
         WHERE NOT EXISTS (SELECT 1 FROM queue_destinations d WHERE d.event_id = e.event_id)",
        [],
    )?;
    delete_items(conn, &orphans)?;
    Ok(orphans)
}

impl EventQueueStorage for SqliteEventQueue {
    fn store(
        &mut self,
        events: &[Event],
        destinations: &[DestinationId],
    ) -> QueueResult<StoreReport> {
        let destinations: BTreeSet<&DestinationId> = destinations.iter().collect();
        if events.is_empty() || destinations.is_empty() {
            return Ok(StoreReport::default());
        }

        let cutoff = self.expiry_cutoff();
        let tx = self.conn.transaction()?;
        let mut report = StoreReport::default();

        for event in events {
            let blob = serde_json::to_string(event)?;
            if delete_item(&tx, event.id())? {
                report.replaced.push(event.id().clone());
            }
            tx.execute(
                "INSERT INTO queue_events (event_id, event_blob, timestamp_ms) VALUES (?1, ?2, ?3)",
                params![event.id().as_str(), blob, event.timestamp_ms()],
            )?;
            for destination in &destinations {
                tx.execute(
                    "INSERT OR IGNORE INTO queue_destinations (event_id, destination) VALUES (?1, ?2)",
                    params![event.id().as_str(), destination.as_str()],
                )?;
            }
            report.stored += 1;
        }

        report.expired = purge_expired(&tx, cutoff)?;
        report.evicted = evict_over_capacity(&tx, self.capacity)?;
        tx.commit()?;

        if !report.evicted.is_empty() {
            warn!(
                evicted = report.evicted.len(),
                capacity = self.capacity,
                "Queue over capacity, evicted oldest events"
            );
        }
        debug!(
            stored = report.stored,
            destinations = destinations.len(),
            replaced = report.replaced.len(),
            expired = report.expired.len(),
            "Stored events"
        );
        Ok(report)
    }

    fn claim(
        &mut self,
        destination: &DestinationId,
        limit: usize,
        excluding: &HashSet<EventId>,
    ) -> QueueResult<Vec<Event>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let cutoff = self.expiry_cutoff().unwrap_or(i64::MIN);
        let mut stmt = self.conn.prepare_cached(
            "SELECT e.event_id, e.event_blob FROM queue_events e
             JOIN queue_destinations d ON d.event_id = e.event_id
             WHERE d.destination = ?1 AND e.timestamp_ms >= ?2
             ORDER BY e.timestamp_ms ASC, e.seq ASC",
        )?;
        let mut rows = stmt.query(params![destination.as_str(), cutoff])?;

        let mut claimed = Vec::new();
        while let Some(row) = rows.next()? {
            let event_id: String = row.get(0)?;
            if excluding.contains(&EventId::from_string(event_id.as_str())) {
                continue;
            }
            let blob: String = row.get(1)?;
            claimed.push(serde_json::from_str::<Event>(&blob)?);
            if claimed.len() >= limit {
                break;
            }
        }
        Ok(claimed)
    }

    fn release(&mut self, ids: &[EventId], destination: &DestinationId) -> QueueResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        let mut released = 0;
        for id in ids {
            released += tx.execute(
                "DELETE FROM queue_destinations WHERE event_id = ?1 AND destination = ?2",
                params![id.as_str(), destination.as_str()],
            )?;
            tx.execute(
                "DELETE FROM queue_events WHERE event_id = ?1
                 AND NOT EXISTS (SELECT 1 FROM queue_destinations d WHERE d.event_id = ?1)",
                params![id.as_str()],
            )?;
        }
        tx.commit()?;

        debug!(destination = %destination, released, "Released events");
        Ok(released)
    }

    fn resize(&mut self, capacity: usize) -> QueueResult<Vec<EventId>> {
        if capacity == 0 {
            return Err(QueueStorageError::InvalidCapacity(capacity));
        }
        self.capacity = capacity;

        let tx = self.conn.transaction()?;
        let evicted = evict_over_capacity(&tx, capacity)?;
        tx.commit()?;

        info!(capacity, evicted = evicted.len(), "Resized event queue");
        Ok(evicted)
    }

    fn set_expiration(&mut self, ttl: Option<Duration>) -> QueueResult<Vec<EventId>> {
        self.expiration = ttl;

        let cutoff = self.expiry_cutoff();
        let tx = self.conn.transaction()?;
        let expired = purge_expired(&tx, cutoff)?;
        tx.commit()?;

        info!(
            expiration_secs = ttl.map(|d| d.as_secs()),
            expired = expired.len(),
            "Updated event expiration"
        );
        Ok(expired)
    }

    fn delete_for_destinations_not_in(
        &mut self,
        allowed: &[DestinationId],
    ) -> QueueResult<Vec<EventId>> {
        let allowed: HashSet<&str> = allowed.iter().map(DestinationId::as_str).collect();
        let stale: Vec<DestinationId> = self
            .pending_destinations()?
            .into_iter()
            .filter(|destination| !allowed.contains(destination.as_str()))
            .collect();

        let tx = self.conn.transaction()?;
        for destination in &stale {
            let removed = tx.execute(
                "DELETE FROM queue_destinations WHERE destination = ?1",
                params![destination.as_str()],
            )?;
            info!(destination = %destination, removed, "Purged unknown destination");
        }
        let deleted = delete_orphans(&tx)?;
        tx.commit()?;

        Ok(deleted)
    }

    fn count(&self) -> QueueResult<usize> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM queue_events", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn count_for(&self, destination: &DestinationId) -> QueueResult<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM queue_destinations WHERE destination = ?1",
            params![destination.as_str()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn contains(&self, destination: &DestinationId, id: &EventId) -> QueueResult<bool> {
        let found: i64 = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM queue_destinations WHERE event_id = ?1 AND destination = ?2)",
            params![id.as_str(), destination.as_str()],
            |row| row.get(0),
        )?;
        Ok(found != 0)
    }

    fn pending_destinations(&self) -> QueueResult<BTreeSet<DestinationId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT destination FROM queue_destinations")?;
        let destinations = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|row| row.map(DestinationId::from_string))
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(destinations)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn apply_parked(&mut self, changes: &[ParkedChange]) -> QueueResult<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        for change in changes {
            match change {
                ParkedChange::Put(parked) => {
                    let blob = serde_json::to_string(&parked.event)?;
                    let processed = serde_json::to_string(&parked.processed)?;
                    tx.execute(
                        "INSERT INTO consent_parked (kind, event_id, event_blob, processed, refired)
                         VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT (kind, event_id) DO UPDATE SET
                            event_blob = excluded.event_blob,
                            processed = excluded.processed,
                            refired = excluded.refired",
                        params![
                            parked.kind.as_str(),
                            parked.event.id().as_str(),
                            blob,
                            processed,
                            parked.refired
                        ],
                    )?;
                }
                ParkedChange::Remove { kind, id } => {
                    tx.execute(
                        "DELETE FROM consent_parked WHERE kind = ?1 AND event_id = ?2",
                        params![kind.as_str(), id.as_str()],
                    )?;
                }
                ParkedChange::Clear(kind) => {
                    tx.execute(
                        "DELETE FROM consent_parked WHERE kind = ?1",
                        params![kind.as_str()],
                    )?;
                }
            }
        }
        tx.commit()?;

        debug!(changes = changes.len(), "Applied consent parked changes");
        Ok(())
    }

    fn parked(&self) -> QueueResult<Vec<ParkedEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT kind, event_blob, processed, refired FROM consent_parked ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u32>(3)?,
            ))
        })?;

        let mut parked = Vec::new();
        for row in rows {
            let (kind, blob, processed, refired) = row?;
            let kind = ParkedKind::parse(&kind)
                .ok_or_else(|| QueueStorageError::InvalidRow(format!("unknown parked kind {kind}")))?;
            parked.push(ParkedEvent {
                kind,
                event: serde_json::from_str(&blob)?,
                processed: serde_json::from_str(&processed)?,
                refired,
            });
        }
        Ok(parked)
    }
}
