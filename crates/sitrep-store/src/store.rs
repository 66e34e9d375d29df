//! Store operations.
//!
//! Thread-safe: one SQLite connection behind a Mutex, shared across tasks
//! via `Arc<Store>`. Writes are durable once a method returns `Ok`.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;
use tracing::{debug, info};

use sitrep_core::types::{
    ClusterId, ClusterState, Event, EventId, EventKind, MessageRef, NormalizedMessage,
    SourceAuthority, SourceId, INITIAL_AUTHORITY,
};

use crate::db::init_db;
use crate::error::{Result, StoreError};

/// Outcome of [`Store::put_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    New,
    /// Already stored, either by `(source_id, message_id)` identity or by
    /// content hash within the dedup window. Dup messages never reach the
    /// extractor.
    Dup,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and prepare the schema.
    ///
    /// WAL journal with full synchronous mode: a successful write survives
    /// process crash and restart.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        // journal_mode returns the resulting mode as a row
        conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))?;
        conn.execute_batch("PRAGMA synchronous = FULL; PRAGMA foreign_keys = ON;")?;
        init_db(&conn)?;
        info!(path = %path.display(), "store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // --- messages ----------------------------------------------------------

    /// Record a normalized message.
    ///
    /// Idempotent on `(source_id, message_id)`; also rejects any message
    /// whose content hash was seen within the last `dedup_window_secs`.
    pub fn put_message(
        &self,
        msg: &NormalizedMessage,
        dedup_window_secs: i64,
    ) -> Result<PutOutcome> {
        let conn = self.conn.lock().unwrap();
        let cutoff = (msg.arrived_at - chrono::Duration::seconds(dedup_window_secs)).to_rfc3339();

        let hash_seen: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE hash = ?1 AND arrived_at >= ?2",
            params![msg.hash, cutoff],
            |row| row.get(0),
        )?;
        if hash_seen > 0 {
            debug!(source = %msg.source_id, message_id = msg.message_id, "duplicate content hash");
            return Ok(PutOutcome::Dup);
        }

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO messages (source_id, message_id, arrived_at, hash, text_norm)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                msg.source_id.as_str(),
                msg.message_id,
                msg.arrived_at.to_rfc3339(),
                msg.hash,
                msg.text_norm,
            ],
        )?;
        Ok(if inserted == 0 {
            PutOutcome::Dup
        } else {
            PutOutcome::New
        })
    }

    /// Delete message fingerprints older than `before`. Returns rows removed.
    pub fn prune_messages(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM messages WHERE arrived_at < ?1",
            [before.to_rfc3339()],
        )?;
        Ok(n)
    }

    // --- events ------------------------------------------------------------

    pub fn put_event(&self, event: &Event) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        insert_event(&tx, event)?;
        tx.commit()?;
        Ok(())
    }

    /// Persist a batch of events atomically — either every event of an
    /// extraction commits, or none do.
    pub fn put_events(&self, events: &[Event]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for event in events {
            insert_event(&tx, event)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Back-index an event into its cluster.
    pub fn assign_cluster(&self, event_id: &EventId, cluster_id: &ClusterId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE events SET cluster_id = ?1 WHERE event_id = ?2",
            params![cluster_id.as_str(), event_id.as_str()],
        )?;
        Ok(())
    }

    pub fn get_events_since(&self, since: DateTime<Utc>) -> Result<Vec<Event>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT event_id, kind, location, lat, lon, entities_json, message_refs_json,
                    time_hint, summary, confidence_self, created_at
             FROM events WHERE created_at >= ?1 ORDER BY created_at",
        )?;
        let rows: Vec<EventRow> = stmt
            .query_map([since.to_rfc3339()], |row| {
                Ok((
                    row.get::<_, String>(0)?,         // event_id
                    row.get::<_, String>(1)?,         // kind
                    row.get::<_, String>(2)?,         // location
                    row.get::<_, Option<f64>>(3)?,    // lat
                    row.get::<_, Option<f64>>(4)?,    // lon
                    row.get::<_, String>(5)?,         // entities_json
                    row.get::<_, String>(6)?,         // message_refs_json
                    row.get::<_, Option<String>>(7)?, // time_hint
                    row.get::<_, String>(8)?,         // summary
                    row.get::<_, f64>(9)?,            // confidence_self
                    row.get::<_, String>(10)?,        // created_at
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;

        rows.into_iter().map(event_from_row).collect()
    }

    // --- clusters ----------------------------------------------------------

    pub fn put_cluster(
        &self,
        cluster_id: &ClusterId,
        state: ClusterState,
        first_seen: DateTime<Utc>,
        last_updated: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO clusters (cluster_id, state, first_seen, last_updated)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(cluster_id) DO UPDATE SET
               state = excluded.state, last_updated = excluded.last_updated",
            params![
                cluster_id.as_str(),
                state.to_string(),
                first_seen.to_rfc3339(),
                last_updated.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn set_cluster_state(
        &self,
        cluster_id: &ClusterId,
        state: ClusterState,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE clusters SET state = ?1, last_updated = ?2 WHERE cluster_id = ?3",
            params![state.to_string(), at.to_rfc3339(), cluster_id.as_str()],
        )?;
        Ok(())
    }

    pub fn cluster_state(&self, cluster_id: &ClusterId) -> Result<Option<ClusterState>> {
        let conn = self.conn.lock().unwrap();
        let state: Option<String> = conn
            .query_row(
                "SELECT state FROM clusters WHERE cluster_id = ?1",
                [cluster_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        state
            .map(|s| s.parse().map_err(StoreError::BadRow))
            .transpose()
    }

    // --- authority ---------------------------------------------------------

    /// Apply a clipped delta to a source's score, creating the row at the
    /// neutral prior if the source was never seen. Returns the new score.
    pub fn update_authority(&self, source_id: &SourceId, delta: f64) -> Result<f64> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT OR IGNORE INTO authority (source_id, score, corroborations, contradictions, last_update)
             VALUES (?1, ?2, 0, 0, ?3)",
            params![source_id.as_str(), INITIAL_AUTHORITY, now],
        )?;
        conn.execute(
            "UPDATE authority
             SET score = MAX(0.0, MIN(100.0, score + ?1)), last_update = ?2
             WHERE source_id = ?3",
            params![delta, now, source_id.as_str()],
        )?;
        let score = conn.query_row(
            "SELECT score FROM authority WHERE source_id = ?1",
            [source_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(score)
    }

    /// Write a full authority record (the ledger task owns the arithmetic).
    pub fn upsert_authority(&self, auth: &SourceAuthority) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO authority (source_id, score, corroborations, contradictions, last_update)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(source_id) DO UPDATE SET
               score = excluded.score,
               corroborations = excluded.corroborations,
               contradictions = excluded.contradictions,
               last_update = excluded.last_update",
            params![
                auth.source_id.as_str(),
                auth.score,
                auth.corroborations,
                auth.contradictions,
                auth.last_update.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn read_authority(&self, source_id: &SourceId) -> Result<Option<SourceAuthority>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT source_id, score, corroborations, contradictions, last_update
                 FROM authority WHERE source_id = ?1",
                [source_id.as_str()],
                authority_row,
            )
            .optional()?;
        row.map(authority_from_row).transpose()
    }

    pub fn read_all_authority(&self) -> Result<Vec<SourceAuthority>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT source_id, score, corroborations, contradictions, last_update
             FROM authority ORDER BY source_id",
        )?;
        let rows: Vec<AuthorityRow> = stmt
            .query_map([], authority_row)?
            .collect::<rusqlite::Result<_>>()?;
        rows.into_iter().map(authority_from_row).collect()
    }

    /// Highest-scoring sources, for the control bot's `/stats`.
    pub fn top_authorities(&self, limit: usize) -> Result<Vec<SourceAuthority>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT source_id, score, corroborations, contradictions, last_update
             FROM authority ORDER BY score DESC, source_id LIMIT ?1",
        )?;
        let rows: Vec<AuthorityRow> = stmt
            .query_map([limit as i64], authority_row)?
            .collect::<rusqlite::Result<_>>()?;
        rows.into_iter().map(authority_from_row).collect()
    }

    // --- emissions ---------------------------------------------------------

    pub fn record_emission(
        &self,
        cluster_id: &ClusterId,
        kind: &str,
        emitted_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO emissions (cluster_id, kind, emitted_at) VALUES (?1, ?2, ?3)",
            params![cluster_id.as_str(), kind, emitted_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn emissions_last_hour(&self, now: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let cutoff = (now - chrono::Duration::hours(1)).to_rfc3339();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM emissions WHERE emitted_at >= ?1",
            [cutoff],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

// --- row mapping -----------------------------------------------------------

type EventRow = (
    String,
    String,
    String,
    Option<f64>,
    Option<f64>,
    String,
    String,
    Option<String>,
    String,
    f64,
    String,
);

fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let entities_json = serde_json::to_string(&event.entities)?;
    let message_refs_json = serde_json::to_string(&event.message_refs)?;
    conn.execute(
        "INSERT OR REPLACE INTO events
           (event_id, cluster_id, kind, location, lat, lon, entities_json,
            message_refs_json, time_hint, summary, confidence_self, created_at)
         VALUES (?1, NULL, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            event.event_id.as_str(),
            event.kind.to_string(),
            event.location,
            event.coords.map(|c| c.0),
            event.coords.map(|c| c.1),
            entities_json,
            message_refs_json,
            event.time_hint.map(|t| t.to_rfc3339()),
            event.summary,
            event.confidence_self,
            event.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn event_from_row(row: EventRow) -> Result<Event> {
    let (
        event_id,
        kind,
        location,
        lat,
        lon,
        entities_json,
        message_refs_json,
        time_hint,
        summary,
        confidence_self,
        created_at,
    ) = row;

    let kind: EventKind = kind.parse().map_err(StoreError::BadRow)?;
    let entities: BTreeSet<String> = serde_json::from_str(&entities_json)?;
    let message_refs: Vec<MessageRef> = serde_json::from_str(&message_refs_json)?;
    let coords = match (lat, lon) {
        (Some(lat), Some(lon)) => Some((lat, lon)),
        _ => None,
    };

    Ok(Event {
        event_id: EventId(event_id),
        message_refs,
        kind,
        location,
        coords,
        entities,
        time_hint: time_hint.as_deref().map(parse_ts).transpose()?,
        summary,
        confidence_self,
        created_at: parse_ts(&created_at)?,
    })
}

type AuthorityRow = (String, f64, u32, u32, String);

fn authority_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuthorityRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn authority_from_row(row: AuthorityRow) -> Result<SourceAuthority> {
    let (source_id, score, corroborations, contradictions, last_update) = row;
    Ok(SourceAuthority {
        source_id: SourceId(source_id),
        score,
        corroborations,
        contradictions,
        last_update: parse_ts(&last_update)?,
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::BadRow(format!("timestamp {:?}: {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitrep_core::normalize::fingerprint;
    use sitrep_core::types::SourceClass;
    use tempfile::TempDir;

    const WINDOW: i64 = 6 * 3600;

    fn open_store(dir: &TempDir) -> Store {
        Store::open(&dir.path().join("sitrep.db")).unwrap()
    }

    fn msg(source: &str, id: i64, text: &str, arrived_at: DateTime<Utc>) -> NormalizedMessage {
        NormalizedMessage {
            source_id: SourceId::from(source),
            source_class: SourceClass::Arab,
            message_id: id,
            arrived_at,
            text_norm: text.to_string(),
            hash: fingerprint(text),
            lang_guess: sitrep_core::types::Lang::Latin,
            empty: text.is_empty(),
            reply_to: None,
        }
    }

    fn event(kind: EventKind, location: &str) -> Event {
        Event {
            event_id: EventId::new(),
            message_refs: vec![MessageRef {
                source_id: SourceId::from("alpha"),
                message_id: 7,
            }],
            kind,
            location: location.to_string(),
            coords: Some((31.5, 34.45)),
            entities: ["idf".to_string(), "hamas".to_string()].into_iter().collect(),
            time_hint: Some(Utc::now()),
            summary: "strike reported".to_string(),
            confidence_self: 0.8,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn put_message_is_idempotent_on_identity() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let now = Utc::now();
        let m = msg("alpha", 1, "explosion in gaza today", now);
        assert_eq!(store.put_message(&m, WINDOW).unwrap(), PutOutcome::New);
        assert_eq!(store.put_message(&m, WINDOW).unwrap(), PutOutcome::Dup);
    }

    #[test]
    fn same_hash_within_window_is_dup_across_message_ids() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let now = Utc::now();
        let a = msg("alpha", 1, "explosion in gaza today", now);
        let b = msg("alpha", 2, "explosion in gaza today", now + chrono::Duration::seconds(10));
        assert_eq!(store.put_message(&a, WINDOW).unwrap(), PutOutcome::New);
        assert_eq!(store.put_message(&b, WINDOW).unwrap(), PutOutcome::Dup);
    }

    #[test]
    fn same_hash_outside_window_is_new() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let now = Utc::now();
        let a = msg("alpha", 1, "daily checkpoint report", now);
        let b = msg(
            "alpha",
            2,
            "daily checkpoint report",
            now + chrono::Duration::seconds(WINDOW + 60),
        );
        assert_eq!(store.put_message(&a, WINDOW).unwrap(), PutOutcome::New);
        assert_eq!(store.put_message(&b, WINDOW).unwrap(), PutOutcome::New);
    }

    #[test]
    fn events_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let since = Utc::now() - chrono::Duration::minutes(1);
        let ev = event(EventKind::Strike, "Khan Younis");
        store.put_events(std::slice::from_ref(&ev)).unwrap();

        let got = store.get_events_since(since).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].event_id, ev.event_id);
        assert_eq!(got[0].kind, EventKind::Strike);
        assert_eq!(got[0].location, "Khan Younis");
        assert_eq!(got[0].entities, ev.entities);
        assert_eq!(got[0].message_refs, ev.message_refs);
        assert_eq!(got[0].coords, ev.coords);
    }

    #[test]
    fn writes_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        {
            let store = open_store(&dir);
            store
                .put_message(&msg("alpha", 1, "persists", now), WINDOW)
                .unwrap();
        }
        let store = open_store(&dir);
        // identity replay is still a dup after restart
        assert_eq!(
            store.put_message(&msg("alpha", 1, "persists", now), WINDOW).unwrap(),
            PutOutcome::Dup
        );
    }

    #[test]
    fn authority_delta_is_clipped() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let src = SourceId::from("alpha");
        assert_eq!(store.update_authority(&src, 1000.0).unwrap(), 100.0);
        assert_eq!(store.update_authority(&src, -1000.0).unwrap(), 0.0);
    }

    #[test]
    fn authority_starts_at_neutral_prior() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let src = SourceId::from("alpha");
        let score = store.update_authority(&src, 0.0).unwrap();
        assert_eq!(score, 50.0);
        let auth = store.read_authority(&src).unwrap().unwrap();
        assert_eq!(auth.score, 50.0);
        assert_eq!(auth.corroborations, 0);
    }

    #[test]
    fn top_authorities_orders_by_score() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.update_authority(&SourceId::from("low"), -10.0).unwrap();
        store.update_authority(&SourceId::from("high"), 30.0).unwrap();
        store.update_authority(&SourceId::from("mid"), 5.0).unwrap();
        let top = store.top_authorities(2).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].source_id.as_str(), "high");
        assert_eq!(top[1].source_id.as_str(), "mid");
    }

    #[test]
    fn cluster_state_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = ClusterId::new();
        let now = Utc::now();
        store.put_cluster(&id, ClusterState::Open, now, now).unwrap();
        assert_eq!(store.cluster_state(&id).unwrap(), Some(ClusterState::Open));
        store
            .set_cluster_state(&id, ClusterState::Emitted, now)
            .unwrap();
        assert_eq!(
            store.cluster_state(&id).unwrap(),
            Some(ClusterState::Emitted)
        );
    }

    #[test]
    fn emission_log_counts_last_hour() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let now = Utc::now();
        store
            .record_emission(&ClusterId::new(), "summary", now - chrono::Duration::hours(2))
            .unwrap();
        store
            .record_emission(&ClusterId::new(), "summary", now - chrono::Duration::minutes(5))
            .unwrap();
        store
            .record_emission(&ClusterId::new(), "retraction", now)
            .unwrap();
        assert_eq!(store.emissions_last_hour(now).unwrap(), 2);
    }

    #[test]
    fn prune_removes_old_fingerprints() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let now = Utc::now();
        store
            .put_message(&msg("alpha", 1, "old", now - chrono::Duration::hours(10)), WINDOW)
            .unwrap();
        store.put_message(&msg("alpha", 2, "new", now), WINDOW).unwrap();
        let removed = store.prune_messages(now - chrono::Duration::hours(6)).unwrap();
        assert_eq!(removed, 1);
    }
}
