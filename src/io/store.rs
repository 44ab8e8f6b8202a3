//! SQLite persistence for open state transitions and presence samples
//!
//! The `spacestate` table holds one row per raw state transition, keyed by
//! place; it is both written live (through the change gate) and read back in
//! full as the input of the statistics aggregation. The `devices` table holds
//! periodic device/people count samples.

use crate::domain::{epoch_secs, AppState, OpenValue, OpenValueTs, Place};
use crate::services::change_gate::{ChangeGate, FirstObservation};
use crate::services::event_bus::{EventBus, Topic};
use crate::services::history::StateRow;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (and create if missing) the database and ensure the schema.
    pub async fn connect(path: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS spacestate (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                state TEXT NOT NULL,
                place TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                devices INTEGER NOT NULL,
                people INTEGER NOT NULL,
                ts INTEGER NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await?;

        info!(path = %path, "store_opened");
        Ok(Self { pool })
    }

    /// The newest persisted state per place, used to seed the change gate so
    /// a restart does not re-insert the unchanged state.
    pub async fn last_open_states(&self) -> anyhow::Result<Vec<(Place, OpenValueTs)>> {
        let rows = sqlx::query(
            r#"
            SELECT a.place, a.state, a.timestamp FROM spacestate a
            INNER JOIN (SELECT place, MAX(id) AS id FROM spacestate GROUP BY place) m
            ON a.id = m.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut states = Vec::with_capacity(rows.len());
        for row in rows {
            let place_str: String = row.get("place");
            let state_str: String = row.get("state");
            let timestamp: i64 = row.get("timestamp");

            let Ok(place) = place_str.parse::<Place>() else {
                warn!(place = %place_str, "unknown_place_in_db");
                continue;
            };
            // `closing` never parses as raw input but does occur in rows
            let value = match remap_persisted_state(&state_str).parse::<OpenValue>() {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, place = %place, "invalid_state_in_db");
                    continue;
                }
            };

            states.push((place, OpenValueTs::new(value, timestamp)));
        }

        Ok(states)
    }

    /// Append one raw state transition row.
    pub async fn append_open_state(&self, place: Place, value: OpenValueTs) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO spacestate (state, place, timestamp) VALUES (?, ?, ?)")
            .bind(value.value.as_str())
            .bind(place.as_str())
            .bind(value.timestamp)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The complete chronological state log of the space place, as input for
    /// the statistics aggregation. Unparseable rows are skipped.
    pub async fn all_space_open_states(&self) -> anyhow::Result<Vec<StateRow>> {
        let rows = sqlx::query(
            "SELECT state, timestamp FROM spacestate WHERE place = ? ORDER BY id ASC",
        )
        .bind(Place::Space.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let state_str: String = row.get("state");
            let timestamp: i64 = row.get("timestamp");

            let Ok(value) = remap_persisted_state(&state_str).parse::<OpenValue>() else {
                debug!(value = %state_str, "ignoring_open_value_row");
                continue;
            };
            let Some(time) = DateTime::<Utc>::from_timestamp(timestamp, 0) else {
                debug!(timestamp, "ignoring_out_of_range_timestamp");
                continue;
            };

            result.push(StateRow { value, time });
        }

        Ok(result)
    }

    /// Append one device/people count sample.
    pub async fn sample_devices(&self, devices: i64, people: i64) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO devices (devices, people, ts) VALUES (?, ?, ?)")
            .bind(devices)
            .bind(people)
            .bind(epoch_secs())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Compatibility: `closing` was historically written as a distinct value but
/// is not a distinct interval boundary when reading the log back.
fn remap_persisted_state(state: &str) -> &str {
    if state == "closing" {
        "open"
    } else {
        state
    }
}

/// Subscribe the store to all open-state topics. A row is appended only when
/// the value actually changed from the last persisted one; the gate is seeded
/// from the newest row per place. The database write happens on a writer
/// task, decoupled from the emitting caller by a bounded channel.
pub async fn start_open_state_recorder(
    bus: &EventBus,
    state: Arc<AppState>,
    store: Arc<Store>,
) -> anyhow::Result<()> {
    let mut gate = ChangeGate::by_value(FirstObservation::Act);
    for (place, value) in store.last_open_states().await? {
        gate.seed(place.topic(), &value);
    }

    let (tx, mut rx) = mpsc::channel::<(Place, OpenValueTs)>(64);
    let gate = Arc::new(Mutex::new(gate));

    for topic in Topic::OPEN_STATE {
        let gate = Arc::clone(&gate);
        let state = Arc::clone(&state);
        let tx = tx.clone();
        bus.subscribe(topic, move |topic| {
            let Some(place) = topic.place() else { return };
            let value = state.open_for_place(place);

            if !gate.lock().should_act(topic, &value) {
                debug!(place = %place, "state_unchanged_skipping_insert");
                return;
            }

            info!(place = %place, state = %value.value, "persisting_open_state");
            if tx.try_send((place, value)).is_err() {
                warn!(place = %place, "state_write_queue_full");
            }
        });
    }

    tokio::spawn(async move {
        while let Some((place, value)) = rx.recv().await {
            if let Err(e) = store.append_open_state(place, value).await {
                error!(error = %e, place = %place, "open_state_insert_failed");
            }
        }
    });

    Ok(())
}

/// Periodically sample the current device/people counts into the devices
/// table. An interval of 0 disables sampling.
pub fn start_devices_sampler(
    store: Arc<Store>,
    state: Arc<AppState>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    if interval_secs == 0 {
        info!("devices_sampler_disabled");
        return;
    }

    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        // the first tick fires immediately; skip it so an empty startup state
        // is not sampled
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let devices = state.devices_snapshot();
                    if let Err(e) = store
                        .sample_devices(
                            i64::from(devices.data.device_count),
                            i64::from(devices.data.people_count),
                        )
                        .await
                    {
                        error!(error = %e, "devices_sample_failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("devices_sampler_shutdown");
                        return;
                    }
                }
            }
        }
    });
}
