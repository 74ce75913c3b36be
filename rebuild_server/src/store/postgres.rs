//! PostgreSQL store on diesel-async with a deadpool connection pool.
//!
//! State changes are single conditional `UPDATE ... WHERE state = $expected
//! RETURNING *` statements, so the row itself serializes racing writers.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Jsonb, Text};
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};

use super::{migration, validate_parents, Stats, Store};
use crate::error::StoreError;
use crate::models::artifact::ArtifactType;
use crate::models::build::{
    ArtifactBuild, BuildChangeset, BuildRecord, BuildState, BuildTransition, NewArtifactBuild,
    NewBuildRecord,
};
use crate::models::event::{
    Event, EventFilter, EventRecord, EventState, HandlerResult, NewEvent, NewEventRecord,
};
use crate::schema::{rebuild_artifact_builds, rebuild_event_dependencies, rebuild_events};

pub type PgPool = Pool<AsyncPgConnection>;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn connect(database_url: &str, max_size: usize) -> anyhow::Result<Self> {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder(manager)
            .max_size(max_size)
            .build()
            .map_err(|e| anyhow::anyhow!("diesel pool: {e}"))?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        migration::run_migration(&mut conn).await
    }

    async fn conn(&self) -> Result<Object<AsyncPgConnection>, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }
}

fn to_events(rows: Vec<EventRecord>) -> Result<Vec<Event>, StoreError> {
    rows.into_iter().map(Event::try_from).collect()
}

fn to_builds(rows: Vec<BuildRecord>) -> Result<Vec<ArtifactBuild>, StoreError> {
    rows.into_iter().map(ArtifactBuild::try_from).collect()
}

// ── Events ──

pub async fn create_event(
    conn: &mut AsyncPgConnection,
    new: &NewEvent,
) -> Result<(Event, bool), StoreError> {
    let inserted = diesel::insert_into(rebuild_events::table)
        .values(&NewEventRecord::from(new))
        .on_conflict(rebuild_events::message_id)
        .do_nothing()
        .returning(EventRecord::as_returning())
        .get_result::<EventRecord>(conn)
        .await
        .optional()?;

    if let Some(row) = inserted {
        return Ok((row.try_into()?, true));
    }

    let existing = rebuild_events::table
        .filter(rebuild_events::message_id.eq(&new.message_id))
        .select(EventRecord::as_select())
        .first::<EventRecord>(conn)
        .await?;
    Ok((existing.try_into()?, false))
}

pub async fn get_event(conn: &mut AsyncPgConnection, id: i64) -> Result<Option<Event>, StoreError> {
    rebuild_events::table
        .find(id)
        .select(EventRecord::as_select())
        .first::<EventRecord>(conn)
        .await
        .optional()?
        .map(Event::try_from)
        .transpose()
}

pub async fn find_events(
    conn: &mut AsyncPgConnection,
    filter: &EventFilter,
) -> Result<Vec<Event>, StoreError> {
    let mut query = rebuild_events::table
        .select(EventRecord::as_select())
        .order(rebuild_events::id.desc())
        .into_boxed();

    if let Some(key) = &filter.search_key {
        query = query.filter(rebuild_events::search_key.eq(key.clone()));
    }
    if let Some(state) = filter.state {
        query = query.filter(rebuild_events::state.eq(state.as_str()));
    }
    if let Some(event_type) = filter.event_type {
        query = query.filter(rebuild_events::event_type.eq(event_type.as_str()));
    }
    if let Some(nvr) = &filter.nvr {
        let ids = events_touching_nvr(conn, nvr).await?;
        query = query.filter(rebuild_events::id.eq_any(ids));
    }
    if let Some(limit) = filter.limit {
        query = query.limit(limit);
    }

    to_events(query.load::<EventRecord>(conn).await?)
}

async fn events_touching_nvr(
    conn: &mut AsyncPgConnection,
    nvr: &str,
) -> Result<Vec<i64>, StoreError> {
    let mut ids: BTreeSet<i64> = rebuild_artifact_builds::table
        .filter(rebuild_artifact_builds::original_nvr.eq(nvr))
        .select(rebuild_artifact_builds::event_id)
        .load::<i64>(conn)
        .await?
        .into_iter()
        .collect();
    ids.extend(
        rebuild_artifact_builds::table
            .filter(rebuild_artifact_builds::rebuilt_nvr.eq(nvr))
            .select(rebuild_artifact_builds::event_id)
            .load::<i64>(conn)
            .await?,
    );
    Ok(ids.into_iter().collect())
}

pub async fn update_event_state(
    conn: &mut AsyncPgConnection,
    id: i64,
    expected: EventState,
    state: EventState,
    reason: &str,
) -> Result<Option<Event>, StoreError> {
    let time_done = state.is_terminal().then(Utc::now);
    diesel::update(
        rebuild_events::table
            .filter(rebuild_events::id.eq(id))
            .filter(rebuild_events::state.eq(expected.as_str())),
    )
    .set((
        rebuild_events::state.eq(state.as_str()),
        rebuild_events::state_reason.eq(reason),
        rebuild_events::time_done.eq(time_done),
    ))
    .returning(EventRecord::as_returning())
    .get_result::<EventRecord>(conn)
    .await
    .optional()?
    .map(Event::try_from)
    .transpose()
}

pub async fn record_handler_result(
    conn: &mut AsyncPgConnection,
    id: i64,
    result: &HandlerResult,
) -> Result<(), StoreError> {
    let entry = serde_json::to_value(vec![result]).map_err(StoreError::corrupt)?;
    diesel::sql_query(
        "UPDATE rebuild_events SET handler_results = handler_results || $1 WHERE id = $2",
    )
    .bind::<Jsonb, _>(entry)
    .bind::<BigInt, _>(id)
    .execute(conn)
    .await?;
    Ok(())
}

// ── Event dependencies ──

pub async fn add_event_dependency(
    conn: &mut AsyncPgConnection,
    event_id: i64,
    depends_on: i64,
) -> Result<(), StoreError> {
    diesel::insert_into(rebuild_event_dependencies::table)
        .values((
            rebuild_event_dependencies::event_id.eq(event_id),
            rebuild_event_dependencies::depends_on_id.eq(depends_on),
        ))
        .on_conflict_do_nothing()
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn event_dependencies(
    conn: &mut AsyncPgConnection,
    event_id: i64,
) -> Result<Vec<i64>, StoreError> {
    Ok(rebuild_event_dependencies::table
        .filter(rebuild_event_dependencies::event_id.eq(event_id))
        .select(rebuild_event_dependencies::depends_on_id)
        .load::<i64>(conn)
        .await?)
}

pub async fn dependent_events(
    conn: &mut AsyncPgConnection,
    event_id: i64,
) -> Result<Vec<i64>, StoreError> {
    Ok(rebuild_event_dependencies::table
        .filter(rebuild_event_dependencies::depends_on_id.eq(event_id))
        .select(rebuild_event_dependencies::event_id)
        .load::<i64>(conn)
        .await?)
}

// ── Builds ──

pub async fn insert_builds(
    conn: &mut AsyncPgConnection,
    event_id: i64,
    builds: Vec<NewArtifactBuild>,
) -> Result<Vec<ArtifactBuild>, StoreError> {
    validate_parents(&builds)?;
    conn.transaction::<_, StoreError, _>(|conn| {
        async move {
            let mut ids: Vec<i64> = Vec::with_capacity(builds.len());
            let mut created = Vec::with_capacity(builds.len());
            for build in &builds {
                let dep_on_id = build.dep_on_index.map(|i| ids[i]);
                let row = diesel::insert_into(rebuild_artifact_builds::table)
                    .values(&NewBuildRecord::new(event_id, build, dep_on_id))
                    .returning(BuildRecord::as_returning())
                    .get_result::<BuildRecord>(conn)
                    .await?;
                ids.push(row.id);
                created.push(ArtifactBuild::try_from(row)?);
            }
            Ok(created)
        }
        .scope_boxed()
    })
    .await
}

pub async fn get_build(
    conn: &mut AsyncPgConnection,
    id: i64,
) -> Result<Option<ArtifactBuild>, StoreError> {
    rebuild_artifact_builds::table
        .find(id)
        .select(BuildRecord::as_select())
        .first::<BuildRecord>(conn)
        .await
        .optional()?
        .map(ArtifactBuild::try_from)
        .transpose()
}

pub async fn builds_for_event(
    conn: &mut AsyncPgConnection,
    event_id: i64,
) -> Result<Vec<ArtifactBuild>, StoreError> {
    to_builds(
        rebuild_artifact_builds::table
            .filter(rebuild_artifact_builds::event_id.eq(event_id))
            .order(rebuild_artifact_builds::id.asc())
            .select(BuildRecord::as_select())
            .load::<BuildRecord>(conn)
            .await?,
    )
}

pub async fn children_of(
    conn: &mut AsyncPgConnection,
    build_id: i64,
) -> Result<Vec<ArtifactBuild>, StoreError> {
    to_builds(
        rebuild_artifact_builds::table
            .filter(rebuild_artifact_builds::dep_on_id.eq(build_id))
            .order(rebuild_artifact_builds::id.asc())
            .select(BuildRecord::as_select())
            .load::<BuildRecord>(conn)
            .await?,
    )
}

pub async fn build_by_task_id(
    conn: &mut AsyncPgConnection,
    artifact_type: ArtifactType,
    task_id: &str,
) -> Result<Option<ArtifactBuild>, StoreError> {
    rebuild_artifact_builds::table
        .filter(rebuild_artifact_builds::artifact_type.eq(artifact_type.as_str()))
        .filter(rebuild_artifact_builds::task_id.eq(task_id))
        .order(rebuild_artifact_builds::id.desc())
        .select(BuildRecord::as_select())
        .first::<BuildRecord>(conn)
        .await
        .optional()?
        .map(ArtifactBuild::try_from)
        .transpose()
}

pub async fn active_builds_by_nvr(
    conn: &mut AsyncPgConnection,
    original_nvr: &str,
) -> Result<Vec<ArtifactBuild>, StoreError> {
    let terminal: Vec<&str> = BuildState::ALL
        .iter()
        .filter(|s| s.is_terminal())
        .map(|s| s.as_str())
        .collect();
    to_builds(
        rebuild_artifact_builds::table
            .filter(rebuild_artifact_builds::original_nvr.eq(original_nvr))
            .filter(rebuild_artifact_builds::state.ne_all(terminal))
            .select(BuildRecord::as_select())
            .load::<BuildRecord>(conn)
            .await?,
    )
}

pub async fn builds_submitted_before(
    conn: &mut AsyncPgConnection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<ArtifactBuild>, StoreError> {
    to_builds(
        rebuild_artifact_builds::table
            .filter(rebuild_artifact_builds::state.eq(BuildState::Build.as_str()))
            .filter(rebuild_artifact_builds::time_submitted.lt(cutoff))
            .select(BuildRecord::as_select())
            .load::<BuildRecord>(conn)
            .await?,
    )
}

pub async fn update_build(
    conn: &mut AsyncPgConnection,
    id: i64,
    expected: BuildState,
    transition: &BuildTransition,
) -> Result<Option<ArtifactBuild>, StoreError> {
    diesel::update(
        rebuild_artifact_builds::table
            .filter(rebuild_artifact_builds::id.eq(id))
            .filter(rebuild_artifact_builds::state.eq(expected.as_str())),
    )
    .set(&BuildChangeset::from(transition))
    .returning(BuildRecord::as_returning())
    .get_result::<BuildRecord>(conn)
    .await
    .optional()?
    .map(ArtifactBuild::try_from)
    .transpose()
}

// ── Stats ──

#[derive(Debug, QueryableByName)]
struct StateCount {
    #[diesel(sql_type = Text)]
    state: String,
    #[diesel(sql_type = BigInt)]
    count: i64,
}

async fn count_by_state(
    conn: &mut AsyncPgConnection,
    table: &str,
) -> Result<BTreeMap<String, i64>, StoreError> {
    let rows: Vec<StateCount> = diesel::sql_query(format!(
        "SELECT state, COUNT(*) AS count FROM {table} GROUP BY state"
    ))
    .load(conn)
    .await?;
    Ok(rows.into_iter().map(|r| (r.state, r.count)).collect())
}

pub async fn stats(conn: &mut AsyncPgConnection) -> Result<Stats, StoreError> {
    Ok(Stats {
        events: count_by_state(conn, "rebuild_events").await?,
        builds: count_by_state(conn, "rebuild_artifact_builds").await?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn create_event(&self, new: NewEvent) -> Result<(Event, bool), StoreError> {
        create_event(&mut *self.conn().await?, &new).await
    }

    async fn get_event(&self, id: i64) -> Result<Option<Event>, StoreError> {
        get_event(&mut *self.conn().await?, id).await
    }

    async fn find_events(&self, filter: &EventFilter) -> Result<Vec<Event>, StoreError> {
        find_events(&mut *self.conn().await?, filter).await
    }

    async fn update_event_state(
        &self,
        id: i64,
        expected: EventState,
        state: EventState,
        reason: &str,
    ) -> Result<Option<Event>, StoreError> {
        update_event_state(&mut *self.conn().await?, id, expected, state, reason).await
    }

    async fn record_handler_result(
        &self,
        id: i64,
        result: HandlerResult,
    ) -> Result<(), StoreError> {
        record_handler_result(&mut *self.conn().await?, id, &result).await
    }

    async fn add_event_dependency(
        &self,
        event_id: i64,
        depends_on: i64,
    ) -> Result<(), StoreError> {
        add_event_dependency(&mut *self.conn().await?, event_id, depends_on).await
    }

    async fn event_dependencies(&self, event_id: i64) -> Result<Vec<i64>, StoreError> {
        event_dependencies(&mut *self.conn().await?, event_id).await
    }

    async fn dependent_events(&self, event_id: i64) -> Result<Vec<i64>, StoreError> {
        dependent_events(&mut *self.conn().await?, event_id).await
    }

    async fn insert_builds(
        &self,
        event_id: i64,
        builds: Vec<NewArtifactBuild>,
    ) -> Result<Vec<ArtifactBuild>, StoreError> {
        insert_builds(&mut *self.conn().await?, event_id, builds).await
    }

    async fn get_build(&self, id: i64) -> Result<Option<ArtifactBuild>, StoreError> {
        get_build(&mut *self.conn().await?, id).await
    }

    async fn builds_for_event(&self, event_id: i64) -> Result<Vec<ArtifactBuild>, StoreError> {
        builds_for_event(&mut *self.conn().await?, event_id).await
    }

    async fn children_of(&self, build_id: i64) -> Result<Vec<ArtifactBuild>, StoreError> {
        children_of(&mut *self.conn().await?, build_id).await
    }

    async fn build_by_task_id(
        &self,
        artifact_type: ArtifactType,
        task_id: &str,
    ) -> Result<Option<ArtifactBuild>, StoreError> {
        build_by_task_id(&mut *self.conn().await?, artifact_type, task_id).await
    }

    async fn active_builds_by_nvr(
        &self,
        original_nvr: &str,
    ) -> Result<Vec<ArtifactBuild>, StoreError> {
        active_builds_by_nvr(&mut *self.conn().await?, original_nvr).await
    }

    async fn builds_submitted_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ArtifactBuild>, StoreError> {
        builds_submitted_before(&mut *self.conn().await?, cutoff).await
    }

    async fn update_build(
        &self,
        id: i64,
        expected: BuildState,
        transition: &BuildTransition,
    ) -> Result<Option<ArtifactBuild>, StoreError> {
        update_build(&mut *self.conn().await?, id, expected, transition).await
    }

    async fn stats(&self) -> Result<Stats, StoreError> {
        stats(&mut *self.conn().await?).await
    }
}
