//! # PostgreSQL Gateway
//!
//! [`PersistenceGateway`] over a `sqlx` connection pool. Schema lives in `migrations/`
//! and is applied with [`PgGateway::migrate`].
//!
//! Filters are rendered with `QueryBuilder` so every value is bound, never spliced.
//! State compare-and-swap is a single conditional `UPDATE ... WHERE state = ANY($n)`;
//! when it matches no row a follow-up read tells a missing row apart from a state
//! conflict.

use super::gateway::{
    GatewayError, GatewayResult, LinkedResourceFilter, PaginatedResult, Pagination,
    PersistenceGateway,
};
use crate::config::DatabaseConfig;
use crate::models::{
    Container, ContainerFilter, ContainerUpdate, EntityKey, Job, JobFilter, LinkDirection,
    LinkFilter, LinkedResource, NewContainer, NewJob, NewResource, NewResourceLink, Resource,
    ResourceFilter, ResourceLink, ResourceTag, ResourceUpdate, TagTarget,
};
use crate::state_machine::{ContainerState, ResourceState};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::error::ErrorKind;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

const CONTAINERS: &str = "cloudmgr_containers";
const RESOURCES: &str = "cloudmgr_resources";
const LINKS: &str = "cloudmgr_resource_links";

#[derive(Clone)]
pub struct PgGateway {
    pool: PgPool,
}

impl PgGateway {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> GatewayResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> GatewayResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(sqlx::Error::from)?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> GatewayResult<bool> {
        let one: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(one == 1)
    }
}

fn db_error(err: sqlx::Error) -> GatewayError {
    if let sqlx::Error::Database(db) = &err {
        if matches!(
            db.kind(),
            ErrorKind::ForeignKeyViolation | ErrorKind::UniqueViolation | ErrorKind::NotNullViolation
        ) {
            return GatewayError::Constraint(db.message().to_string());
        }
    }
    GatewayError::Database(err)
}

fn page_bounds(page: Pagination) -> (i64, i64) {
    (
        i64::try_from(page.offset).unwrap_or(i64::MAX),
        i64::try_from(page.limit).unwrap_or(i64::MAX),
    )
}

fn push_key<'a>(qb: &mut QueryBuilder<'a, Postgres>, key: &EntityKey) {
    match key {
        EntityKey::Id(id) => qb.push(" WHERE id = ").push_bind(*id),
        EntityKey::Uuid(uuid) => qb.push(" WHERE uuid = ").push_bind(*uuid),
        EntityKey::Name(name) => qb.push(" WHERE name = ").push_bind(name.clone()),
    };
    qb.push(" ORDER BY id LIMIT 1");
}

fn push_container_filter<'a>(qb: &mut QueryBuilder<'a, Postgres>, filter: &ContainerFilter) {
    qb.push(" WHERE TRUE");
    if let Some(container_type) = &filter.container_type {
        qb.push(" AND container_type = ").push_bind(container_type.clone());
    }
    if let Some(category) = &filter.category {
        qb.push(" AND category = ").push_bind(category.clone());
    }
    if let Some(state) = filter.state {
        qb.push(" AND state = ").push_bind(state.as_str());
    }
    if let Some(name) = &filter.name {
        qb.push(" AND name = ").push_bind(name.clone());
    }
}

fn push_resource_filter<'a>(qb: &mut QueryBuilder<'a, Postgres>, filter: &ResourceFilter) {
    qb.push(" WHERE TRUE");
    if let Some(container_id) = filter.container_id {
        qb.push(" AND container_id = ").push_bind(container_id);
    }
    if let Some(parent_id) = filter.parent_id {
        qb.push(" AND parent_id = ").push_bind(parent_id);
    }
    if !filter.resource_types.is_empty() {
        qb.push(" AND resource_type = ANY(")
            .push_bind(filter.resource_types.clone())
            .push(")");
    }
    if let Some(ext_id) = &filter.ext_id {
        qb.push(" AND ext_id = ").push_bind(ext_id.clone());
    }
    if let Some(name) = &filter.name {
        qb.push(" AND name = ").push_bind(name.clone());
    }
    if let Some(state) = filter.state {
        qb.push(" AND state = ").push_bind(state.as_str());
    }
    if let Some(prefix) = &filter.objid_prefix {
        qb.push(" AND starts_with(objid, ").push_bind(prefix.clone()).push(")");
    }
    if !filter.include_deleted {
        qb.push(" AND expiry_date IS NULL");
    }
}

fn push_link_filter<'a>(qb: &mut QueryBuilder<'a, Postgres>, filter: &LinkFilter) {
    qb.push(" WHERE TRUE");
    if let Some(resource_id) = filter.resource_id {
        qb.push(" AND (start_resource_id = ")
            .push_bind(resource_id)
            .push(" OR end_resource_id = ")
            .push_bind(resource_id)
            .push(")");
    }
    if let Some(start) = filter.start_resource_id {
        qb.push(" AND start_resource_id = ").push_bind(start);
    }
    if let Some(end) = filter.end_resource_id {
        qb.push(" AND end_resource_id = ").push_bind(end);
    }
    if let Some(link_type) = &filter.link_type {
        qb.push(" AND link_type = ").push_bind(link_type.clone());
    }
}

fn push_job_filter<'a>(qb: &mut QueryBuilder<'a, Postgres>, filter: &JobFilter) {
    qb.push(" WHERE TRUE");
    if let Some(resource_id) = filter.resource_id {
        qb.push(" AND resource_id = ").push_bind(resource_id);
    }
    if let Some(container_id) = filter.container_id {
        qb.push(" AND container_id = ").push_bind(container_id);
    }
    if let Some(name) = &filter.name {
        qb.push(" AND name = ").push_bind(name.clone());
    }
}

fn push_page<'a>(qb: &mut QueryBuilder<'a, Postgres>, page: Pagination) {
    let (offset, limit) = page_bounds(page);
    qb.push(" ORDER BY id LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);
}

impl PgGateway {
    async fn paginated<T, F>(
        &self,
        table: &str,
        page: Pagination,
        push_filter: F,
    ) -> GatewayResult<PaginatedResult<T>>
    where
        T: for<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> + Send + Unpin,
        F: Fn(&mut QueryBuilder<'_, Postgres>),
    {
        let mut count = QueryBuilder::<Postgres>::new(format!("SELECT COUNT(*) FROM {table}"));
        push_filter(&mut count);
        let total: i64 = count
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;

        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT * FROM {table}"));
        push_filter(&mut select);
        push_page(&mut select, page);
        let items = select
            .build_query_as::<T>()
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(PaginatedResult {
            items,
            total: u64::try_from(total).unwrap_or(0),
            offset: page.offset,
            limit: page.limit,
        })
    }

    async fn current_state(&self, table: &str, id: i64) -> GatewayResult<Option<String>> {
        let state = sqlx::query_scalar::<_, String>(&format!("SELECT state FROM {table} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(state)
    }
}

#[async_trait]
impl PersistenceGateway for PgGateway {
    async fn add_container(&self, new: NewContainer) -> GatewayResult<Container> {
        sqlx::query_as::<_, Container>(
            r#"
            INSERT INTO cloudmgr_containers
                (uuid, objid, name, "desc", category, container_type, implementation_class,
                 connection, state, active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'PENDING', FALSE)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.objid)
        .bind(new.name)
        .bind(new.desc)
        .bind(new.category)
        .bind(new.container_type)
        .bind(new.implementation_class)
        .bind(new.connection)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn get_container(&self, key: &EntityKey) -> GatewayResult<Container> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT * FROM {CONTAINERS}"));
        push_key(&mut qb, key);
        qb.build_query_as::<Container>()
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or_else(|| GatewayError::not_found("container", key))
    }

    async fn list_containers(
        &self,
        filter: &ContainerFilter,
        page: Pagination,
    ) -> GatewayResult<PaginatedResult<Container>> {
        self.paginated(CONTAINERS, page, |qb| push_container_filter(qb, filter))
            .await
    }

    async fn update_container(
        &self,
        id: i64,
        update: ContainerUpdate,
    ) -> GatewayResult<Container> {
        sqlx::query_as::<_, Container>(
            r#"
            UPDATE cloudmgr_containers SET
                name = COALESCE($2, name),
                "desc" = COALESCE($3, "desc"),
                connection = COALESCE($4, connection),
                active = COALESCE($5, active),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(update.name)
        .bind(update.desc)
        .bind(update.connection)
        .bind(update.active)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or_else(|| GatewayError::not_found("container", id))
    }

    async fn set_container_state(
        &self,
        id: i64,
        state: ContainerState,
        last_error: Option<String>,
    ) -> GatewayResult<Container> {
        sqlx::query_as::<_, Container>(
            r#"
            UPDATE cloudmgr_containers
            SET state = $2, last_error = COALESCE($3, last_error), updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(state.as_str())
        .bind(last_error)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or_else(|| GatewayError::not_found("container", id))
    }

    async fn transition_container_state(
        &self,
        id: i64,
        allowed_from: &[ContainerState],
        to: ContainerState,
    ) -> GatewayResult<Container> {
        let allowed: Vec<String> = allowed_from.iter().map(ToString::to_string).collect();
        let updated = sqlx::query_as::<_, Container>(
            r#"
            UPDATE cloudmgr_containers SET state = $2, updated_at = NOW()
            WHERE id = $1 AND state = ANY($3)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(&allowed)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match updated {
            Some(container) => Ok(container),
            None => match self.current_state(CONTAINERS, id).await? {
                Some(current) => Err(GatewayError::StateConflict {
                    entity: "container",
                    id,
                    current,
                    expected: allowed,
                }),
                None => Err(GatewayError::not_found("container", id)),
            },
        }
    }

    async fn remove_container(&self, id: i64) -> GatewayResult<()> {
        let result = sqlx::query("DELETE FROM cloudmgr_containers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::not_found("container", id));
        }
        Ok(())
    }

    async fn add_resource(&self, new: NewResource) -> GatewayResult<Resource> {
        sqlx::query_as::<_, Resource>(
            r#"
            INSERT INTO cloudmgr_resources
                (uuid, objid, name, "desc", resource_type, implementation_class, container_id,
                 parent_id, ext_id, state, active, attribute)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.objid)
        .bind(new.name)
        .bind(new.desc)
        .bind(new.resource_type)
        .bind(new.implementation_class)
        .bind(new.container_id)
        .bind(new.parent_id)
        .bind(new.ext_id)
        .bind(new.state.as_str())
        .bind(new.active)
        .bind(new.attribute)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn get_resource(&self, key: &EntityKey) -> GatewayResult<Resource> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT * FROM {RESOURCES}"));
        push_key(&mut qb, key);
        qb.build_query_as::<Resource>()
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or_else(|| GatewayError::not_found("resource", key))
    }

    async fn get_resource_by_ext_id(
        &self,
        container_id: i64,
        ext_id: &str,
    ) -> GatewayResult<Resource> {
        sqlx::query_as::<_, Resource>(
            "SELECT * FROM cloudmgr_resources WHERE container_id = $1 AND ext_id = $2 ORDER BY id LIMIT 1",
        )
        .bind(container_id)
        .bind(ext_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or_else(|| GatewayError::not_found("resource", ext_id))
    }

    async fn list_resources(
        &self,
        filter: &ResourceFilter,
        page: Pagination,
    ) -> GatewayResult<PaginatedResult<Resource>> {
        self.paginated(RESOURCES, page, |qb| push_resource_filter(qb, filter))
            .await
    }

    async fn count_resources(&self, filter: &ResourceFilter) -> GatewayResult<u64> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT COUNT(*) FROM {RESOURCES}"));
        push_resource_filter(&mut qb, filter);
        let count: i64 = qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn update_resource(&self, id: i64, update: ResourceUpdate) -> GatewayResult<Resource> {
        sqlx::query_as::<_, Resource>(
            r#"
            UPDATE cloudmgr_resources SET
                name = COALESCE($2, name),
                "desc" = COALESCE($3, "desc"),
                ext_id = COALESCE($4, ext_id),
                attribute = COALESCE($5, attribute),
                active = COALESCE($6, active),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(update.name)
        .bind(update.desc)
        .bind(update.ext_id)
        .bind(update.attribute)
        .bind(update.active)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or_else(|| GatewayError::not_found("resource", id))
    }

    async fn set_resource_state(
        &self,
        id: i64,
        state: ResourceState,
        last_error: Option<String>,
    ) -> GatewayResult<Resource> {
        sqlx::query_as::<_, Resource>(
            r#"
            UPDATE cloudmgr_resources
            SET state = $2, last_error = COALESCE($3, last_error), updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(state.as_str())
        .bind(last_error)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or_else(|| GatewayError::not_found("resource", id))
    }

    async fn transition_resource_state(
        &self,
        id: i64,
        allowed_from: &[ResourceState],
        to: ResourceState,
    ) -> GatewayResult<Resource> {
        let allowed: Vec<String> = allowed_from.iter().map(ToString::to_string).collect();
        let updated = sqlx::query_as::<_, Resource>(
            r#"
            UPDATE cloudmgr_resources SET state = $2, updated_at = NOW()
            WHERE id = $1 AND state = ANY($3)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(&allowed)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match updated {
            Some(resource) => Ok(resource),
            None => match self.current_state(RESOURCES, id).await? {
                Some(current) => Err(GatewayError::StateConflict {
                    entity: "resource",
                    id,
                    current,
                    expected: allowed,
                }),
                None => Err(GatewayError::not_found("resource", id)),
            },
        }
    }

    async fn soft_delete_resource(&self, id: i64) -> GatewayResult<Resource> {
        sqlx::query_as::<_, Resource>(
            r#"
            UPDATE cloudmgr_resources
            SET state = 'DELETED', active = FALSE, expiry_date = NOW(), updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or_else(|| GatewayError::not_found("resource", id))
    }

    async fn remove_resource(&self, id: i64) -> GatewayResult<()> {
        let result = sqlx::query("DELETE FROM cloudmgr_resources WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::not_found("resource", id));
        }
        Ok(())
    }

    async fn add_link(&self, new: NewResourceLink) -> GatewayResult<ResourceLink> {
        sqlx::query_as::<_, ResourceLink>(
            r#"
            INSERT INTO cloudmgr_resource_links
                (uuid, objid, name, link_type, start_resource_id, end_resource_id, attributes)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.objid)
        .bind(new.name)
        .bind(new.link_type)
        .bind(new.start_resource_id)
        .bind(new.end_resource_id)
        .bind(new.attributes)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn get_link(&self, key: &EntityKey) -> GatewayResult<ResourceLink> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT * FROM {LINKS}"));
        push_key(&mut qb, key);
        qb.build_query_as::<ResourceLink>()
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or_else(|| GatewayError::not_found("link", key))
    }

    async fn list_links(
        &self,
        filter: &LinkFilter,
        page: Pagination,
    ) -> GatewayResult<PaginatedResult<ResourceLink>> {
        self.paginated(LINKS, page, |qb| push_link_filter(qb, filter))
            .await
    }

    async fn update_link_attributes(
        &self,
        id: i64,
        attributes: Value,
    ) -> GatewayResult<ResourceLink> {
        sqlx::query_as::<_, ResourceLink>(
            r#"
            UPDATE cloudmgr_resource_links SET attributes = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(attributes)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or_else(|| GatewayError::not_found("link", id))
    }

    async fn remove_link(&self, id: i64) -> GatewayResult<()> {
        let result = sqlx::query("DELETE FROM cloudmgr_resource_links WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::not_found("link", id));
        }
        Ok(())
    }

    async fn remove_links(&self, filter: &LinkFilter) -> GatewayResult<u64> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("DELETE FROM {LINKS}"));
        push_link_filter(&mut qb, filter);
        let result = qb.build().execute(&self.pool).await.map_err(db_error)?;
        Ok(result.rows_affected())
    }

    async fn list_linked_resources(
        &self,
        filter: &LinkedResourceFilter,
        page: Pagination,
    ) -> GatewayResult<PaginatedResult<LinkedResource>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT * FROM {LINKS} WHERE ("));
        match filter.direction {
            LinkDirection::Outgoing => {
                qb.push("start_resource_id = ANY(")
                    .push_bind(filter.origin_ids.clone())
                    .push(")");
            }
            LinkDirection::Incoming => {
                qb.push("end_resource_id = ANY(")
                    .push_bind(filter.origin_ids.clone())
                    .push(")");
            }
            LinkDirection::Both => {
                qb.push("start_resource_id = ANY(")
                    .push_bind(filter.origin_ids.clone())
                    .push(") OR end_resource_id = ANY(")
                    .push_bind(filter.origin_ids.clone())
                    .push(")");
            }
        }
        qb.push(")");
        if let Some(link_type) = &filter.link_type {
            qb.push(" AND link_type = ").push_bind(link_type.clone());
        }
        qb.push(" ORDER BY id");
        let links = qb
            .build_query_as::<ResourceLink>()
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        let mut hops = Vec::new();
        for link in links {
            if matches!(filter.direction, LinkDirection::Outgoing | LinkDirection::Both)
                && filter.origin_ids.contains(&link.start_resource_id)
            {
                hops.push((link.start_resource_id, link.end_resource_id, link.clone()));
            }
            if matches!(filter.direction, LinkDirection::Incoming | LinkDirection::Both)
                && filter.origin_ids.contains(&link.end_resource_id)
            {
                hops.push((link.end_resource_id, link.start_resource_id, link));
            }
        }

        let other_ids: Vec<i64> = hops.iter().map(|(_, other, _)| *other).collect();
        let mut rq = QueryBuilder::<Postgres>::new(format!("SELECT * FROM {RESOURCES} WHERE id = ANY("));
        rq.push_bind(other_ids).push(")");
        if !filter.resource_types.is_empty() {
            rq.push(" AND resource_type = ANY(")
                .push_bind(filter.resource_types.clone())
                .push(")");
        }
        let resources: HashMap<i64, Resource> = rq
            .build_query_as::<Resource>()
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?
            .into_iter()
            .map(|r| (r.id, r))
            .collect();

        let items = hops
            .into_iter()
            .filter_map(|(origin_id, other_id, link)| {
                resources.get(&other_id).map(|resource| LinkedResource {
                    link,
                    origin_id,
                    resource: resource.clone(),
                })
            })
            .collect();
        Ok(page.apply(items))
    }

    async fn add_tag(&self, value: &str) -> GatewayResult<ResourceTag> {
        sqlx::query_as::<_, ResourceTag>(
            r#"
            INSERT INTO cloudmgr_tags (value) VALUES ($1)
            ON CONFLICT (value) DO UPDATE SET value = EXCLUDED.value
            RETURNING *
            "#,
        )
        .bind(value)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn attach_tag(&self, target: TagTarget, tag_id: i64) -> GatewayResult<bool> {
        let sql = match target {
            TagTarget::Resource(_) => {
                "INSERT INTO cloudmgr_resource_tags (resource_id, tag_id) VALUES ($1, $2) ON CONFLICT DO NOTHING"
            }
            TagTarget::Link(_) => {
                "INSERT INTO cloudmgr_link_tags (link_id, tag_id) VALUES ($1, $2) ON CONFLICT DO NOTHING"
            }
        };
        let result = sqlx::query(sql)
            .bind(target.id())
            .bind(tag_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn detach_tag(&self, target: TagTarget, tag_id: i64) -> GatewayResult<bool> {
        let sql = match target {
            TagTarget::Resource(_) => {
                "DELETE FROM cloudmgr_resource_tags WHERE resource_id = $1 AND tag_id = $2"
            }
            TagTarget::Link(_) => "DELETE FROM cloudmgr_link_tags WHERE link_id = $1 AND tag_id = $2",
        };
        let result = sqlx::query(sql)
            .bind(target.id())
            .bind(tag_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_tags(&self, target: TagTarget) -> GatewayResult<Vec<ResourceTag>> {
        let sql = match target {
            TagTarget::Resource(_) => {
                r#"
                SELECT t.* FROM cloudmgr_tags t
                JOIN cloudmgr_resource_tags rt ON rt.tag_id = t.id
                WHERE rt.resource_id = $1 ORDER BY t.id
                "#
            }
            TagTarget::Link(_) => {
                r#"
                SELECT t.* FROM cloudmgr_tags t
                JOIN cloudmgr_link_tags lt ON lt.tag_id = t.id
                WHERE lt.link_id = $1 ORDER BY t.id
                "#
            }
        };
        sqlx::query_as::<_, ResourceTag>(sql)
            .bind(target.id())
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)
    }

    async fn add_job(&self, new: NewJob) -> GatewayResult<Job> {
        sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO cloudmgr_jobs (job_id, name, resource_id, container_id, params)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(new.job_id)
        .bind(new.name)
        .bind(new.resource_id)
        .bind(new.container_id)
        .bind(new.params)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn get_job(&self, job_id: &str) -> GatewayResult<Job> {
        sqlx::query_as::<_, Job>("SELECT * FROM cloudmgr_jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or_else(|| GatewayError::not_found("job", job_id))
    }

    async fn list_jobs(
        &self,
        filter: &JobFilter,
        page: Pagination,
    ) -> GatewayResult<PaginatedResult<Job>> {
        self.paginated("cloudmgr_jobs", page, |qb| push_job_filter(qb, filter))
            .await
    }
}
