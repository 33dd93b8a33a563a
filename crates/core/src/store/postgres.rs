//! PostgreSQL entity store.
//!
//! All models share the `entities` table. Identity fields are columns, everything
//! else lives in the `content` JSONB column. Filters and sorts are compiled into SQL
//! with `sqlx::QueryBuilder`; relation paths become correlated `EXISTS` subqueries.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use document_service_query::compare::as_text;
use document_service_query::{Comparison, FilterNode, SortField, SortOrder};
use serde_json::{Map, Value};
use sqlx::postgres::Postgres;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, QueryBuilder, Transaction};
use tokio::sync::Mutex;

use super::populate::shape_entities;
use super::{EntityQueries, EntityQuery, EntityStore, StoreError, StoreResult, StoreTransaction};
use crate::document::model::{
    CREATED_AT, CREATED_BY, DOCUMENT_ID, ID, LOCALE, PUBLISHED_AT, UPDATED_AT, UPDATED_BY,
};
use crate::document::{Entity, EntityId, EntityPatch, NewEntity};
use crate::schema::{Attribute, SchemaRegistry};

type Sql = QueryBuilder<'static, Postgres>;

const RETURNING: &str = "id, document_id, locale, published_at, created_at, updated_at, \
    created_by, updated_by, content";

const SELECT: &str = "SELECT t0.id, t0.document_id, t0.locale, t0.published_at, t0.created_at, \
     t0.updated_at, t0.created_by, t0.updated_by, t0.content FROM entities t0 WHERE t0.uid = ";

#[derive(Debug, sqlx::FromRow)]
struct EntityRow {
    id: i64,
    document_id: String,
    locale: Option<String>,
    published_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    created_by: Option<String>,
    updated_by: Option<String>,
    content: Json<Map<String, Value>>,
}

impl From<EntityRow> for Entity {
    fn from(row: EntityRow) -> Self {
        Entity {
            id: row.id,
            document_id: row.document_id,
            locale: row.locale,
            published_at: row.published_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            created_by: row.created_by,
            updated_by: row.updated_by,
            content: row.content.0,
        }
    }
}

/// JSON keys are embedded in SQL text, so only plain identifiers are accepted.
fn json_key(name: &str) -> StoreResult<&str> {
    let valid = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(StoreError::InvalidQuery(format!("invalid attribute name `{name}`")))
    }
}

fn like_pattern(pattern: &str, prefix: bool, suffix: bool) -> String {
    let escaped = pattern
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!(
        "{}{escaped}{}",
        if prefix { "%" } else { "" },
        if suffix { "%" } else { "" }
    )
}

fn expect_id(value: &Value) -> StoreResult<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| StoreError::InvalidQuery(format!("expected a row id, got {value}")))
}

fn expect_text(value: &Value) -> StoreResult<String> {
    as_text(value)
        .ok_or_else(|| StoreError::InvalidQuery(format!("expected a string, got {value}")))
}

fn expect_timestamp(value: &Value) -> StoreResult<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .ok_or_else(|| {
            StoreError::InvalidQuery(format!("expected an RFC 3339 timestamp, got {value}"))
        })
}

#[derive(Debug, Clone, Copy)]
enum Level<'a> {
    /// Rows of a registered model.
    Model(&'a str),
    /// Elements of a JSON value; every field is a JSON key.
    Json,
}

enum Column {
    Id(String),
    Text(String),
    Timestamp(String),
    Json { alias: String, key: String },
}

fn column(level: Level<'_>, alias: &str, field: &str) -> StoreResult<Column> {
    if let Level::Model(_) = level {
        let name = match field {
            ID => return Ok(Column::Id(format!("{alias}.id"))),
            DOCUMENT_ID => Some("document_id"),
            LOCALE => Some("locale"),
            CREATED_BY => Some("created_by"),
            UPDATED_BY => Some("updated_by"),
            PUBLISHED_AT => return Ok(Column::Timestamp(format!("{alias}.published_at"))),
            CREATED_AT => return Ok(Column::Timestamp(format!("{alias}.created_at"))),
            UPDATED_AT => return Ok(Column::Timestamp(format!("{alias}.updated_at"))),
            _ => None,
        };
        if let Some(name) = name {
            return Ok(Column::Text(format!("{alias}.{name}")));
        }
    }
    Ok(Column::Json {
        alias: alias.to_string(),
        key: json_key(field)?.to_string(),
    })
}

/// Which link an attribute follows from a row of `level`.
#[derive(Debug, Clone, Copy)]
enum Link<'a> {
    /// The row stores the target ids.
    Owner(&'a str),
    /// The target rows store this row's id in `mapped_by`.
    Inverse { target: &'a str, mapped_by: &'a str },
    Json,
}

/// Compiles filters and sort keys into a `QueryBuilder`.
struct SqlCompiler<'s> {
    schema: &'s SchemaRegistry,
    aliases: usize,
}

impl<'s> SqlCompiler<'s> {
    fn new(schema: &'s SchemaRegistry) -> Self {
        Self { schema, aliases: 0 }
    }

    fn next_alias(&mut self) -> String {
        self.aliases += 1;
        format!("t{}", self.aliases)
    }

    fn link(&self, level: Level<'_>, attribute: &str) -> Link<'s> {
        let schema = self.schema;
        let Level::Model(uid) = level else {
            return Link::Json;
        };
        match schema.attribute(uid, attribute) {
            Some(Attribute::Relation(relation)) => match &relation.mapped_by {
                None => Link::Owner(&relation.target),
                Some(mapped_by) => Link::Inverse {
                    target: &relation.target,
                    mapped_by,
                },
            },
            Some(Attribute::Component(component)) => Link::Owner(&component.component),
            _ => Link::Json,
        }
    }

    /// `EXISTS`-style join condition from `alias` to `next` through `link`.
    fn push_join(
        &self,
        qb: &mut Sql,
        link: &Link<'_>,
        alias: &str,
        next: &str,
        attribute: &str,
    ) -> StoreResult<()> {
        match link {
            Link::Owner(target) => {
                qb.push(format!("{next}.uid = "));
                qb.push_bind(target.to_string());
                qb.push(format!(
                    " AND {alias}.content -> '{}' @> to_jsonb({next}.id)",
                    json_key(attribute)?
                ));
            }
            Link::Inverse { target, mapped_by } => {
                qb.push(format!("{next}.uid = "));
                qb.push_bind(target.to_string());
                qb.push(format!(
                    " AND {next}.content -> '{}' @> to_jsonb({alias}.id)",
                    json_key(mapped_by)?
                ));
            }
            Link::Json => {}
        }
        Ok(())
    }

    fn push_filter(
        &mut self,
        qb: &mut Sql,
        level: Level<'_>,
        alias: &str,
        node: &FilterNode,
    ) -> StoreResult<()> {
        match node {
            FilterNode::And(nodes) => self.push_group(qb, level, alias, nodes, " AND ", "TRUE"),
            FilterNode::Or(nodes) => self.push_group(qb, level, alias, nodes, " OR ", "FALSE"),
            FilterNode::Not(inner) => {
                qb.push("NOT (");
                self.push_filter(qb, level, alias, inner)?;
                qb.push(")");
                Ok(())
            }
            FilterNode::Field { field, op } => {
                // Comparisons never yield NULL so that `NOT` behaves like the memory store.
                qb.push("COALESCE((");
                push_comparison(qb, column(level, alias, field)?, op)?;
                qb.push("), FALSE)");
                Ok(())
            }
            FilterNode::Nested { attribute, node } => {
                let next = self.next_alias();
                match self.link(level, attribute) {
                    Link::Json => {
                        let key = json_key(attribute)?;
                        let expr = format!("{alias}.content -> '{key}'");
                        qb.push(format!(
                            "EXISTS (SELECT 1 FROM jsonb_array_elements(CASE jsonb_typeof({expr}) \
                             WHEN 'array' THEN {expr} WHEN 'object' THEN jsonb_build_array({expr}) \
                             ELSE '[]'::jsonb END) AS {next}(content) WHERE "
                        ));
                        self.push_filter(qb, Level::Json, &next, node)?;
                    }
                    link @ (Link::Owner(target) | Link::Inverse { target, .. }) => {
                        qb.push(format!("EXISTS (SELECT 1 FROM entities {next} WHERE "));
                        self.push_join(qb, &link, alias, &next, attribute)?;
                        qb.push(" AND ");
                        self.push_filter(qb, Level::Model(target), &next, node)?;
                    }
                }
                qb.push(")");
                Ok(())
            }
        }
    }

    fn push_group(
        &mut self,
        qb: &mut Sql,
        level: Level<'_>,
        alias: &str,
        nodes: &[FilterNode],
        separator: &str,
        empty: &str,
    ) -> StoreResult<()> {
        if nodes.is_empty() {
            qb.push(empty);
            return Ok(());
        }
        qb.push("(");
        for (i, node) in nodes.iter().enumerate() {
            if i > 0 {
                qb.push(separator);
            }
            self.push_filter(qb, level, alias, node)?;
        }
        qb.push(")");
        Ok(())
    }

    fn push_sort_key(
        &mut self,
        qb: &mut Sql,
        level: Level<'_>,
        alias: &str,
        path: &[String],
    ) -> StoreResult<()> {
        match path {
            [] => Err(StoreError::InvalidQuery("empty sort path".into())),
            [field] => {
                match column(level, alias, field)? {
                    Column::Id(col) | Column::Text(col) | Column::Timestamp(col) => qb.push(col),
                    Column::Json { alias, key } => qb.push(format!("{alias}.content -> '{key}'")),
                };
                Ok(())
            }
            [attribute, rest @ ..] => match self.link(level, attribute) {
                Link::Json => {
                    let keys = path
                        .iter()
                        .map(|key| json_key(key))
                        .collect::<StoreResult<Vec<_>>>()?;
                    qb.push(format!("{alias}.content #> '{{{}}}'", keys.join(",")));
                    Ok(())
                }
                link @ (Link::Owner(target) | Link::Inverse { target, .. }) => {
                    let next = self.next_alias();
                    qb.push("(SELECT ");
                    self.push_sort_key(qb, Level::Model(target), &next, rest)?;
                    qb.push(format!(" FROM entities {next} WHERE "));
                    self.push_join(qb, &link, alias, &next, attribute)?;
                    qb.push(format!(" ORDER BY {next}.id LIMIT 1)"));
                    Ok(())
                }
            },
        }
    }

    fn push_order_by(&mut self, qb: &mut Sql, uid: &str, sort: &[SortField]) -> StoreResult<()> {
        qb.push(" ORDER BY ");
        for field in sort {
            self.push_sort_key(qb, Level::Model(uid), "t0", &field.path)?;
            qb.push(match field.order {
                SortOrder::Asc => " ASC NULLS FIRST, ",
                SortOrder::Desc => " DESC NULLS LAST, ",
            });
        }
        qb.push("t0.id ASC");
        Ok(())
    }
}

fn push_comparison(qb: &mut Sql, column: Column, op: &Comparison) -> StoreResult<()> {
    match column {
        Column::Id(col) => push_id_comparison(qb, &col, op),
        Column::Text(col) => push_text_comparison(qb, &col, op),
        Column::Timestamp(col) => push_timestamp_comparison(qb, &col, op),
        Column::Json { alias, key } => push_json_comparison(qb, &alias, &key, op),
    }
}

fn ordering_operator(op: &Comparison) -> Option<(&'static str, &Value)> {
    match op {
        Comparison::Lt(v) => Some((" < ", v)),
        Comparison::Lte(v) => Some((" <= ", v)),
        Comparison::Gt(v) => Some((" > ", v)),
        Comparison::Gte(v) => Some((" >= ", v)),
        _ => None,
    }
}

fn unsupported(kind: &str, op: &Comparison) -> StoreError {
    StoreError::InvalidQuery(format!("{op:?} is not supported on {kind} fields"))
}

fn push_id_comparison(qb: &mut Sql, col: &str, op: &Comparison) -> StoreResult<()> {
    if let Some((operator, value)) = ordering_operator(op) {
        qb.push(col).push(operator).push_bind(expect_id(value)?);
        return Ok(());
    }
    match op {
        Comparison::Eq(v) => {
            qb.push(col).push(" = ").push_bind(expect_id(v)?);
        }
        Comparison::Ne(v) => {
            qb.push(col).push(" <> ").push_bind(expect_id(v)?);
        }
        Comparison::In(values) | Comparison::NotIn(values) => {
            let ids = values.iter().map(expect_id).collect::<StoreResult<Vec<_>>>()?;
            if matches!(op, Comparison::NotIn(_)) {
                qb.push("NOT ");
            }
            qb.push(col).push(" = ANY(").push_bind(ids).push(")");
        }
        Comparison::Null => {
            qb.push("FALSE");
        }
        Comparison::NotNull => {
            qb.push("TRUE");
        }
        other => return Err(unsupported("id", other)),
    }
    Ok(())
}

fn push_text_comparison(qb: &mut Sql, col: &str, op: &Comparison) -> StoreResult<()> {
    if let Some((operator, value)) = ordering_operator(op) {
        qb.push(col).push(operator).push_bind(expect_text(value)?);
        return Ok(());
    }
    match op {
        Comparison::Eq(Value::Null) | Comparison::Null => {
            qb.push(col).push(" IS NULL");
        }
        Comparison::Ne(Value::Null) | Comparison::NotNull => {
            qb.push(col).push(" IS NOT NULL");
        }
        Comparison::Eq(v) => {
            qb.push(col).push(" = ").push_bind(expect_text(v)?);
        }
        Comparison::Ne(v) => {
            qb.push(col).push(" IS DISTINCT FROM ").push_bind(expect_text(v)?);
        }
        Comparison::In(values) => {
            let texts = values.iter().map(expect_text).collect::<StoreResult<Vec<_>>>()?;
            qb.push(col).push(" = ANY(").push_bind(texts).push(")");
        }
        Comparison::NotIn(values) => {
            let texts = values.iter().map(expect_text).collect::<StoreResult<Vec<_>>>()?;
            qb.push(format!("{col} IS NULL OR NOT ({col} = ANY("))
                .push_bind(texts)
                .push("))");
        }
        Comparison::Contains(p) => {
            qb.push(col).push(" LIKE ").push_bind(like_pattern(p, true, true));
        }
        Comparison::ContainsInsensitive(p) => {
            qb.push(col).push(" ILIKE ").push_bind(like_pattern(p, true, true));
        }
        Comparison::NotContains(p) => {
            qb.push(format!("{col} IS NULL OR {col} NOT LIKE "))
                .push_bind(like_pattern(p, true, true));
        }
        Comparison::StartsWith(p) => {
            qb.push(col).push(" LIKE ").push_bind(like_pattern(p, false, true));
        }
        Comparison::EndsWith(p) => {
            qb.push(col).push(" LIKE ").push_bind(like_pattern(p, true, false));
        }
        other => return Err(unsupported("text", other)),
    }
    Ok(())
}

fn push_timestamp_comparison(qb: &mut Sql, col: &str, op: &Comparison) -> StoreResult<()> {
    if let Some((operator, value)) = ordering_operator(op) {
        qb.push(col).push(operator).push_bind(expect_timestamp(value)?);
        return Ok(());
    }
    match op {
        Comparison::Eq(Value::Null) | Comparison::Null => {
            qb.push(col).push(" IS NULL");
        }
        Comparison::Ne(Value::Null) | Comparison::NotNull => {
            qb.push(col).push(" IS NOT NULL");
        }
        Comparison::Eq(v) => {
            qb.push(col).push(" = ").push_bind(expect_timestamp(v)?);
        }
        Comparison::Ne(v) => {
            qb.push(col).push(" IS DISTINCT FROM ").push_bind(expect_timestamp(v)?);
        }
        Comparison::In(values) => {
            let ts = values.iter().map(expect_timestamp).collect::<StoreResult<Vec<_>>>()?;
            qb.push(col).push(" = ANY(").push_bind(ts).push(")");
        }
        Comparison::NotIn(values) => {
            let ts = values.iter().map(expect_timestamp).collect::<StoreResult<Vec<_>>>()?;
            qb.push(format!("{col} IS NULL OR NOT ({col} = ANY("))
                .push_bind(ts)
                .push("))");
        }
        other => return Err(unsupported("timestamp", other)),
    }
    Ok(())
}

fn push_json_equals(qb: &mut Sql, expr: &str, value: &Value) {
    match value {
        Value::Null => {
            qb.push(format!("({expr} IS NULL OR {expr} = 'null'::jsonb)"));
        }
        // Scalars also match arrays containing them.
        Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            qb.push(format!("{expr} @> ")).push_bind(Json(value.clone()));
        }
        Value::Array(_) | Value::Object(_) => {
            qb.push(format!("{expr} = ")).push_bind(Json(value.clone()));
        }
    }
}

fn push_json_comparison(qb: &mut Sql, alias: &str, key: &str, op: &Comparison) -> StoreResult<()> {
    let expr = format!("{alias}.content -> '{key}'");
    let text = format!("{alias}.content ->> '{key}'");

    if let Some((operator, value)) = ordering_operator(op) {
        match value {
            Value::Number(n) => {
                let bound = n
                    .as_f64()
                    .ok_or_else(|| StoreError::InvalidQuery(format!("invalid number {n}")))?;
                qb.push(format!("(jsonb_typeof({expr}) = 'number' AND ({expr})::float8{operator}"))
                    .push_bind(bound)
                    .push(")");
            }
            Value::String(s) => {
                qb.push(format!("{text}{operator}")).push_bind(s.clone());
            }
            other => {
                return Err(StoreError::InvalidQuery(format!(
                    "cannot order-compare `{key}` with {other}"
                )))
            }
        }
        return Ok(());
    }

    match op {
        Comparison::Eq(v) => push_json_equals(qb, &expr, v),
        Comparison::Ne(v) => {
            qb.push("NOT COALESCE((");
            push_json_equals(qb, &expr, v);
            qb.push("), FALSE)");
        }
        Comparison::In(values) | Comparison::NotIn(values) => {
            if matches!(op, Comparison::NotIn(_)) {
                qb.push("NOT ");
            }
            qb.push("COALESCE((");
            if values.is_empty() {
                qb.push("FALSE");
            }
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    qb.push(" OR ");
                }
                push_json_equals(qb, &expr, value);
            }
            qb.push("), FALSE)");
        }
        Comparison::Null => {
            qb.push(format!(
                "({expr} IS NULL OR {expr} = 'null'::jsonb OR {expr} = '[]'::jsonb)"
            ));
        }
        Comparison::NotNull => {
            qb.push(format!(
                "NOT ({expr} IS NULL OR {expr} = 'null'::jsonb OR {expr} = '[]'::jsonb)"
            ));
        }
        Comparison::Contains(p) => {
            qb.push(format!("{text} LIKE ")).push_bind(like_pattern(p, true, true));
        }
        Comparison::ContainsInsensitive(p) => {
            qb.push(format!("{text} ILIKE ")).push_bind(like_pattern(p, true, true));
        }
        Comparison::NotContains(p) => {
            qb.push(format!("{text} IS NULL OR {text} NOT LIKE "))
                .push_bind(like_pattern(p, true, true));
        }
        Comparison::StartsWith(p) => {
            qb.push(format!("{text} LIKE ")).push_bind(like_pattern(p, false, true));
        }
        Comparison::EndsWith(p) => {
            qb.push(format!("{text} LIKE ")).push_bind(like_pattern(p, true, false));
        }
        Comparison::Lt(_) | Comparison::Lte(_) | Comparison::Gt(_) | Comparison::Gte(_) => {}
    }
    Ok(())
}

fn push_where(
    compiler: &mut SqlCompiler<'_>,
    qb: &mut Sql,
    uid: &str,
    filter: Option<&FilterNode>,
) -> StoreResult<()> {
    qb.push_bind(uid.to_string());
    if let Some(node) = filter {
        qb.push(" AND ");
        compiler.push_filter(qb, Level::Model(uid), "t0", node)?;
    }
    Ok(())
}

fn select_query(schema: &SchemaRegistry, uid: &str, query: &EntityQuery) -> StoreResult<Sql> {
    schema.get_model(uid)?;
    let mut compiler = SqlCompiler::new(schema);
    let mut qb = QueryBuilder::new(SELECT);
    push_where(&mut compiler, &mut qb, uid, query.filter.as_ref())?;
    compiler.push_order_by(&mut qb, uid, &query.sort)?;
    if let Some(limit) = query.limit {
        qb.push(" LIMIT ").push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
    }
    if let Some(offset) = query.offset {
        qb.push(" OFFSET ").push_bind(i64::try_from(offset).unwrap_or(i64::MAX));
    }
    Ok(qb)
}

fn count_query(
    schema: &SchemaRegistry,
    uid: &str,
    filter: Option<&FilterNode>,
) -> StoreResult<Sql> {
    schema.get_model(uid)?;
    let mut compiler = SqlCompiler::new(schema);
    let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM entities t0 WHERE t0.uid = ");
    push_where(&mut compiler, &mut qb, uid, filter)?;
    Ok(qb)
}

fn delete_query(
    schema: &SchemaRegistry,
    uid: &str,
    filter: Option<&FilterNode>,
) -> StoreResult<Sql> {
    schema.get_model(uid)?;
    let mut compiler = SqlCompiler::new(schema);
    let mut qb = QueryBuilder::new("DELETE FROM entities AS t0 WHERE t0.uid = ");
    push_where(&mut compiler, &mut qb, uid, filter)?;
    Ok(qb)
}

fn insert_query(uid: &str, new: NewEntity) -> Sql {
    let created_at = new.created_at.unwrap_or_else(Utc::now);
    let mut qb = QueryBuilder::new(
        "INSERT INTO entities (uid, document_id, locale, published_at, created_at, updated_at, \
         created_by, updated_by, content) ",
    );
    qb.push_values(std::iter::once(new), |mut row, new| {
        row.push_bind(uid.to_string())
            .push_bind(new.document_id)
            .push_bind(new.locale)
            .push_bind(new.published_at)
            .push_bind(created_at)
            .push_bind(new.updated_at.unwrap_or(created_at))
            .push_bind(new.created_by)
            .push_bind(new.updated_by)
            .push_bind(Json(new.content));
    });
    qb.push(format!(" RETURNING {RETURNING}"));
    qb
}

fn update_query(uid: &str, id: EntityId, patch: EntityPatch) -> Sql {
    let mut qb = QueryBuilder::new("UPDATE entities SET content = content || ");
    qb.push_bind(Json(patch.content))
        .push(", updated_at = COALESCE(")
        .push_bind(patch.updated_at)
        .push(", updated_at), updated_by = COALESCE(")
        .push_bind(patch.updated_by)
        .push(", updated_by) WHERE uid = ")
        .push_bind(uid.to_string())
        .push(" AND id = ")
        .push_bind(id)
        .push(format!(" RETURNING {RETURNING}"));
    qb
}

fn delete_one_query(uid: &str, id: EntityId) -> Sql {
    let mut qb = QueryBuilder::new("DELETE FROM entities WHERE uid = ");
    qb.push_bind(uid.to_string())
        .push(" AND id = ")
        .push_bind(id)
        .push(format!(" RETURNING {RETURNING}"));
    qb
}

fn not_found(uid: &str, id: EntityId) -> StoreError {
    StoreError::NotFound {
        uid: uid.to_string(),
        id,
    }
}

/// Entity store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgEntityStore {
    pool: PgPool,
    schema: Arc<SchemaRegistry>,
}

impl PgEntityStore {
    pub fn new(pool: PgPool, schema: Arc<SchemaRegistry>) -> Self {
        Self { pool, schema }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EntityQueries for PgEntityStore {
    async fn find_many(&self, uid: &str, query: &EntityQuery) -> StoreResult<Vec<Entity>> {
        let mut qb = select_query(&self.schema, uid, query)?;
        let rows = qb.build_query_as::<EntityRow>().fetch_all(&self.pool).await?;
        let mut entities: Vec<Entity> = rows.into_iter().map(Entity::from).collect();
        shape_entities(self, &self.schema, uid, &mut entities, query).await?;
        Ok(entities)
    }

    async fn count(&self, uid: &str, filter: Option<&FilterNode>) -> StoreResult<u64> {
        let mut qb = count_query(&self.schema, uid, filter)?;
        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    async fn create(&self, uid: &str, entity: NewEntity) -> StoreResult<Entity> {
        self.schema.get_model(uid)?;
        let mut qb = insert_query(uid, entity);
        let row = qb.build_query_as::<EntityRow>().fetch_one(&self.pool).await?;
        Ok(row.into())
    }

    async fn update(&self, uid: &str, id: EntityId, patch: EntityPatch) -> StoreResult<Entity> {
        let mut qb = update_query(uid, id, patch);
        let row = qb.build_query_as::<EntityRow>().fetch_optional(&self.pool).await?;
        row.map(Entity::from).ok_or_else(|| not_found(uid, id))
    }

    async fn delete(&self, uid: &str, id: EntityId) -> StoreResult<Option<Entity>> {
        let mut qb = delete_one_query(uid, id);
        let row = qb.build_query_as::<EntityRow>().fetch_optional(&self.pool).await?;
        Ok(row.map(Entity::from))
    }

    async fn delete_many(&self, uid: &str, filter: Option<&FilterNode>) -> StoreResult<u64> {
        let mut qb = delete_query(&self.schema, uid, filter)?;
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction {
            schema: self.schema.clone(),
            tx: Mutex::new(Some(tx)),
        }))
    }

    fn as_queries(&self) -> &dyn EntityQueries {
        self
    }
}

/// A `sqlx` transaction. Dropping it without commit rolls back.
pub struct PgTransaction {
    schema: Arc<SchemaRegistry>,
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

fn active<'a>(
    slot: &'a mut Option<Transaction<'static, Postgres>>,
) -> StoreResult<&'a mut PgConnection> {
    slot.as_deref_mut()
        .ok_or_else(|| StoreError::Transaction("transaction already finished".into()))
}

#[async_trait]
impl EntityQueries for PgTransaction {
    async fn find_many(&self, uid: &str, query: &EntityQuery) -> StoreResult<Vec<Entity>> {
        let mut qb = select_query(&self.schema, uid, query)?;
        let rows = {
            let mut slot = self.tx.lock().await;
            qb.build_query_as::<EntityRow>().fetch_all(active(&mut slot)?).await?
        };
        let mut entities: Vec<Entity> = rows.into_iter().map(Entity::from).collect();
        shape_entities(self, &self.schema, uid, &mut entities, query).await?;
        Ok(entities)
    }

    async fn count(&self, uid: &str, filter: Option<&FilterNode>) -> StoreResult<u64> {
        let mut qb = count_query(&self.schema, uid, filter)?;
        let mut slot = self.tx.lock().await;
        let count: i64 = qb.build_query_scalar().fetch_one(active(&mut slot)?).await?;
        Ok(count as u64)
    }

    async fn create(&self, uid: &str, entity: NewEntity) -> StoreResult<Entity> {
        self.schema.get_model(uid)?;
        let mut qb = insert_query(uid, entity);
        let mut slot = self.tx.lock().await;
        let row = qb.build_query_as::<EntityRow>().fetch_one(active(&mut slot)?).await?;
        Ok(row.into())
    }

    async fn update(&self, uid: &str, id: EntityId, patch: EntityPatch) -> StoreResult<Entity> {
        let mut qb = update_query(uid, id, patch);
        let mut slot = self.tx.lock().await;
        let row = qb
            .build_query_as::<EntityRow>()
            .fetch_optional(active(&mut slot)?)
            .await?;
        row.map(Entity::from).ok_or_else(|| not_found(uid, id))
    }

    async fn delete(&self, uid: &str, id: EntityId) -> StoreResult<Option<Entity>> {
        let mut qb = delete_one_query(uid, id);
        let mut slot = self.tx.lock().await;
        let row = qb
            .build_query_as::<EntityRow>()
            .fetch_optional(active(&mut slot)?)
            .await?;
        Ok(row.map(Entity::from))
    }

    async fn delete_many(&self, uid: &str, filter: Option<&FilterNode>) -> StoreResult<u64> {
        let mut qb = delete_query(&self.schema, uid, filter)?;
        let mut slot = self.tx.lock().await;
        let result = qb.build().execute(active(&mut slot)?).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let tx = self.tx.into_inner();
        match tx {
            Some(tx) => Ok(tx.commit().await?),
            None => Err(StoreError::Transaction("transaction already finished".into())),
        }
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        let tx = self.tx.into_inner();
        match tx {
            Some(tx) => Ok(tx.rollback().await?),
            None => Err(StoreError::Transaction("transaction already finished".into())),
        }
    }

    fn as_queries(&self) -> &dyn EntityQueries {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> SchemaRegistry {
        SchemaRegistry::from_json(json!({
            "contentTypes": [
                {
                    "uid": "api::article.article",
                    "attributes": {
                        "title": {"type": "string"},
                        "views": {"type": "integer"},
                        "categories": {
                            "type": "relation",
                            "relation": "manyToMany",
                            "target": "api::category.category",
                            "inversedBy": "articles"
                        }
                    }
                },
                {
                    "uid": "api::category.category",
                    "attributes": {
                        "name": {"type": "string"},
                        "articles": {
                            "type": "relation",
                            "relation": "manyToMany",
                            "target": "api::article.article",
                            "mappedBy": "categories"
                        }
                    }
                }
            ]
        }))
        .unwrap()
    }

    fn sql(query: &EntityQuery) -> String {
        select_query(&schema(), "api::article.article", query)
            .unwrap()
            .sql()
            .to_string()
    }

    #[test]
    fn identity_fields_use_columns() {
        let query = EntityQuery::new()
            .filter(FilterNode::eq("documentId", "Article1"))
            .filter(FilterNode::is_null("publishedAt"))
            .filter(FilterNode::is_in("id", vec![json!(1), json!(2)]));
        let sql = sql(&query);
        assert!(sql.contains("t0.document_id = $2"));
        assert!(sql.contains("t0.published_at IS NULL"));
        assert!(sql.contains("t0.id = ANY($3)"));
        assert!(sql.ends_with("ORDER BY t0.id ASC"));
    }

    #[test]
    fn content_fields_use_jsonb() {
        let query = EntityQuery::new()
            .filter(FilterNode::field("views", Comparison::Gt(json!(10))))
            .filter(FilterNode::field("title", Comparison::ContainsInsensitive("hello".into())));
        let sql = sql(&query);
        assert!(sql.contains("(t0.content -> 'views')::float8 > $2"));
        assert!(sql.contains("t0.content ->> 'title' ILIKE $3"));
    }

    #[test]
    fn relation_filters_become_exists() {
        let query = EntityQuery::new().filter(FilterNode::nested(
            "categories",
            FilterNode::eq("name", "Cat1"),
        ));
        let sql = sql(&query);
        assert!(sql.contains("EXISTS (SELECT 1 FROM entities t1 WHERE t1.uid = $2"));
        assert!(sql.contains("t0.content -> 'categories' @> to_jsonb(t1.id)"));

        let inverse = select_query(
            &schema(),
            "api::category.category",
            &EntityQuery::new()
                .filter(FilterNode::nested("articles", FilterNode::eq("title", "x"))),
        )
        .unwrap();
        assert!(inverse.sql().contains("t1.content -> 'categories' @> to_jsonb(t0.id)"));
    }

    #[test]
    fn sort_and_pagination() {
        let query = EntityQuery::new()
            .sort(vec![SortField::desc("title"), SortField {
                path: vec!["categories".into(), "name".into()],
                order: SortOrder::Asc,
            }])
            .limit(10)
            .offset(20);
        let sql = sql(&query);
        assert!(sql.contains(
            "ORDER BY t0.content -> 'title' DESC NULLS LAST, (SELECT t1.content -> 'name'"
        ));
        assert!(sql.contains("LIMIT $3 OFFSET $4"));
    }

    #[test]
    fn finished_transactions_refuse_queries() {
        let mut slot: Option<Transaction<'static, Postgres>> = None;
        assert!(matches!(active(&mut slot), Err(StoreError::Transaction(_))));
    }

    #[test]
    fn oversized_windows_still_compile() {
        let query = EntityQuery::new().limit(u64::MAX).offset(u64::MAX);
        assert!(sql(&query).contains("LIMIT $2 OFFSET $3"));
    }

    #[test]
    fn rejects_unsafe_attribute_names() {
        let query = EntityQuery::new().filter(FilterNode::eq("title'; DROP", "x"));
        assert!(matches!(
            select_query(&schema(), "api::article.article", &query),
            Err(StoreError::InvalidQuery(_))
        ));
    }

    #[test]
    fn like_patterns_are_escaped() {
        assert_eq!(like_pattern("50%_off", true, true), "%50\\%\\_off%");
        assert_eq!(like_pattern("ab", false, true), "ab%");
    }
}
