//! Builds parameterized INSERT, SELECT, UPDATE, DELETE from a resolved entity.
//! Identifiers come from descriptors only; values always travel as parameters.

use crate::config::{Association, Column, Entity, KeyPair, VERSION_COLUMN};
use crate::error::AppError;
use crate::sql::params::json_to_param;
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Quote identifier for PostgreSQL (safe: only from config).
pub fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Full qualified table name.
pub fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quoted(schema), quoted(table))
}

pub fn entity_table(entity: &Entity) -> String {
    qualified_table(&entity.schema_name, &entity.table_name)
}

#[derive(Debug, Default)]
pub struct QueryBuf {
    pub sql: String,
    /// Text values, `None` for NULL. Placeholders carry the cast.
    pub params: Vec<Option<String>>,
}

impl QueryBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_param(&mut self, v: Option<String>) -> usize {
        self.params.push(v);
        self.params.len()
    }

    /// Push a value and return its cast placeholder, e.g. `$3::integer`.
    pub fn placeholder(&mut self, column: &Column, v: Option<String>) -> String {
        let n = self.push_param(v);
        format!("${}::{}", n, column.ty.pg_cast())
    }
}

/// How an insert resolves a primary key conflict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictMode {
    /// Every non-key column takes the submitted row's value (missing cells take their default).
    Overwrite,
    /// Only the supplied columns are written.
    Merge,
    /// The stored row is returned untouched; used for references to immutable rows.
    Keep,
    /// Plain insert: an existing key is a unique violation.
    Reject,
}

/// SELECT list, prefixed with `alias` when given. Numeric is read back as text so any
/// precision survives decoding.
pub fn select_column_list(entity: &Entity, alias: Option<&str>) -> String {
    entity
        .columns
        .iter()
        .map(|c| {
            let q = quoted(&c.name);
            let expr = match alias {
                Some(a) => format!("{}.{}", a, q),
                None => q.clone(),
            };
            if c.ty == crate::config::ScalarType::Numeric {
                format!("{}::text AS {}", expr, q)
            } else if alias.is_some() {
                format!("{} AS {}", expr, q)
            } else {
                expr
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// `alias.pk1 = $n::t AND ...`. `pk` holds values already cast to each column's type.
pub fn pk_condition(q: &mut QueryBuf, entity: &Entity, alias: Option<&str>, pk: &[String]) -> String {
    entity
        .pk()
        .zip(pk)
        .map(|(c, v)| {
            let ph = q.placeholder(c, Some(v.clone()));
            match alias {
                Some(a) => format!("{}.{} = {}", a, quoted(&c.name), ph),
                None => format!("{} = {}", quoted(&c.name), ph),
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn check_attributes(entity: &Entity, row: &Map<String, Value>) -> Result<(), AppError> {
    match row.keys().find(|k| entity.column(k).is_none()) {
        Some(k) => Err(AppError::BadRequest(format!("{}: unknown attribute '{}'", entity.name, k))),
        None => Ok(()),
    }
}

/// Reject a row that leaves out a NOT NULL column the store cannot fill.
fn check_required(entity: &Entity, row: &Map<String, Value>) -> Result<(), AppError> {
    match entity
        .columns
        .iter()
        .find(|c| !c.nullable && !c.has_default && !row.contains_key(&c.name))
    {
        Some(c) => Err(AppError::BadRequest(format!("{}: missing required attribute '{}'", entity.name, c.name))),
        None => Ok(()),
    }
}

/// Key of a row that supplies every key column, cast to the key columns' types.
pub fn supplied_key(entity: &Entity, row: &Map<String, Value>) -> Result<Option<Vec<Option<String>>>, AppError> {
    if !entity.pk_columns.iter().all(|p| row.contains_key(p)) {
        return Ok(None);
    }
    entity
        .pk()
        .map(|c| json_to_param(c, row.get(&c.name).unwrap_or(&Value::Null)))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// Multi-row `INSERT ... ON CONFLICT (pk) DO UPDATE ... RETURNING`. Key columns are listed
/// only when some row supplies them; cells a row does not supply take DEFAULT. A key may
/// appear once per statement.
pub fn insert_rows(entity: &Entity, rows: &[Map<String, Value>], mode: ConflictMode) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new();
    let mut keys = HashSet::new();
    for row in rows {
        check_attributes(entity, row)?;
        if matches!(mode, ConflictMode::Overwrite | ConflictMode::Reject) {
            check_required(entity, row)?;
        }
        if let Some(key) = supplied_key(entity, row)? {
            if !keys.insert(key.clone()) {
                let shown: Vec<&str> = key.iter().map(|k| k.as_deref().unwrap_or("null")).collect();
                return Err(AppError::BadRequest(format!(
                    "{}: key {} appears more than once",
                    entity.name,
                    shown.join("_")
                )));
            }
        }
    }
    let supplied = |c: &Column| rows.iter().any(|r| r.contains_key(&c.name));
    let mut columns: Vec<&Column> = entity
        .columns
        .iter()
        .filter(|c| {
            if entity.is_pk(&c.name) {
                supplied(c)
            } else {
                mode == ConflictMode::Overwrite || supplied(c)
            }
        })
        .collect();
    if columns.is_empty() {
        // Nothing supplied: one all-default tuple per row.
        columns.extend(entity.pk().take(1));
    }
    let table = entity_table(entity);
    let returning = select_column_list(entity, None);

    let mut tuples = Vec::with_capacity(rows.len());
    for row in rows {
        let mut cells = Vec::with_capacity(columns.len());
        for c in &columns {
            match row.get(&c.name) {
                Some(v) => {
                    let v = json_to_param(c, v)?;
                    cells.push(q.placeholder(c, v));
                }
                None => cells.push("DEFAULT".to_string()),
            }
        }
        tuples.push(format!("({})", cells.join(", ")));
    }

    let sets: Vec<String> = match mode {
        ConflictMode::Keep | ConflictMode::Reject => Vec::new(),
        ConflictMode::Overwrite | ConflictMode::Merge => columns
            .iter()
            .filter(|c| !entity.is_pk(&c.name))
            .map(|c| format!("{0} = EXCLUDED.{0}", quoted(&c.name)))
            .collect(),
    };
    let sets = if sets.is_empty() {
        // Key-only rows: a no-op update still makes RETURNING yield the existing row.
        let pk0 = quoted(&entity.pk_columns[0]);
        format!("{0} = EXCLUDED.{0}", pk0)
    } else {
        sets.join(", ")
    };
    let on_conflict = match mode {
        ConflictMode::Reject => String::new(),
        _ => format!(
            " ON CONFLICT ({}) DO UPDATE SET {}",
            entity.pk_columns.iter().map(|p| quoted(p)).collect::<Vec<_>>().join(", "),
            sets
        ),
    };

    q.sql = format!(
        "INSERT INTO {} ({}) VALUES {}{} RETURNING {}",
        table,
        columns.iter().map(|c| quoted(&c.name)).collect::<Vec<_>>().join(", "),
        tuples.join(", "),
        on_conflict,
        returning
    );
    Ok(q)
}

/// SELECT one row by primary key.
pub fn select_by_pk(entity: &Entity, pk: &[String]) -> QueryBuf {
    let mut q = QueryBuf::new();
    let cond = pk_condition(&mut q, entity, None, pk);
    q.sql = format!(
        "SELECT {} FROM {} WHERE {}",
        select_column_list(entity, None),
        entity_table(entity),
        cond
    );
    q
}

/// UPDATE by primary key: SET only supplied non-key columns. Key columns in `data` are
/// ignored. Falls back to a plain SELECT when nothing is settable.
pub fn update_by_pk(entity: &Entity, pk: &[String], data: &Map<String, Value>) -> Result<QueryBuf, AppError> {
    check_attributes(entity, data)?;
    let mut q = QueryBuf::new();
    let mut sets = Vec::new();
    for c in &entity.columns {
        if entity.is_pk(&c.name) {
            continue;
        }
        let Some(v) = data.get(&c.name) else { continue };
        let v = json_to_param(c, v)?;
        let ph = q.placeholder(c, v);
        sets.push(format!("{} = {}", quoted(&c.name), ph));
    }
    if sets.is_empty() {
        return Ok(select_by_pk(entity, pk));
    }
    let cond = pk_condition(&mut q, entity, None, pk);
    q.sql = format!(
        "UPDATE {} SET {} WHERE {} RETURNING {}",
        entity_table(entity),
        sets.join(", "),
        cond,
        select_column_list(entity, None)
    );
    Ok(q)
}

/// DELETE by primary key.
pub fn delete_by_pk(entity: &Entity, pk: &[String]) -> QueryBuf {
    let mut q = QueryBuf::new();
    let cond = pk_condition(&mut q, entity, None, pk);
    q.sql = format!(
        "DELETE FROM {} WHERE {} RETURNING {}",
        entity_table(entity),
        cond,
        select_column_list(entity, None)
    );
    q
}

/// Link two persisted rows through an association table; linking twice is a no-op.
pub fn insert_association(
    association: &Association,
    source: &Entity,
    source_row: &Map<String, Value>,
    target: &Entity,
    target_row: &Map<String, Value>,
) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new();
    let mut cols = Vec::new();
    let mut cells = Vec::new();
    // source: local = source pk, remote = association column
    for kp in &association.source {
        let (c, v) = key_cell(source, source_row, &kp.local)?;
        cols.push(quoted(&kp.remote));
        cells.push(q.placeholder(c, v));
    }
    // target: local = association column, remote = target pk
    for kp in &association.target {
        let (c, v) = key_cell(target, target_row, &kp.remote)?;
        cols.push(quoted(&kp.local));
        cells.push(q.placeholder(c, v));
    }
    q.sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT DO NOTHING",
        qualified_table(&association.schema_name, &association.table_name),
        cols.join(", "),
        cells.join(", ")
    );
    Ok(q)
}

/// Highest stored version among rows sharing every other key value of `pk`.
pub fn latest_version(entity: &Entity, pk: &[String]) -> QueryBuf {
    let mut q = QueryBuf::new();
    let conds: Vec<String> = entity
        .pk()
        .zip(pk)
        .filter(|(c, _)| c.name != VERSION_COLUMN)
        .map(|(c, v)| {
            let ph = q.placeholder(c, Some(v.clone()));
            format!("{} = {}", quoted(&c.name), ph)
        })
        .collect();
    let filter = if conds.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conds.join(" AND "))
    };
    q.sql = format!(
        "SELECT MAX({})::bigint FROM {}{}",
        quoted(VERSION_COLUMN),
        entity_table(entity),
        filter
    );
    q
}

/// Give `to` every association link `from` has.
pub fn copy_associations(
    association: &Association,
    source: &Entity,
    from: &Map<String, Value>,
    to: &Map<String, Value>,
) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new();
    let mut cols = Vec::new();
    let mut picked = Vec::new();
    let mut conds = Vec::new();
    for kp in &association.source {
        let (c, v) = key_cell(source, to, &kp.local)?;
        cols.push(quoted(&kp.remote));
        picked.push(q.placeholder(c, v));
    }
    for kp in &association.target {
        cols.push(quoted(&kp.local));
        picked.push(quoted(&kp.local));
    }
    for kp in &association.source {
        let (c, v) = key_cell(source, from, &kp.local)?;
        conds.push(format!("{} = {}", quoted(&kp.remote), q.placeholder(c, v)));
    }
    let table = qualified_table(&association.schema_name, &association.table_name);
    q.sql = format!(
        "INSERT INTO {} ({}) SELECT {} FROM {} WHERE {} ON CONFLICT DO NOTHING",
        table,
        cols.join(", "),
        picked.join(", "),
        table,
        conds.join(" AND ")
    );
    Ok(q)
}

/// Move the `child` rows referencing `from` over to `to`. `pairs` run from the parent
/// key (local) to the child's foreign key (remote).
pub fn repoint_children(
    child: &Entity,
    pairs: &[KeyPair],
    from: &Map<String, Value>,
    to: &Map<String, Value>,
) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new();
    let mut sets = Vec::new();
    let mut conds = Vec::new();
    for kp in pairs {
        let c = child
            .column(&kp.remote)
            .ok_or_else(|| AppError::BadRequest(format!("{}: unknown key column '{}'", child.name, kp.remote)))?;
        let v = json_to_param(c, to.get(&kp.local).unwrap_or(&Value::Null))?;
        sets.push(format!("{} = {}", quoted(&c.name), q.placeholder(c, v)));
    }
    for kp in pairs {
        let c = child
            .column(&kp.remote)
            .ok_or_else(|| AppError::BadRequest(format!("{}: unknown key column '{}'", child.name, kp.remote)))?;
        let v = json_to_param(c, from.get(&kp.local).unwrap_or(&Value::Null))?;
        conds.push(format!("{} = {}", quoted(&c.name), q.placeholder(c, v)));
    }
    q.sql = format!(
        "UPDATE {} SET {} WHERE {}",
        entity_table(child),
        sets.join(", "),
        conds.join(" AND ")
    );
    Ok(q)
}

fn key_cell<'a>(entity: &'a Entity, row: &Map<String, Value>, name: &str) -> Result<(&'a Column, Option<String>), AppError> {
    let c = entity
        .column(name)
        .ok_or_else(|| AppError::BadRequest(format!("{}: unknown key column '{}'", entity.name, name)))?;
    let v = json_to_param(c, row.get(name).unwrap_or(&Value::Null))?;
    Ok((c, v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn quoting_doubles_quotes() {
        assert_eq!(quoted("a\"b"), "\"a\"\"b\"");
        assert_eq!(qualified_table("s", "t"), "\"s\".\"t\"");
    }

    #[test]
    fn overwrite_insert_lists_every_non_key_column() {
        let model = fixtures::model();
        let a = model.entity("A").unwrap();
        let q = insert_rows(a, &[obj(json!({"x": 1, "y": 2}))], ConflictMode::Overwrite).unwrap();
        assert!(q.sql.starts_with("INSERT INTO \"public\".\"a\" (\"x\", \"y\", \"id_c\") VALUES ($1::integer, $2::integer, DEFAULT)"), "{}", q.sql);
        assert!(q.sql.contains("ON CONFLICT (\"id\") DO UPDATE SET \"x\" = EXCLUDED.\"x\", \"y\" = EXCLUDED.\"y\", \"id_c\" = EXCLUDED.\"id_c\""));
        assert!(q.sql.ends_with("RETURNING \"id\", \"x\", \"y\", \"id_c\""));
        assert_eq!(q.params, vec![Some("1".into()), Some("2".into())]);
    }

    #[test]
    fn merge_insert_writes_only_supplied_columns() {
        let model = fixtures::model();
        let a = model.entity("A").unwrap();
        let q = insert_rows(a, &[obj(json!({"id": 4, "y": 9}))], ConflictMode::Merge).unwrap();
        assert!(q.sql.contains("(\"id\", \"y\") VALUES ($1::integer, $2::integer)"), "{}", q.sql);
        assert!(q.sql.contains("DO UPDATE SET \"y\" = EXCLUDED.\"y\" "));
    }

    #[test]
    fn batched_rows_fill_missing_cells_with_default() {
        let model = fixtures::model();
        let b = model.entity("B").unwrap();
        let rows = vec![obj(json!({"name": "bip"})), obj(json!({"id": 7, "name": "bap"}))];
        let q = insert_rows(b, &rows, ConflictMode::Overwrite).unwrap();
        assert!(q.sql.contains("VALUES (DEFAULT, $1::text), ($2::integer, $3::text)"), "{}", q.sql);
    }

    #[test]
    fn repeated_key_in_one_batch_is_rejected() {
        let model = fixtures::model();
        let secret = model.entity("Secret").unwrap();
        let rows = vec![obj(json!({"id": 1, "label": "a"})), obj(json!({"id": "1", "label": "b"}))];
        let err = insert_rows(secret, &rows, ConflictMode::Overwrite).unwrap_err();
        assert!(matches!(&err, AppError::BadRequest(m) if m.contains("key 1")), "{}", err);

        let rows = vec![obj(json!({"id": 1, "label": "a"})), obj(json!({"id": 2, "label": "b"}))];
        assert!(insert_rows(secret, &rows, ConflictMode::Overwrite).is_ok());
        let rows = vec![obj(json!({"name": "a"})), obj(json!({"name": "b"}))];
        assert!(insert_rows(model.entity("B").unwrap(), &rows, ConflictMode::Overwrite).is_ok());
    }

    #[test]
    fn missing_not_null_column_without_default_is_rejected() {
        let model = fixtures::model();
        let b = model.entity("B").unwrap();
        let err = insert_rows(b, &[obj(json!({}))], ConflictMode::Overwrite).unwrap_err();
        assert!(matches!(&err, AppError::BadRequest(m) if m.contains("'name'")), "{}", err);
        let secret = model.entity("Secret").unwrap();
        let err = insert_rows(secret, &[obj(json!({"label": "no key"}))], ConflictMode::Overwrite).unwrap_err();
        assert!(matches!(&err, AppError::BadRequest(m) if m.contains("'id'")), "{}", err);

        // serial keys fill themselves; merges only touch what is supplied
        assert!(insert_rows(b, &[obj(json!({"name": "ok"}))], ConflictMode::Overwrite).is_ok());
        assert!(insert_rows(b, &[obj(json!({"id": 3}))], ConflictMode::Merge).is_ok());
    }

    #[test]
    fn versioned_rows_insert_plainly_or_keep_the_stored_row() {
        let model = fixtures::model();
        let sample = model.entity("Sample").unwrap();
        let q = insert_rows(sample, &[obj(json!({"id": 3, "version": 2, "name": "s"}))], ConflictMode::Reject).unwrap();
        assert_eq!(
            q.sql,
            "INSERT INTO \"public\".\"sample\" (\"id\", \"name\", \"version\") VALUES ($1::integer, $2::text, $3::integer) \
             RETURNING \"id\", \"name\", \"version\""
        );
        let q = insert_rows(sample, &[obj(json!({"id": 3, "version": 2}))], ConflictMode::Keep).unwrap();
        assert!(
            q.sql.contains("ON CONFLICT (\"id\", \"version\") DO UPDATE SET \"id\" = EXCLUDED.\"id\" RETURNING"),
            "{}",
            q.sql
        );
    }

    #[test]
    fn latest_version_ignores_the_version_value() {
        let model = fixtures::model();
        let sample = model.entity("Sample").unwrap();
        let q = latest_version(sample, &["3".into(), "1".into()]);
        assert_eq!(q.sql, "SELECT MAX(\"version\")::bigint FROM \"public\".\"sample\" WHERE \"id\" = $1::integer");
        assert_eq!(q.params, vec![Some("3".into())]);
    }

    #[test]
    fn release_carries_links_and_children() {
        let model = fixtures::model();
        let sample = model.entity("Sample").unwrap();
        let old = obj(json!({"id": 3, "version": 1}));
        let new = obj(json!({"id": 3, "version": 2}));

        let crate::config::RelationshipKind::ManyToMany { association } = &sample.relationship("tags").unwrap().kind else {
            panic!("tags is many-to-many");
        };
        let q = copy_associations(association, sample, &old, &new).unwrap();
        assert_eq!(
            q.sql,
            "INSERT INTO \"public\".\"asso_sample_tag\" (\"sample_id\", \"sample_version\", \"tags_id\") \
             SELECT $1::integer, $2::integer, \"tags_id\" FROM \"public\".\"asso_sample_tag\" \
             WHERE \"sample_id\" = $3::integer AND \"sample_version\" = $4::integer ON CONFLICT DO NOTHING"
        );
        assert_eq!(q.params, vec![Some("3".into()), Some("2".into()), Some("3".into()), Some("1".into())]);

        let crate::config::RelationshipKind::OneToMany { pairs } = &sample.relationship("notes").unwrap().kind else {
            panic!("notes is one-to-many");
        };
        let note = model.entity("Note").unwrap();
        let q = repoint_children(note, pairs, &old, &new).unwrap();
        assert_eq!(
            q.sql,
            "UPDATE \"public\".\"note\" SET \"id_sample_id\" = $1::integer, \"id_sample_version\" = $2::integer \
             WHERE \"id_sample_id\" = $3::integer AND \"id_sample_version\" = $4::integer"
        );
        assert_eq!(q.params[1], Some("2".into()));
        assert_eq!(q.params[3], Some("1".into()));
    }

    #[test]
    fn unknown_attribute_is_input_error() {
        let model = fixtures::model();
        let b = model.entity("B").unwrap();
        let err = insert_rows(b, &[obj(json!({"nope": 1}))], ConflictMode::Overwrite).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn update_skips_key_columns() {
        let model = fixtures::model();
        let b = model.entity("B").unwrap();
        let q = update_by_pk(b, &["3".into()], &obj(json!({"id": 99, "name": "new"}))).unwrap();
        assert_eq!(
            q.sql,
            "UPDATE \"public\".\"b\" SET \"name\" = $1::text WHERE \"id\" = $2::integer RETURNING \"id\", \"name\""
        );
        assert_eq!(q.params, vec![Some("new".into()), Some("3".into())]);

        let q = update_by_pk(b, &["3".into()], &obj(json!({"id": 99}))).unwrap();
        assert!(q.sql.starts_with("SELECT"));
    }

    #[test]
    fn composite_key_conditions_follow_declared_order() {
        let model = fixtures::model();
        let pair = model.entity("Pair").unwrap();
        let q = delete_by_pk(pair, &["1".into(), "x_y".into()]);
        assert!(q.sql.contains("WHERE \"a\" = $1::integer AND \"b\" = $2::text"), "{}", q.sql);
    }

    #[test]
    fn association_insert_ignores_duplicates() {
        let model = fixtures::model();
        let a = model.entity("A").unwrap();
        let b = model.entity("B").unwrap();
        let crate::config::RelationshipKind::ManyToMany { association } = &a.relationship("bs").unwrap().kind else {
            panic!("bs is many-to-many");
        };
        let q = insert_association(association, a, &obj(json!({"id": 1})), b, &obj(json!({"id": 2}))).unwrap();
        assert_eq!(
            q.sql,
            "INSERT INTO \"public\".\"asso_a_b\" (\"a_id\", \"bs_id\") VALUES ($1::integer, $2::integer) ON CONFLICT DO NOTHING"
        );
    }
}
