//! Composite-to-member relation building.
//!
//! Composite units (modules, errata-like types) declare their members by
//! natural-key projections rather than by target ids: the members were
//! persisted by a different type's pipeline and their ids are unknown to
//! the composite's plugin. Matching happens in SQL over the persisted
//! member payloads with a single disjunctive predicate per composite, and
//! a whole batch of composites is linked in one transaction, rolled back
//! entirely on failure.

use std::collections::{HashMap, HashSet};

use sqlx::{Row, Sqlite, SqlitePool};
use tracing::{debug, warn};

use crate::error::{MigrationError, Result};
use crate::models::{MemberKey, MemberMatch};

/// Matched member: target id plus the key it satisfied.
struct MemberHit {
    unit_id: String,
    dedup_key: String,
}

/// Link a batch of composite units to the member units matching their
/// declared keys, in one transaction. Keys matching several persisted
/// rows resolve to the first row in insertion order; keys matching
/// nothing are reported and otherwise ignored. Returns the number of
/// relation rows written.
pub async fn relate_batch(
    pool: &SqlitePool,
    batch: &[(String, MemberMatch)],
) -> Result<u64> {
    let mut resolved: Vec<(&str, Vec<String>)> = Vec::with_capacity(batch.len());
    for (parent_unit_id, members) in batch {
        if members.keys.is_empty() {
            continue;
        }
        let children = resolve_members(pool, parent_unit_id, members).await?;
        resolved.push((parent_unit_id.as_str(), children));
    }
    if resolved.is_empty() {
        return Ok(0);
    }

    let mut tx = pool
        .begin()
        .await
        .map_err(MigrationError::RelationTransaction)?;
    let mut written = 0u64;
    for (parent_unit_id, children) in &resolved {
        for child_id in children {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO content_relations (parent_id, child_id)
                VALUES (?, ?)
                "#,
            )
            .bind(parent_unit_id)
            .bind(child_id)
            .execute(&mut *tx)
            .await
            .map_err(MigrationError::RelationTransaction)?;
            written += result.rows_affected();
        }
    }
    tx.commit().await.map_err(MigrationError::RelationTransaction)?;

    debug!(composites = resolved.len(), written, "related composite members");
    Ok(written)
}

/// Member unit ids for one composite, deduped first-encountered-wins.
async fn resolve_members(
    pool: &SqlitePool,
    parent_unit_id: &str,
    members: &MemberMatch,
) -> Result<Vec<String>> {
    let hits = find_members(pool, members).await?;

    // First-encountered wins: rows arrive in insertion order, so the
    // earliest persisted row claims its key and later duplicates drop.
    let mut claimed: HashMap<&str, &str> = HashMap::new();
    for hit in &hits {
        claimed
            .entry(hit.dedup_key.as_str())
            .or_insert(hit.unit_id.as_str());
    }

    let wanted: HashSet<String> = members.keys.iter().map(MemberKey::dedup_key).collect();
    for key in &wanted {
        if !claimed.contains_key(key.as_str()) {
            warn!(
                parent = parent_unit_id,
                member_type = %members.member_type_id,
                %key,
                "declared member not found in target store"
            );
        }
    }

    Ok(claimed.values().map(|id| id.to_string()).collect())
}

/// One round trip: a disjunction of per-key conjunctions over JSON
/// projections of the persisted member payloads, in insertion order.
async fn find_members(pool: &SqlitePool, members: &MemberMatch) -> Result<Vec<MemberHit>> {
    let mut qb = sqlx::QueryBuilder::<Sqlite>::new(
        "SELECT id, data_json FROM content_units WHERE content_type_id = ",
    );
    qb.push_bind(members.member_type_id.as_str());
    qb.push(" AND (");
    for (i, key) in members.keys.iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        qb.push("(");
        for (j, (field, value)) in key.fields.iter().enumerate() {
            if j > 0 {
                qb.push(" AND ");
            }
            qb.push("json_extract(data_json, ");
            qb.push_bind(format!("$.{field}"));
            qb.push(") = ");
            push_json_scalar(&mut qb, value);
        }
        qb.push(")");
    }
    qb.push(") ORDER BY rowid");

    let rows = qb.build().fetch_all(pool).await?;
    let mut hits = Vec::with_capacity(rows.len());
    for row in rows {
        let unit_id: String = row.get("id");
        let data: serde_json::Value = serde_json::from_str(&row.get::<String, _>("data_json"))?;
        // Project the stored payload back onto the key fields so that a
        // row satisfying several keys claims only the one it embodies.
        for key in &members.keys {
            if key
                .fields
                .iter()
                .all(|(field, value)| data.get(field) == Some(value))
            {
                hits.push(MemberHit {
                    unit_id: unit_id.clone(),
                    dedup_key: key.dedup_key(),
                });
                break;
            }
        }
    }
    Ok(hits)
}

/// json_extract yields SQL scalars, so bind likewise typed values.
fn push_json_scalar<'a>(
    qb: &mut sqlx::QueryBuilder<'a, Sqlite>,
    value: &'a serde_json::Value,
) {
    match value {
        serde_json::Value::String(s) => {
            qb.push_bind(s.as_str());
        }
        serde_json::Value::Number(n) if n.is_i64() => {
            qb.push_bind(n.as_i64().unwrap_or_default());
        }
        serde_json::Value::Bool(b) => {
            qb.push_bind(i64::from(*b));
        }
        other => {
            qb.push_bind(other.to_string());
        }
    }
}
