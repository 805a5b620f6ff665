//! Entity resolution and chunk linking.
//!
//! Entities are shared across documents and created lazily on first
//! mention. Resolution is deterministic: among candidates sharing a name
//! or alias with the extraction, the one with the largest name overlap
//! wins, ties going to the oldest entity.

use anyhow::{Context, Result};
use sqlx::postgres::PgConnection;
use sqlx::Row;
use std::collections::HashSet;
use uuid::Uuid;

use crate::types::{EntityRecord, ExtractedEntity};

use super::DocumentStore;

impl DocumentStore {
    /// Find the best-matching existing entity for an extracted name + alias
    /// set, or `None` when no candidate shares any name. Runs on the given
    /// connection so callers can keep it inside a transaction.
    pub async fn resolve_entity(
        conn: &mut PgConnection,
        name: &str,
        aliases: &[String],
    ) -> Result<Option<EntityRecord>> {
        let mut all_names: Vec<String> = vec![name.to_string()];
        all_names.extend(aliases.iter().cloned());

        let rows = sqlx::query(
            r#"SELECT entity_id, name, aliases, entity_type, global_summary, created_at
               FROM entities
               WHERE name = ANY($1::text[]) OR aliases && $1::text[]
               ORDER BY created_at ASC"#,
        )
        .bind(&all_names)
        .fetch_all(&mut *conn)
        .await
        .context("entity candidate query failed")?;

        let candidates: Vec<EntityRecord> = rows
            .iter()
            .map(|row| {
                Ok(EntityRecord {
                    entity_id: row.try_get("entity_id")?,
                    name: row.try_get("name")?,
                    aliases: row.try_get("aliases")?,
                    entity_type: row.try_get("entity_type")?,
                    global_summary: row.try_get("global_summary")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<Result<_>>()?;

        let extracted: HashSet<&str> = all_names.iter().map(String::as_str).collect();
        Ok(pick_best_candidate(&extracted, candidates))
    }

    /// Resolve-or-create the entity, merge aliases, and upsert the
    /// (entity, chunk) link. The whole operation is one transaction.
    pub async fn link_entity_to_chunk(
        &self,
        chunk_id: Uuid,
        extracted: &ExtractedEntity,
    ) -> Result<()> {
        let mut tx = self.pool().begin().await.context("begin entity link")?;

        let entity_id = match Self::resolve_entity(&mut *tx, &extracted.name, &extracted.aliases)
            .await
            .context("entity resolution failed")?
        {
            Some(entity) => {
                // Alias union; write only when the set strictly grew.
                let existing: HashSet<&str> =
                    entity.aliases.iter().map(String::as_str).collect();
                let mut merged = entity.aliases.clone();
                for alias in &extracted.aliases {
                    if !existing.contains(alias.as_str()) {
                        merged.push(alias.clone());
                    }
                }
                if merged.len() > entity.aliases.len() {
                    sqlx::query("UPDATE entities SET aliases = $1 WHERE entity_id = $2")
                        .bind(&merged)
                        .bind(entity.entity_id)
                        .execute(&mut *tx)
                        .await
                        .context("alias merge failed")?;
                }
                entity.entity_id
            }
            None => {
                let row = sqlx::query(
                    r#"INSERT INTO entities (name, aliases, entity_type)
                       VALUES ($1, $2, $3) RETURNING entity_id"#,
                )
                .bind(&extracted.name)
                .bind(&extracted.aliases)
                .bind(&extracted.entity_type)
                .fetch_one(&mut *tx)
                .await
                .context("entity insert failed")?;
                row.try_get("entity_id")?
            }
        };

        sqlx::query(
            r#"INSERT INTO entity_links (entity_id, chunk_id, relevance_score)
               VALUES ($1, $2, $3)
               ON CONFLICT (entity_id, chunk_id) DO NOTHING"#,
        )
        .bind(entity_id)
        .bind(chunk_id)
        .bind(extracted.relevance.clamp(0.0, 1.0))
        .execute(&mut *tx)
        .await
        .context("entity link upsert failed")?;

        tx.commit().await.context("commit entity link")?;
        Ok(())
    }
}

/// Pick the candidate maximizing overlap between the extracted name set and
/// the candidate's {name} ∪ aliases. Candidates arrive ordered oldest
/// first, and only a strictly greater score displaces the current best, so
/// ties resolve to the oldest entity.
fn pick_best_candidate(
    extracted: &HashSet<&str>,
    candidates: Vec<EntityRecord>,
) -> Option<EntityRecord> {
    let mut best: Option<(usize, EntityRecord)> = None;

    for candidate in candidates {
        let mut names: HashSet<&str> = HashSet::new();
        names.insert(candidate.name.as_str());
        names.extend(candidate.aliases.iter().map(String::as_str));

        let score = names.intersection(extracted).count();
        if score == 0 {
            continue;
        }
        match &best {
            Some((best_score, _)) if score <= *best_score => {}
            _ => best = Some((score, candidate)),
        }
    }

    best.map(|(_, candidate)| candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn entity(name: &str, aliases: &[&str], created_secs: i64) -> EntityRecord {
        EntityRecord {
            entity_id: Uuid::new_v4(),
            name: name.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            entity_type: "CONCEPT".to_string(),
            global_summary: None,
            created_at: Utc.timestamp_opt(created_secs, 0).unwrap(),
        }
    }

    #[test]
    fn picks_candidate_with_largest_overlap() {
        let extracted: HashSet<&str> = ["Wudu", "Woudou", "Ablutions"].into_iter().collect();
        let weak = entity("Wudu", &[], 0);
        let strong = entity("Wudu", &["Woudou"], 10);

        let best = pick_best_candidate(&extracted, vec![weak, strong.clone()]).unwrap();
        assert_eq!(best.entity_id, strong.entity_id);
    }

    #[test]
    fn ties_go_to_oldest_candidate() {
        let extracted: HashSet<&str> = ["Miqat"].into_iter().collect();
        let oldest = entity("Miqat", &[], 0);
        let newer = entity("Miqat", &[], 100);

        // Candidates are fetched ordered by created_at ASC.
        let best = pick_best_candidate(&extracted, vec![oldest.clone(), newer]).unwrap();
        assert_eq!(best.entity_id, oldest.entity_id);
    }

    #[test]
    fn no_overlap_means_no_candidate() {
        let extracted: HashSet<&str> = ["Zakat"].into_iter().collect();
        let unrelated = entity("Hajj", &["Pilgrimage"], 0);
        assert!(pick_best_candidate(&extracted, vec![unrelated]).is_none());
    }

    #[test]
    fn alias_match_counts_toward_overlap() {
        let extracted: HashSet<&str> = ["Ablutions"].into_iter().collect();
        let by_alias = entity("Wudu", &["Ablutions", "Woudou"], 0);
        let best = pick_best_candidate(&extracted, vec![by_alias.clone()]).unwrap();
        assert_eq!(best.entity_id, by_alias.entity_id);
    }
}
