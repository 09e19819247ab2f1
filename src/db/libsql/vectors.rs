//! EmbeddingStore implementation for LibSqlBackend.
//!
//! Vectors are stored as little-endian f32 blobs and searched with a brute
//! force L2 scan over one agent's rows. Agents publish at most a few hundred
//! posts a day, so the scan stays small.

use async_trait::async_trait;
use libsql::params;

use super::{LibSqlBackend, fmt_ts, get_text, get_ts};
use crate::db::{EmbeddingRecord, EmbeddingStore};
use crate::error::DatabaseError;

pub(crate) fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>, DatabaseError> {
    if bytes.len() % 4 != 0 {
        return Err(DatabaseError::Serialization(format!(
            "embedding blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[async_trait]
impl EmbeddingStore for LibSqlBackend {
    async fn save_embedding(&self, record: &EmbeddingRecord) -> Result<(), DatabaseError> {
        if record.vector.is_empty() {
            return Err(DatabaseError::MissingFields {
                entity: "embedding".to_string(),
                fields: "vector".to_string(),
            });
        }
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO embeddings (
                agent_id, item_id, text, dimension, vector, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.agent_id.as_str(),
                record.item_id.as_str(),
                record.text.as_str(),
                record.vector.len() as i64,
                libsql::Value::Blob(encode_vector(&record.vector)),
                fmt_ts(&record.created_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    async fn nearest_embeddings(
        &self,
        agent_id: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<EmbeddingRecord>, DatabaseError> {
        if k == 0 || vector.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT item_id, text, vector, created_at FROM embeddings \
                 WHERE agent_id = ?1 AND dimension = ?2",
                params![agent_id, vector.len() as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let mut scored: Vec<(f32, EmbeddingRecord)> = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            let blob: Vec<u8> = row
                .get(2)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
            let stored = decode_vector(&blob)?;
            let record = EmbeddingRecord {
                agent_id: agent_id.to_string(),
                item_id: get_text(&row, 0),
                text: get_text(&row, 1),
                created_at: get_ts(&row, 3),
                vector: stored,
            };
            scored.push((l2_distance(vector, &record.vector), record));
        }

        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(scored.into_iter().take(k).map(|(_, r)| r).collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::testing::test_db;

    fn record(agent: &str, id: &str, vector: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord {
            agent_id: agent.to_string(),
            item_id: id.to_string(),
            text: format!("text {id}"),
            vector,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn blob_codec_rejects_truncated_input() {
        let bytes = encode_vector(&[1.0, -2.5]);
        assert_eq!(decode_vector(&bytes).unwrap(), vec![1.0, -2.5]);
        assert!(decode_vector(&bytes[..5]).is_err());
    }

    #[tokio::test]
    async fn nearest_orders_by_distance_within_agent() {
        let (db, _dir) = test_db().await;
        db.save_embedding(&record("ava", "far", vec![0.0, 1.0])).await.unwrap();
        db.save_embedding(&record("ava", "near", vec![1.0, 0.1])).await.unwrap();
        db.save_embedding(&record("ava", "mid", vec![0.7, 0.7])).await.unwrap();
        db.save_embedding(&record("bob", "other", vec![1.0, 0.0])).await.unwrap();
        db.save_embedding(&record("ava", "wrong-dim", vec![1.0, 0.0, 0.0]))
            .await
            .unwrap();

        let nearest = db.nearest_embeddings("ava", &[1.0, 0.0], 2).await.unwrap();
        let ids: Vec<&str> = nearest.iter().map(|r| r.item_id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid"]);
    }

    #[tokio::test]
    async fn empty_vector_not_stored() {
        let (db, _dir) = test_db().await;
        assert!(db.save_embedding(&record("ava", "x", vec![])).await.is_err());
        assert!(db.nearest_embeddings("ava", &[], 5).await.unwrap().is_empty());
    }
}
