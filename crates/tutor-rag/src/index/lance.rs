use anyhow::{Context, Result};
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use lancedb::query::{ExecutableQuery, QueryBase};
use std::sync::Arc;
use uuid::Uuid;

use super::IndexPoint;

/// Dense vector collection. One Lance table per environment, configured at
/// first write with the embedder dimension and cosine distance.
pub struct DenseIndex {
    db: lancedb::Connection,
    dimension: usize,
    table_name: String,
}

impl DenseIndex {
    pub async fn open(path: &str, collection: &str, dimension: usize) -> Result<Self> {
        std::fs::create_dir_all(path).ok();
        let db = lancedb::connect(path)
            .execute()
            .await
            .context("Failed to connect to dense index")?;

        let index = Self {
            db,
            dimension,
            table_name: collection.to_string(),
        };
        index.ensure_table().await?;
        Ok(index)
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("doc_id", DataType::Utf8, false),
            Field::new("search_text", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                true,
            ),
        ]))
    }

    fn vector_array(&self, flat: Vec<f32>) -> FixedSizeListArray {
        let values = Float32Array::from(flat);
        FixedSizeListArray::new(
            Arc::new(Field::new("item", DataType::Float32, true)),
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        )
    }

    async fn ensure_table(&self) -> Result<()> {
        let names = self.db.table_names().execute().await?;
        if names.contains(&self.table_name) {
            return Ok(());
        }

        // Lance infers the table schema from a first batch, so create with
        // a seed row and delete it.
        let schema = self.schema();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec!["__seed__"])) as Arc<dyn Array>,
                Arc::new(StringArray::from(vec!["__seed__"])),
                Arc::new(StringArray::from(vec![""])),
                Arc::new(self.vector_array(vec![0.0f32; self.dimension])) as Arc<dyn Array>,
            ],
        )
        .context("Failed to build seed batch")?;

        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        self.db
            .create_table(&self.table_name, Box::new(batches))
            .execute()
            .await
            .context("Failed to create dense index table")?;

        let table = self.db.open_table(&self.table_name).execute().await?;
        table.delete("id = '__seed__'").await.ok();
        Ok(())
    }

    /// Idempotent upsert by chunk id: existing rows with the same ids are
    /// replaced. Returns after the write is durable and searchable.
    pub async fn upsert_points(&self, points: &[IndexPoint]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let table = self
            .db
            .open_table(&self.table_name)
            .execute()
            .await
            .context("Failed to open dense index table")?;

        // Replace any prior version of these chunk ids.
        let id_list: Vec<String> = points
            .iter()
            .map(|p| format!("'{}'", p.chunk_id))
            .collect();
        table
            .delete(&format!("id IN ({})", id_list.join(", ")))
            .await
            .ok();

        let ids: Vec<String> = points.iter().map(|p| p.chunk_id.to_string()).collect();
        let doc_ids: Vec<String> = points.iter().map(|p| p.doc_id.to_string()).collect();
        let texts: Vec<&str> = points.iter().map(|p| p.search_text.as_str()).collect();
        let flat: Vec<f32> = points
            .iter()
            .flat_map(|p| p.vector.iter().copied())
            .collect();

        let schema = self.schema();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(
                    ids.iter().map(String::as_str).collect::<Vec<_>>(),
                )) as Arc<dyn Array>,
                Arc::new(StringArray::from(
                    doc_ids.iter().map(String::as_str).collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(texts)),
                Arc::new(self.vector_array(flat)) as Arc<dyn Array>,
            ],
        )
        .context("Failed to build upsert batch")?;

        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table
            .add(Box::new(reader))
            .execute()
            .await
            .context("Dense index upsert failed")?;

        tracing::debug!(points = points.len(), "Upserted dense index points");
        Ok(())
    }

    /// Cosine search. Scores are `1 - distance`, filtered by
    /// `score_threshold`; `doc_filter` restricts to one document.
    pub async fn search(
        &self,
        vector: &[f32],
        k: usize,
        doc_filter: Option<Uuid>,
        score_threshold: f32,
    ) -> Result<Vec<(Uuid, f32)>> {
        let table = self.db.open_table(&self.table_name).execute().await?;

        let mut query = table
            .query()
            .nearest_to(vector)?
            .distance_type(lancedb::DistanceType::Cosine)
            .limit(k);

        if let Some(doc_id) = doc_filter {
            query = query.only_if(format!("doc_id = '{}'", doc_id));
        }

        let results = query.execute().await.context("Dense search failed")?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;

        let mut hits = Vec::new();
        for batch in &batches {
            let ids = batch
                .column_by_name("id")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

            let (Some(ids), Some(distances)) = (ids, distances) else {
                continue;
            };

            for i in 0..batch.num_rows() {
                let score = (1.0 - distances.value(i)).max(0.0);
                if score < score_threshold {
                    continue;
                }
                if let Ok(id) = Uuid::parse_str(ids.value(i)) {
                    hits.push((id, score));
                }
            }
        }

        Ok(hits)
    }

    pub async fn count(&self) -> Result<usize> {
        let table = self.db.open_table(&self.table_name).execute().await?;
        Ok(table.count_rows(None).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(mut v: Vec<f32>) -> Vec<f32> {
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in &mut v {
            *x /= norm;
        }
        v
    }

    fn point(chunk_id: Uuid, doc_id: Uuid, vector: Vec<f32>) -> IndexPoint {
        IndexPoint {
            chunk_id,
            doc_id,
            search_text: "text".to_string(),
            vector,
        }
    }

    #[tokio::test]
    async fn upsert_then_search_returns_chunk_as_top_hit() {
        let dir = tempfile::tempdir().unwrap();
        let index = DenseIndex::open(dir.path().to_str().unwrap(), "chunks_development", 4)
            .await
            .unwrap();

        let doc_id = Uuid::new_v4();
        let near = Uuid::new_v4();
        let far = Uuid::new_v4();
        let target = unit(vec![1.0, 0.0, 0.0, 0.1]);

        index
            .upsert_points(&[
                point(near, doc_id, target.clone()),
                point(far, doc_id, unit(vec![0.0, 1.0, 1.0, 0.0])),
            ])
            .await
            .unwrap();

        let hits = index.search(&target, 2, None, 0.05).await.unwrap();
        assert_eq!(hits[0].0, near);
        assert!(hits[0].1 > 0.9);
    }

    #[tokio::test]
    async fn doc_filter_excludes_other_documents() {
        let dir = tempfile::tempdir().unwrap();
        let index = DenseIndex::open(dir.path().to_str().unwrap(), "chunks_development", 4)
            .await
            .unwrap();

        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        let in_a = Uuid::new_v4();
        let in_b = Uuid::new_v4();
        let v = unit(vec![1.0, 1.0, 0.0, 0.0]);

        index
            .upsert_points(&[point(in_a, doc_a, v.clone()), point(in_b, doc_b, v.clone())])
            .await
            .unwrap();

        let hits = index.search(&v, 10, Some(doc_b), 0.05).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, in_b);
    }

    #[tokio::test]
    async fn upsert_replaces_existing_ids() {
        let dir = tempfile::tempdir().unwrap();
        let index = DenseIndex::open(dir.path().to_str().unwrap(), "chunks_development", 4)
            .await
            .unwrap();

        let doc_id = Uuid::new_v4();
        let chunk = Uuid::new_v4();
        let v = unit(vec![0.5, 0.5, 0.5, 0.5]);

        index
            .upsert_points(&[point(chunk, doc_id, v.clone())])
            .await
            .unwrap();
        index
            .upsert_points(&[point(chunk, doc_id, v)])
            .await
            .unwrap();

        assert_eq!(index.count().await.unwrap(), 1);
    }
}
