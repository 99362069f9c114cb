use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;
use crate::catalog::{CatalogError, CatalogLink, CatalogMiss, CatalogReconciler, ChainIds, FileRecordInput, UpsertedFile};
use crate::models::FileRecord;
use crate::storage::UploadTarget;

/// Child lookups for each link below the organization, parent id bound as $2.
const CHILD_LOOKUPS: [(CatalogLink, &str); 4] = [
    (CatalogLink::Box, "SELECT id FROM boxes WHERE name = $1 AND organization_id = $2"),
    (CatalogLink::Version, "SELECT id FROM versions WHERE version_number = $1 AND box_id = $2"),
    (CatalogLink::Provider, "SELECT id FROM providers WHERE name = $1 AND version_id = $2"),
    (CatalogLink::Architecture, "SELECT id FROM architectures WHERE name = $1 AND provider_id = $2"),
];

#[derive(Debug, Clone)]
pub struct PgCatalog { pool: Pool<Postgres> }

impl PgCatalog {
    pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }
    pub fn pool(&self) -> &Pool<Postgres> { &self.pool }
}

fn miss(link: CatalogLink, name: &str) -> CatalogError { CatalogError::NotFound(CatalogMiss { link, name: name.to_string() }) }

#[async_trait]
impl CatalogReconciler for PgCatalog {
    async fn resolve_chain(&self, target: &UploadTarget) -> Result<ChainIds, CatalogError> {
        let segs = target.segments();
        let org: Uuid = sqlx::query("SELECT id FROM organizations WHERE name = $1")
            .bind(segs[0])
            .fetch_optional(&self.pool).await?
            .ok_or_else(|| miss(CatalogLink::Organization, segs[0]))?
            .get("id");
        let mut ids = [org, Uuid::nil(), Uuid::nil(), Uuid::nil(), Uuid::nil()];
        for (i, (link, sql)) in CHILD_LOOKUPS.iter().enumerate() {
            let name = segs[i + 1];
            let row = sqlx::query(sql).bind(name).bind(ids[i]).fetch_optional(&self.pool).await?;
            ids[i + 1] = row.ok_or_else(|| miss(*link, name))?.get("id");
        }
        Ok(ChainIds { organization_id: ids[0], box_id: ids[1], version_id: ids[2], provider_id: ids[3], architecture_id: ids[4] })
    }

    async fn upsert_file_record(&self, architecture_id: Uuid, file: &FileRecordInput) -> Result<UpsertedFile, CatalogError> {
        // xmax = 0 only for freshly inserted tuples
        let row = sqlx::query(
            "INSERT INTO files (architecture_id, file_name, file_size, checksum, checksum_type) VALUES ($1,$2,$3,$4,$5) \
             ON CONFLICT (architecture_id, file_name) DO UPDATE SET file_size = EXCLUDED.file_size, checksum = EXCLUDED.checksum, \
             checksum_type = EXCLUDED.checksum_type, updated_at = now() \
             RETURNING id, architecture_id, file_name, file_size, checksum, checksum_type, download_count, created_at, updated_at, (xmax = 0) AS inserted")
            .bind(architecture_id)
            .bind(&file.file_name)
            .bind(file.file_size)
            .bind(file.checksum.as_deref())
            .bind(file.checksum_type.as_deref())
            .fetch_one(&self.pool).await?;
        let created: bool = row.try_get("inserted")?;
        let record = <FileRecord as sqlx::FromRow<'_, sqlx::postgres::PgRow>>::from_row(&row)?;
        Ok(UpsertedFile { record, created })
    }

    async fn ping(&self) -> Result<(), CatalogError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
