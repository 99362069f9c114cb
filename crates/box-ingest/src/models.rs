use serde::{Serialize, Deserialize};
use utoipa::ToSchema;
use uuid::Uuid;
use chrono::{DateTime, Utc};

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
	pub id: Uuid,
	pub architecture_id: Uuid,
	pub file_name: String,
	pub file_size: i64,
	pub checksum: Option<String>,
	pub checksum_type: Option<String>,
	pub download_count: i64,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}
