use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{FromRow, SqlitePool};
use tracing::info;

use crate::errors::{GatewayError, Result};

const TABLE_CAMERAS: &str = "cameras";

/// Quality tier offered by the camera. Sub-streams are lower bitrate and
/// the safer default for multi-camera walls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum StreamVariant {
    Main,
    Sub,
}

impl Default for StreamVariant {
    fn default() -> Self {
        Self::Sub
    }
}

impl StreamVariant {
    /// Hikvision channel number: 101 = main stream, 102 = sub stream.
    pub fn channel(self) -> &'static str {
        match self {
            StreamVariant::Main => "101",
            StreamVariant::Sub => "102",
        }
    }

    /// Path segment used by the legacy `/h264/ch1/...` URL scheme.
    pub fn legacy_segment(self) -> &'static str {
        match self {
            StreamVariant::Main => "main_stream",
            StreamVariant::Sub => "sub_stream",
        }
    }
}

/// Identity and connection parameters for one physical camera.
///
/// Treated as immutable while a supervisor is running; a credential change
/// goes through the manager as stop + recreate.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct CameraConfig {
    pub id: i64,
    pub name: String,
    pub ip_address: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub port: u16,
    pub rtsp_url: Option<String>,
    pub stream_variant: StreamVariant,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload for creating a camera record.
#[derive(Debug, Clone, Deserialize)]
pub struct NewCamera {
    pub name: String,
    pub ip_address: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_rtsp_port")]
    pub port: u16,
    #[serde(default)]
    pub rtsp_url: Option<String>,
    #[serde(default)]
    pub stream_variant: StreamVariant,
}

fn default_rtsp_port() -> u16 {
    554
}

/// Partial update; unset fields keep their current values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CameraUpdate {
    pub name: Option<String>,
    pub ip_address: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub port: Option<u16>,
    pub rtsp_url: Option<Option<String>>,
    pub stream_variant: Option<StreamVariant>,
    pub is_active: Option<bool>,
}

#[async_trait]
pub trait CameraRegistry: Send + Sync {
    async fn initialize(&self) -> Result<()>;
    async fn list_cameras(&self, active_only: bool) -> Result<Vec<CameraConfig>>;
    async fn get_camera(&self, id: i64) -> Result<Option<CameraConfig>>;
    async fn insert_camera(&self, camera: NewCamera) -> Result<CameraConfig>;
    async fn update_camera(&self, id: i64, update: CameraUpdate) -> Result<Option<CameraConfig>>;
    /// Soft delete: clears `is_active`, keeping the row for audit.
    async fn deactivate_camera(&self, id: i64) -> Result<bool>;
    /// Insert sample rows when the table is empty. Returns how many were added.
    async fn seed_if_empty(&self) -> Result<usize>;
}

pub struct SqliteCameraRegistry {
    pool: SqlitePool,
}

impl SqliteCameraRegistry {
    pub async fn connect(database_url: &str) -> Result<Self> {
        // A single connection keeps `sqlite::memory:` usable and is plenty
        // for a registry that changes at human cadence.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl CameraRegistry for SqliteCameraRegistry {
    async fn initialize(&self) -> Result<()> {
        let query = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                ip_address TEXT NOT NULL,
                username TEXT NOT NULL,
                password TEXT NOT NULL,
                port INTEGER NOT NULL DEFAULT 554,
                rtsp_url TEXT,
                stream_variant TEXT NOT NULL DEFAULT 'sub',
                is_active BOOLEAN NOT NULL DEFAULT 1,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
            TABLE_CAMERAS
        );
        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn list_cameras(&self, active_only: bool) -> Result<Vec<CameraConfig>> {
        let query = if active_only {
            format!("SELECT * FROM {} WHERE is_active = 1 ORDER BY id", TABLE_CAMERAS)
        } else {
            format!("SELECT * FROM {} ORDER BY id", TABLE_CAMERAS)
        };
        let cameras = sqlx::query_as::<_, CameraConfig>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(cameras)
    }

    async fn get_camera(&self, id: i64) -> Result<Option<CameraConfig>> {
        let query = format!("SELECT * FROM {} WHERE id = ?", TABLE_CAMERAS);
        let camera = sqlx::query_as::<_, CameraConfig>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(camera)
    }

    async fn insert_camera(&self, camera: NewCamera) -> Result<CameraConfig> {
        let now = Utc::now();
        let query = format!(
            r#"
            INSERT INTO {} (name, ip_address, username, password, port, rtsp_url,
                            stream_variant, is_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            "#,
            TABLE_CAMERAS
        );
        let result = sqlx::query(&query)
            .bind(&camera.name)
            .bind(&camera.ip_address)
            .bind(&camera.username)
            .bind(&camera.password)
            .bind(camera.port)
            .bind(&camera.rtsp_url)
            .bind(camera.stream_variant)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;

        let id = result.last_insert_rowid();
        self.get_camera(id)
            .await?
            .ok_or_else(|| GatewayError::server("inserted camera row not found"))
    }

    async fn update_camera(&self, id: i64, update: CameraUpdate) -> Result<Option<CameraConfig>> {
        let Some(current) = self.get_camera(id).await? else {
            return Ok(None);
        };

        let name = update.name.unwrap_or(current.name);
        let ip_address = update.ip_address.unwrap_or(current.ip_address);
        let username = update.username.unwrap_or(current.username);
        let password = update.password.unwrap_or(current.password);
        let port = update.port.unwrap_or(current.port);
        let rtsp_url = update.rtsp_url.unwrap_or(current.rtsp_url);
        let stream_variant = update.stream_variant.unwrap_or(current.stream_variant);
        let is_active = update.is_active.unwrap_or(current.is_active);

        let query = format!(
            r#"
            UPDATE {} SET name = ?, ip_address = ?, username = ?, password = ?,
                          port = ?, rtsp_url = ?, stream_variant = ?, is_active = ?,
                          updated_at = ?
            WHERE id = ?
            "#,
            TABLE_CAMERAS
        );
        sqlx::query(&query)
            .bind(&name)
            .bind(&ip_address)
            .bind(&username)
            .bind(&password)
            .bind(port)
            .bind(&rtsp_url)
            .bind(stream_variant)
            .bind(is_active)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        self.get_camera(id).await
    }

    async fn deactivate_camera(&self, id: i64) -> Result<bool> {
        let query = format!(
            "UPDATE {} SET is_active = 0, updated_at = ? WHERE id = ? AND is_active = 1",
            TABLE_CAMERAS
        );
        let result = sqlx::query(&query)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn seed_if_empty(&self) -> Result<usize> {
        let query = format!("SELECT COUNT(*) as count FROM {}", TABLE_CAMERAS);
        let count: i64 = sqlx::query_scalar(&query).fetch_one(&self.pool).await?;
        if count > 0 {
            info!("Registry already has {} cameras, skipping seed", count);
            return Ok(0);
        }

        let samples = [
            NewCamera {
                name: "Camera 1 - Main Entrance".to_string(),
                ip_address: "192.168.0.100".to_string(),
                username: "admin".to_string(),
                password: "changeme".to_string(),
                port: 554,
                rtsp_url: None,
                stream_variant: StreamVariant::Sub,
            },
            NewCamera {
                name: "Camera 2 - Parking Lot".to_string(),
                ip_address: "192.168.0.107".to_string(),
                username: "admin".to_string(),
                password: "changeme".to_string(),
                port: 554,
                rtsp_url: None,
                stream_variant: StreamVariant::Sub,
            },
        ];

        let seeded = samples.len();
        for camera in samples {
            let inserted = self.insert_camera(camera).await?;
            info!("Seeded camera '{}' ({})", inserted.name, inserted.ip_address);
        }
        Ok(seeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_registry() -> SqliteCameraRegistry {
        let registry = SqliteCameraRegistry::connect("sqlite::memory:")
            .await
            .unwrap();
        registry.initialize().await.unwrap();
        registry
    }

    fn sample_camera(name: &str) -> NewCamera {
        NewCamera {
            name: name.to_string(),
            ip_address: "10.0.0.5".to_string(),
            username: "admin".to_string(),
            password: "secret".to_string(),
            port: 554,
            rtsp_url: None,
            stream_variant: StreamVariant::Sub,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let registry = open_registry().await;
        let camera = registry.insert_camera(sample_camera("front door")).await.unwrap();
        assert!(camera.id > 0);
        assert!(camera.is_active);
        assert_eq!(camera.stream_variant, StreamVariant::Sub);

        let fetched = registry.get_camera(camera.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "front door");
        assert_eq!(fetched.port, 554);
    }

    #[tokio::test]
    async fn test_soft_delete_hides_from_active_list() {
        let registry = open_registry().await;
        let camera = registry.insert_camera(sample_camera("garage")).await.unwrap();

        assert!(registry.deactivate_camera(camera.id).await.unwrap());
        // Second deactivate is a no-op
        assert!(!registry.deactivate_camera(camera.id).await.unwrap());

        assert!(registry.list_cameras(true).await.unwrap().is_empty());
        let all = registry.list_cameras(false).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(!all[0].is_active);
    }

    #[tokio::test]
    async fn test_partial_update() {
        let registry = open_registry().await;
        let camera = registry.insert_camera(sample_camera("yard")).await.unwrap();

        let updated = registry
            .update_camera(
                camera.id,
                CameraUpdate {
                    password: Some("rotated".to_string()),
                    stream_variant: Some(StreamVariant::Main),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.password, "rotated");
        assert_eq!(updated.stream_variant, StreamVariant::Main);
        // Untouched fields survive
        assert_eq!(updated.name, "yard");
        assert_eq!(updated.ip_address, "10.0.0.5");
        assert!(updated.updated_at >= camera.updated_at);
    }

    #[tokio::test]
    async fn test_update_missing_camera() {
        let registry = open_registry().await;
        let result = registry
            .update_camera(99, CameraUpdate::default())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let registry = open_registry().await;
        assert_eq!(registry.seed_if_empty().await.unwrap(), 2);
        assert_eq!(registry.seed_if_empty().await.unwrap(), 0);
        assert_eq!(registry.list_cameras(true).await.unwrap().len(), 2);
    }

    #[test]
    fn test_password_never_serialized() {
        let camera = CameraConfig {
            id: 1,
            name: "cam".to_string(),
            ip_address: "10.0.0.9".to_string(),
            username: "admin".to_string(),
            password: "hunter2".to_string(),
            port: 554,
            rtsp_url: None,
            stream_variant: StreamVariant::Sub,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&camera).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("password"));
    }
}
