//! Supervisor lifecycle management: one supervisor per active camera,
//! keyed by registry id. Registry CRUD events arrive here and turn into
//! supervisor creation and teardown; the HTTP boundary looks supervisors up
//! here. Camera records are immutable while a supervisor runs, so an update
//! is always stop + recreate.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::StreamConfig;
use crate::errors::{GatewayError, Result};
use crate::publisher::FramePublisher;
use crate::registry::CameraConfig;
use crate::session::Connector;
use crate::supervisor::{StreamStatus, Supervisor};

struct CameraEntry {
    supervisor: Arc<Supervisor>,
    publisher: Arc<FramePublisher>,
}

pub struct StreamManager {
    settings: StreamConfig,
    connector: Arc<dyn Connector>,
    cameras: RwLock<HashMap<i64, CameraEntry>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// At least one active camera is delivering frames.
    Healthy,
    /// Active cameras exist but none is connected.
    Degraded,
    /// No active cameras configured.
    Idle,
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraHealth {
    pub id: i64,
    pub name: String,
    pub connected: bool,
    pub fps: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub total_cameras: usize,
    pub connected_cameras: usize,
    pub cameras: Vec<CameraHealth>,
    pub timestamp: DateTime<Utc>,
}

impl StreamManager {
    pub fn new(settings: StreamConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            settings,
            connector,
            cameras: RwLock::new(HashMap::new()),
        }
    }

    /// Start supervising a camera. Inactive records are ignored (and torn
    /// down if previously running); an already-supervised id is left alone.
    pub async fn on_camera_added(&self, camera: CameraConfig) {
        if !camera.is_active {
            info!("Camera '{}' is inactive, not starting a supervisor", camera.name);
            self.on_camera_removed(camera.id).await;
            return;
        }

        // Hold the write lock across check and insert; a racing add for the
        // same id must not replace a running supervisor nobody can stop
        let mut cameras = self.cameras.write().await;
        if cameras.contains_key(&camera.id) {
            info!("Camera '{}' already supervised", camera.name);
            return;
        }

        info!("Adding camera '{}' ({})", camera.name, camera.ip_address);
        let supervisor = Arc::new(Supervisor::new(
            camera.clone(),
            self.settings.clone(),
            self.connector.clone(),
        ));
        let publisher = Arc::new(FramePublisher::new(
            supervisor.subscribe(),
            self.settings.jpeg_quality,
        ));
        supervisor.start().await;
        cameras.insert(camera.id, CameraEntry { supervisor, publisher });
    }

    /// Credentials or connection parameters changed: tear down and recreate.
    pub async fn on_camera_updated(&self, camera: CameraConfig) {
        info!("Restarting camera '{}' after config change", camera.name);
        self.on_camera_removed(camera.id).await;
        self.on_camera_added(camera).await;
    }

    /// Stop and forget a camera's supervisor. Returns whether one existed.
    pub async fn on_camera_removed(&self, id: i64) -> bool {
        let removed = {
            let mut cameras = self.cameras.write().await;
            cameras.remove(&id)
        };

        // Stop outside the map lock so a slow teardown cannot stall lookups
        match removed {
            Some(entry) => {
                info!("Stopping supervisor for camera {}", id);
                entry.supervisor.stop().await;
                true
            }
            None => {
                warn!("Camera {} was not supervised", id);
                false
            }
        }
    }

    pub async fn get_status(&self, id: i64) -> Result<StreamStatus> {
        let cameras = self.cameras.read().await;
        cameras
            .get(&id)
            .map(|entry| entry.supervisor.status())
            .ok_or_else(|| GatewayError::not_found(id))
    }

    /// Latest encoded frame, `Ok(None)` when the camera exists but has not
    /// produced a frame yet.
    pub async fn snapshot(&self, id: i64) -> Result<Option<Bytes>> {
        let cameras = self.cameras.read().await;
        let entry = cameras.get(&id).ok_or_else(|| GatewayError::not_found(id))?;
        Ok(entry.publisher.snapshot())
    }

    pub async fn publisher(&self, id: i64) -> Result<(Arc<FramePublisher>, String)> {
        let cameras = self.cameras.read().await;
        let entry = cameras.get(&id).ok_or_else(|| GatewayError::not_found(id))?;
        Ok((
            entry.publisher.clone(),
            entry.supervisor.camera().name.clone(),
        ))
    }

    pub async fn force_reconnect(&self, id: i64) -> Result<()> {
        let cameras = self.cameras.read().await;
        let entry = cameras.get(&id).ok_or_else(|| GatewayError::not_found(id))?;
        entry.supervisor.force_reconnect();
        Ok(())
    }

    /// Live status for every supervised camera.
    pub async fn statuses(&self) -> HashMap<i64, StreamStatus> {
        let cameras = self.cameras.read().await;
        cameras
            .iter()
            .map(|(id, entry)| (*id, entry.supervisor.status()))
            .collect()
    }

    /// Aggregate health. One camera outage degrades the report; it never
    /// fails the process.
    pub async fn health(&self) -> HealthReport {
        let cameras = self.cameras.read().await;
        let mut report_cameras: Vec<CameraHealth> = cameras
            .iter()
            .map(|(id, entry)| {
                let status = entry.supervisor.status();
                CameraHealth {
                    id: *id,
                    name: entry.supervisor.camera().name.clone(),
                    connected: status.connected,
                    fps: status.fps,
                }
            })
            .collect();
        report_cameras.sort_by_key(|c| c.id);

        let total = report_cameras.len();
        let connected = report_cameras.iter().filter(|c| c.connected).count();
        let status = if total == 0 {
            HealthStatus::Idle
        } else if connected > 0 {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            total_cameras: total,
            connected_cameras: connected,
            cameras: report_cameras,
            timestamp: Utc::now(),
        }
    }

    /// Stop every supervisor, for process shutdown.
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<Supervisor>> = {
            let mut cameras = self.cameras.write().await;
            cameras.drain().map(|(_, e)| e.supervisor).collect()
        };
        for supervisor in entries {
            supervisor.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SessionError;
    use crate::registry::StreamVariant;
    use crate::session::{Frame, FrameSource};
    use async_trait::async_trait;
    use std::time::Duration;

    fn camera(id: i64, name: &str, active: bool) -> CameraConfig {
        CameraConfig {
            id,
            name: name.to_string(),
            ip_address: "192.0.2.10".to_string(),
            username: "admin".to_string(),
            password: "pass".to_string(),
            port: 554,
            rtsp_url: None,
            stream_variant: StreamVariant::Sub,
            is_active: active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn fast_settings() -> StreamConfig {
        StreamConfig {
            connect_timeout: Duration::from_millis(50),
            read_timeout: Duration::from_millis(50),
            reconnect_delay: Duration::from_millis(20),
            ..StreamConfig::default()
        }
    }

    struct SteadySource;

    #[async_trait]
    impl FrameSource for SteadySource {
        async fn read_frame(
            &mut self,
            _timeout: Duration,
        ) -> std::result::Result<Frame, SessionError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(Frame {
                width: 2,
                height: 2,
                pixels: Bytes::from(vec![100u8; 12]),
            })
        }

        async fn close(&mut self) {}
    }

    struct SteadyConnector;

    #[async_trait]
    impl Connector for SteadyConnector {
        async fn open(
            &self,
            _url: &str,
            _timeout: Duration,
        ) -> std::result::Result<Box<dyn FrameSource>, SessionError> {
            Ok(Box::new(SteadySource))
        }
    }

    struct DeadConnector;

    #[async_trait]
    impl Connector for DeadConnector {
        async fn open(
            &self,
            _url: &str,
            _timeout: Duration,
        ) -> std::result::Result<Box<dyn FrameSource>, SessionError> {
            Err(SessionError::Unreachable("down".to_string()))
        }
    }

    async fn wait_for_connected(manager: &StreamManager, id: i64) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            if manager
                .get_status(id)
                .await
                .map(|s| s.connected)
                .unwrap_or(false)
            {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_camera_becomes_not_found() {
        let manager = StreamManager::new(fast_settings(), Arc::new(SteadyConnector));
        manager.on_camera_added(camera(1, "door", true)).await;

        assert!(wait_for_connected(&manager, 1).await);

        assert!(manager.on_camera_removed(1).await);
        assert!(matches!(
            manager.get_status(1).await,
            Err(GatewayError::NotFound { camera_id: 1 })
        ));
        assert!(matches!(
            manager.publisher(1).await,
            Err(GatewayError::NotFound { camera_id: 1 })
        ));
        assert!(!manager.on_camera_removed(1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_camera_not_supervised() {
        let manager = StreamManager::new(fast_settings(), Arc::new(SteadyConnector));
        manager.on_camera_added(camera(2, "lobby", false)).await;
        assert!(manager.get_status(2).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_aggregation() {
        let manager = StreamManager::new(fast_settings(), Arc::new(SteadyConnector));
        assert_eq!(manager.health().await.status, HealthStatus::Idle);

        manager.on_camera_added(camera(1, "door", true)).await;
        assert!(wait_for_connected(&manager, 1).await);
        assert_eq!(manager.health().await.status, HealthStatus::Healthy);

        let report = manager.health().await;
        assert_eq!(report.total_cameras, 1);
        assert_eq!(report.connected_cameras, 1);
        assert_eq!(report.cameras[0].name, "door");

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_degraded_when_all_down() {
        let manager = StreamManager::new(fast_settings(), Arc::new(DeadConnector));
        manager.on_camera_added(camera(1, "door", true)).await;

        // Give the supervisor a moment to fail its first sweep
        tokio::time::sleep(Duration::from_millis(200)).await;
        let report = manager.health().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.connected_cameras, 0);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_recreates_supervisor() {
        let manager = StreamManager::new(fast_settings(), Arc::new(SteadyConnector));
        manager.on_camera_added(camera(3, "yard", true)).await;

        let mut updated = camera(3, "yard-renamed", true);
        updated.password = "rotated".to_string();
        manager.on_camera_updated(updated).await;

        let (_publisher, name) = manager.publisher(3).await.unwrap();
        assert_eq!(name, "yard-renamed");

        // Deactivation through update tears the supervisor down
        manager.on_camera_updated(camera(3, "yard", false)).await;
        assert!(manager.get_status(3).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_add_keeps_first_supervisor() {
        let manager = StreamManager::new(fast_settings(), Arc::new(SteadyConnector));
        manager.on_camera_added(camera(6, "door", true)).await;
        let (first, _) = manager.publisher(6).await.unwrap();

        // Racing adds for the same id must not replace the running entry
        tokio::join!(
            manager.on_camera_added(camera(6, "door", true)),
            manager.on_camera_added(camera(6, "door", true)),
        );

        let (second, _) = manager.publisher(6).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_passthrough() {
        let manager = StreamManager::new(fast_settings(), Arc::new(SteadyConnector));
        manager.on_camera_added(camera(4, "gate", true)).await;

        assert!(wait_for_connected(&manager, 4).await);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        let mut got_frame = false;
        while tokio::time::Instant::now() < deadline {
            if matches!(manager.snapshot(4).await, Ok(Some(_))) {
                got_frame = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(got_frame);
        assert!(matches!(manager.snapshot(99).await, Err(GatewayError::NotFound { .. })));

        manager.shutdown().await;
    }
}
