//* Combines live S3 state with ZFS snapshot history into one version
//* timeline (spec §4.4). The only module that depends on both adapters.
use crate::osa::{ObjectStoreAdapter, OsaError};
use crate::ssa::{SnapshotAdapter, SsaError, SNAPSHOT_FANOUT_WIDTH};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::fmt::{self, Formatter};
use std::sync::Arc;

#[derive(Debug)]
pub enum CoreError {
    NotFound,
    SnapshotUnavailable(String),
    TransportFailure(String),
    InvalidRequest(String),
}

impl std::error::Error for CoreError {}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::NotFound => write!(f, "version not found"),
            CoreError::SnapshotUnavailable(msg) => write!(f, "snapshot unavailable: {msg}"),
            CoreError::TransportFailure(msg) => write!(f, "transport failure: {msg}"),
            CoreError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
        }
    }
}

impl From<OsaError> for CoreError {
    fn from(e: OsaError) -> Self {
        match e {
            OsaError::NotFound => CoreError::NotFound,
            OsaError::Transport(msg) => CoreError::TransportFailure(msg),
        }
    }
}

impl From<SsaError> for CoreError {
    fn from(e: SsaError) -> Self {
        match e {
            SsaError::NotFound => CoreError::NotFound,
            SsaError::Unavailable(msg) => CoreError::SnapshotUnavailable(msg),
            SsaError::Transport(msg) => CoreError::TransportFailure(msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionSource {
    Current,
    Snapshot,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionRecord {
    pub version_id: String,
    pub source: VersionSource,
    pub size: i64,
    pub modified_time: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub snapshot_name: Option<String>,
    pub is_current: bool,
}

/// `(size, modified_time truncated to whole seconds)` — S3 reports
/// sub-second precision, SFTP reports whole seconds only, so equality
/// must compare at the coarser granularity (spec §4.4).
type Signature = (i64, Option<DateTime<Utc>>);

fn normalize(dt: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    dt.and_then(|dt| DateTime::from_timestamp(dt.timestamp(), 0))
}

fn signature(size: i64, modified_time: Option<DateTime<Utc>>) -> Signature {
    (size, normalize(modified_time))
}

pub struct VersionMapper {
    osa: Arc<dyn ObjectStoreAdapter>,
    ssa: Arc<dyn SnapshotAdapter>,
}

impl VersionMapper {
    pub fn new(osa: Arc<dyn ObjectStoreAdapter>, ssa: Arc<dyn SnapshotAdapter>) -> Self {
        VersionMapper { osa, ssa }
    }

    pub async fn enumerate_snapshots(
        &self,
    ) -> Result<Vec<crate::snapshot_dir::SnapshotDescriptor>, CoreError> {
        Ok(self.ssa.list_snapshots().await?)
    }

    /// Reconstructs the full version timeline for one object. Returns
    /// newest-first, `v1` assigned to the oldest distinct version (spec
    /// §4.4).
    pub async fn list_object_versions(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Vec<VersionRecord>, CoreError> {
        let current = self.current_version(bucket, key);
        let snapshots = self.ssa.list_snapshots();

        let (current, snapshots) = tokio::join!(current, snapshots);
        let current = current?;
        let snapshots = snapshots?;

        let bucket_owned = bucket.to_string();
        let key_owned = key.to_string();

        let probe_results: Vec<Result<Option<VersionRecord>, CoreError>> = stream::iter(snapshots.into_iter())
            .map(|snapshot| {
                let ssa = Arc::clone(&self.ssa);
                let bucket = bucket_owned.clone();
                let key = key_owned.clone();
                async move { snapshot_version(ssa.as_ref(), &bucket, &key, &snapshot.name).await }
            })
            .buffer_unordered(SNAPSHOT_FANOUT_WIDTH)
            .collect()
            .await;

        let mut snapshot_versions: Vec<VersionRecord> = Vec::new();
        for result in probe_results {
            if let Some(version) = result? {
                snapshot_versions.push(version);
            }
        }

        snapshot_versions.sort_by_key(|v| normalize(v.modified_time));

        let current_signature = current
            .as_ref()
            .map(|v| signature(v.size, v.modified_time));

        let mut unique_versions: Vec<VersionRecord> = Vec::new();
        let mut seen_signatures: Vec<Signature> = Vec::new();

        for version in snapshot_versions {
            let sig = signature(version.size, version.modified_time);
            if seen_signatures.contains(&sig) {
                continue;
            }
            if Some(sig) == current_signature {
                continue;
            }
            seen_signatures.push(sig);
            unique_versions.push(version);
        }

        if let Some(current) = current {
            unique_versions.push(current);
        }

        for (i, version) in unique_versions.iter_mut().enumerate() {
            let ordinal = i + 1;
            version.version_id = if version.is_current {
                format!("v{ordinal} (current)")
            } else {
                format!("v{ordinal}")
            };
        }

        unique_versions.reverse();
        Ok(unique_versions)
    }

    /// Dispatches on the version-id grammar from spec §6: `"current"` or
    /// any id ending in `"(current)"` reads from the live adapter,
    /// everything else is treated as a snapshot name.
    pub async fn get_version_content(
        &self,
        bucket: &str,
        key: &str,
        version_id: &str,
    ) -> Result<(Vec<u8>, VersionRecord), CoreError> {
        if version_id == "current" || version_id.ends_with("(current)") {
            let content = self.osa.get_object_bytes(bucket, key).await?;
            let metadata = self.osa.head_object(bucket, key).await?;
            let record = VersionRecord {
                version_id: "current".to_string(),
                source: VersionSource::Current,
                size: content.len() as i64,
                modified_time: metadata.as_ref().and_then(|m| m.last_modified),
                etag: metadata.and_then(|m| m.etag),
                snapshot_name: None,
                is_current: true,
            };
            Ok((content.to_vec(), record))
        } else {
            let content = self
                .ssa
                .read_snapshot_bytes(version_id, bucket, key)
                .await?;
            let file_info = self.ssa.stat_snapshot_object(version_id, bucket, key).await?;
            let record = VersionRecord {
                version_id: version_id.to_string(),
                source: VersionSource::Snapshot,
                size: content.len() as i64,
                modified_time: file_info.map(|f| f.modified_time),
                etag: None,
                snapshot_name: Some(version_id.to_string()),
                is_current: false,
            };
            Ok((content, record))
        }
    }

    async fn current_version(&self, bucket: &str, key: &str) -> Result<Option<VersionRecord>, CoreError> {
        let metadata = match self.osa.head_object(bucket, key).await {
            Ok(metadata) => metadata,
            Err(e) => return Err(e.into()),
        };
        Ok(metadata.map(|m| VersionRecord {
            version_id: "current".to_string(),
            source: VersionSource::Current,
            size: m.size,
            modified_time: m.last_modified,
            etag: m.etag,
            snapshot_name: None,
            is_current: true,
        }))
    }
}

async fn snapshot_version(
    ssa: &dyn SnapshotAdapter,
    bucket: &str,
    key: &str,
    snapshot_name: &str,
) -> Result<Option<VersionRecord>, CoreError> {
    let info = ssa.stat_snapshot_object(snapshot_name, bucket, key).await?;
    Ok(info.filter(|info| !info.is_dir).map(|info| VersionRecord {
        version_id: snapshot_name.to_string(),
        source: VersionSource::Snapshot,
        size: info.size as i64,
        modified_time: Some(info.modified_time),
        etag: None,
        snapshot_name: Some(snapshot_name.to_string()),
        is_current: false,
    }))
}

#[cfg(test)]
mod test_version_mapper {
    use super::*;
    use crate::osa::{BucketInfo, ObjectListing, ObjectMetadata};
    use crate::snapshot_dir::SnapshotDescriptor;
    use crate::ssa::FileInfo;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeOsa {
        object: Mutex<Option<ObjectMetadata>>,
        content: Mutex<Vec<u8>>,
    }

    #[async_trait]
    impl ObjectStoreAdapter for FakeOsa {
        async fn list_buckets(&self) -> Result<Vec<BucketInfo>, OsaError> {
            Ok(Vec::new())
        }

        async fn list_objects(
            &self,
            _bucket: &str,
            _prefix: &str,
            _delimiter: &str,
            _max_keys: i32,
        ) -> Result<ObjectListing, OsaError> {
            Ok(ObjectListing::default())
        }

        async fn head_object(&self, _bucket: &str, _key: &str) -> Result<Option<ObjectMetadata>, OsaError> {
            Ok(self.object.lock().unwrap().clone())
        }

        async fn get_object_bytes(&self, _bucket: &str, _key: &str) -> Result<Bytes, OsaError> {
            Ok(Bytes::from(self.content.lock().unwrap().clone()))
        }
    }

    struct FakeSsa {
        snapshots: Vec<&'static str>,
        files: HashMap<&'static str, FileInfo>,
    }

    #[async_trait]
    impl SnapshotAdapter for FakeSsa {
        async fn list_snapshots(&self) -> Result<Vec<SnapshotDescriptor>, SsaError> {
            Ok(self
                .snapshots
                .iter()
                .map(|name| SnapshotDescriptor::from_name(*name))
                .collect())
        }

        async fn stat_snapshot_object(
            &self,
            snapshot: &str,
            _bucket: &str,
            _key: &str,
        ) -> Result<Option<FileInfo>, SsaError> {
            Ok(self.files.get(snapshot).cloned())
        }

        async fn read_snapshot_bytes(
            &self,
            snapshot: &str,
            _bucket: &str,
            _key: &str,
        ) -> Result<Vec<u8>, SsaError> {
            match self.files.get(snapshot) {
                Some(info) => Ok(format!("content-of-{}", info.path).into_bytes()),
                None => Err(SsaError::NotFound),
            }
        }

        async fn list_snapshot_objects(
            &self,
            _snapshot: &str,
            _bucket: &str,
            _prefix: &str,
        ) -> Result<Vec<FileInfo>, SsaError> {
            Ok(Vec::new())
        }
    }

    fn file_info(path: &str, size: u64, seconds: i64) -> FileInfo {
        FileInfo {
            path: path.to_string(),
            name: path.rsplit('/').next().unwrap().to_string(),
            size,
            modified_time: DateTime::from_timestamp(seconds, 0).unwrap(),
            is_dir: false,
        }
    }

    fn mapper(osa: FakeOsa, ssa: FakeSsa) -> VersionMapper {
        VersionMapper::new(Arc::new(osa), Arc::new(ssa))
    }

    #[tokio::test]
    async fn current_only_when_no_snapshots_have_the_object() {
        let osa = FakeOsa {
            object: Mutex::new(Some(ObjectMetadata {
                key: "k".to_string(),
                size: 100,
                last_modified: DateTime::from_timestamp(1_000_000, 0),
                etag: Some("etag-1".to_string()),
                content_type: "application/octet-stream".to_string(),
                metadata: HashMap::new(),
            })),
            content: Mutex::new(b"hello".to_vec()),
        };
        let ssa = FakeSsa {
            snapshots: vec![],
            files: HashMap::new(),
        };
        let versions = mapper(osa, ssa).list_object_versions("b", "k").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version_id, "v1 (current)");
        assert!(versions[0].is_current);
    }

    #[tokio::test]
    async fn two_distinct_historical_versions_plus_current() {
        let osa = FakeOsa {
            object: Mutex::new(Some(ObjectMetadata {
                key: "k".to_string(),
                size: 300,
                last_modified: DateTime::from_timestamp(3_000_000, 0),
                etag: None,
                content_type: "application/octet-stream".to_string(),
                metadata: HashMap::new(),
            })),
            content: Mutex::new(b"current".to_vec()),
        };
        let mut files = HashMap::new();
        files.insert("daily_2025-01-01", file_info(".zfs/daily_2025-01-01/b/k", 100, 1_000_000));
        files.insert("daily_2025-01-02", file_info(".zfs/daily_2025-01-02/b/k", 200, 2_000_000));
        let ssa = FakeSsa {
            snapshots: vec!["daily_2025-01-01", "daily_2025-01-02"],
            files,
        };
        let versions = mapper(osa, ssa).list_object_versions("b", "k").await.unwrap();
        assert_eq!(versions.len(), 3);
        // newest first
        assert_eq!(versions[0].version_id, "v3 (current)");
        assert_eq!(versions[1].version_id, "v2");
        assert_eq!(versions[1].snapshot_name.as_deref(), Some("daily_2025-01-02"));
        assert_eq!(versions[2].version_id, "v1");
        assert_eq!(versions[2].snapshot_name.as_deref(), Some("daily_2025-01-01"));
    }

    #[tokio::test]
    async fn snapshot_matching_current_signature_is_suppressed() {
        let osa = FakeOsa {
            object: Mutex::new(Some(ObjectMetadata {
                key: "k".to_string(),
                size: 100,
                last_modified: DateTime::from_timestamp(1_000_000, 0),
                etag: Some("etag".to_string()),
                content_type: "application/octet-stream".to_string(),
                metadata: HashMap::new(),
            })),
            content: Mutex::new(b"hello".to_vec()),
        };
        let mut files = HashMap::new();
        files.insert("daily_2025-01-01", file_info(".zfs/daily_2025-01-01/b/k", 100, 1_000_000));
        let ssa = FakeSsa {
            snapshots: vec!["daily_2025-01-01"],
            files,
        };
        let versions = mapper(osa, ssa).list_object_versions("b", "k").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert!(versions[0].is_current);
    }

    #[tokio::test]
    async fn two_snapshots_with_identical_content_keep_oldest_only() {
        let osa = FakeOsa {
            object: Mutex::new(None),
            content: Mutex::new(Vec::new()),
        };
        let mut files = HashMap::new();
        files.insert("daily_2025-01-01", file_info(".zfs/daily_2025-01-01/b/k", 50, 1_000_000));
        files.insert("daily_2025-01-02", file_info(".zfs/daily_2025-01-02/b/k", 50, 1_000_000));
        let ssa = FakeSsa {
            snapshots: vec!["daily_2025-01-01", "daily_2025-01-02"],
            files,
        };
        let versions = mapper(osa, ssa).list_object_versions("b", "k").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].snapshot_name.as_deref(), Some("daily_2025-01-01"));
    }

    #[tokio::test]
    async fn snapshots_missing_the_object_are_excluded() {
        let osa = FakeOsa {
            object: Mutex::new(None),
            content: Mutex::new(Vec::new()),
        };
        let mut files = HashMap::new();
        files.insert("daily_2025-01-02", file_info(".zfs/daily_2025-01-02/b/k", 50, 2_000_000));
        let ssa = FakeSsa {
            snapshots: vec!["daily_2025-01-01", "daily_2025-01-02"],
            files,
        };
        let versions = mapper(osa, ssa).list_object_versions("b", "k").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].snapshot_name.as_deref(), Some("daily_2025-01-02"));
    }

    #[tokio::test]
    async fn get_version_content_dispatches_current() {
        let osa = FakeOsa {
            object: Mutex::new(Some(ObjectMetadata {
                key: "k".to_string(),
                size: 5,
                last_modified: DateTime::from_timestamp(1_000_000, 0),
                etag: Some("e".to_string()),
                content_type: "application/octet-stream".to_string(),
                metadata: HashMap::new(),
            })),
            content: Mutex::new(b"hello".to_vec()),
        };
        let ssa = FakeSsa {
            snapshots: vec![],
            files: HashMap::new(),
        };
        let (content, record) = mapper(osa, ssa)
            .get_version_content("b", "k", "v1 (current)")
            .await
            .unwrap();
        assert_eq!(content, b"hello");
        assert!(record.is_current);
    }

    #[tokio::test]
    async fn get_version_content_dispatches_snapshot() {
        let osa = FakeOsa {
            object: Mutex::new(None),
            content: Mutex::new(Vec::new()),
        };
        let mut files = HashMap::new();
        files.insert("daily_2025-01-01", file_info(".zfs/daily_2025-01-01/b/k", 50, 1_000_000));
        let ssa = FakeSsa {
            snapshots: vec!["daily_2025-01-01"],
            files,
        };
        let (content, record) = mapper(osa, ssa)
            .get_version_content("b", "k", "daily_2025-01-01")
            .await
            .unwrap();
        assert_eq!(content, b"content-of-.zfs/daily_2025-01-01/b/k");
        assert_eq!(record.source, VersionSource::Snapshot);
    }
}
