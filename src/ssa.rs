//* Snapshot Adapter: the read-only SFTP side of ZFS snapshots (spec §4.2).
use crate::snapshot_dir::{self, SnapshotDescriptor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use russh::client::{self, Handle};
use russh::keys::{PrivateKey, load_secret_key};
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::StatusCode;
use std::fmt::{self, Formatter};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

/// Width of the bounded fan-out used when probing a single object across
/// every snapshot (spec §5). Shared with the Version Mapper.
pub const SNAPSHOT_FANOUT_WIDTH: usize = 10;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Rust does no shell tilde-expansion, so a leading `~/` in a configured
/// or default path (e.g. `~/.ssh/known_hosts`) must be expanded against
/// the real home directory before use, or it resolves relative to the
/// process cwd instead.
fn expand_tilde(path: &std::path::Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

#[derive(Debug)]
pub enum SsaError {
    NotFound,
    /// Snapshot enumeration or stat failed due to transport/permission issues.
    Unavailable(String),
    Transport(String),
}

impl std::error::Error for SsaError {}

impl fmt::Display for SsaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SsaError::NotFound => write!(f, "snapshot object not found"),
            SsaError::Unavailable(msg) => write!(f, "snapshot transport unavailable: {msg}"),
            SsaError::Transport(msg) => write!(f, "snapshot transport error: {msg}"),
        }
    }
}

/// A file observation from the snapshot side (spec §3).
#[derive(Debug, Clone, serde::Serialize)]
pub struct FileInfo {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub modified_time: DateTime<Utc>,
    pub is_dir: bool,
}

#[async_trait]
pub trait SnapshotAdapter: Send + Sync {
    async fn list_snapshots(&self) -> Result<Vec<SnapshotDescriptor>, SsaError>;

    async fn stat_snapshot_object(
        &self,
        snapshot: &str,
        bucket: &str,
        key: &str,
    ) -> Result<Option<FileInfo>, SsaError>;

    async fn object_exists(&self, snapshot: &str, bucket: &str, key: &str) -> Result<bool, SsaError> {
        Ok(self
            .stat_snapshot_object(snapshot, bucket, key)
            .await?
            .map(|info| !info.is_dir)
            .unwrap_or(false))
    }

    async fn read_snapshot_bytes(
        &self,
        snapshot: &str,
        bucket: &str,
        key: &str,
    ) -> Result<Vec<u8>, SsaError>;

    async fn list_snapshot_objects(
        &self,
        snapshot: &str,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<FileInfo>, SsaError>;
}

/// Path construction is pure and must not touch the network (spec §4.2,
/// §8). `<snapshot_root>/<snapshot>/<s3_root_prefix>/<bucket>/<key>`, with
/// `<s3_root_prefix>/` elided when the prefix is empty or ".".
pub fn snapshot_root_path(snapshot_root: &str, snapshot: &str, s3_root_prefix: &str) -> String {
    if s3_root_prefix.is_empty() || s3_root_prefix == "." {
        format!("{snapshot_root}/{snapshot}")
    } else {
        format!("{snapshot_root}/{snapshot}/{s3_root_prefix}")
    }
}

pub fn snapshot_object_path(
    snapshot_root: &str,
    snapshot: &str,
    s3_root_prefix: &str,
    bucket: &str,
    key: &str,
) -> String {
    format!(
        "{}/{bucket}/{key}",
        snapshot_root_path(snapshot_root, snapshot, s3_root_prefix)
    )
}

struct SnapshotSshHandler {
    host: String,
    port: u16,
    policy: HostKeyVerification,
}

enum HostKeyVerification {
    AcceptAll,
    Strict { known_hosts_path: PathBuf },
}

impl client::Handler for SnapshotSshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        match &self.policy {
            HostKeyVerification::AcceptAll => Ok(true),
            HostKeyVerification::Strict { known_hosts_path } => {
                match russh::keys::check_known_hosts_path(
                    &self.host,
                    self.port,
                    server_public_key,
                    known_hosts_path,
                ) {
                    Ok(known) => Ok(known),
                    Err(_) => Ok(false),
                }
            }
        }
    }
}

/// Talks to the snapshot transport over SFTP-over-SSH. Every public
/// operation connects, opens an SFTP channel, runs, and tears both down —
/// no connection is cached across calls (spec §4.2).
pub struct SshSnapshotTransport {
    host: String,
    port: u16,
    user: String,
    key_path: PathBuf,
    host_key_policy: HostKeyVerification,
    snapshot_root: String,
    s3_root_prefix: String,
}

impl SshSnapshotTransport {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        key_path: impl Into<PathBuf>,
        strict_host_key_checking: bool,
        known_hosts_path: Option<PathBuf>,
        snapshot_root: impl Into<String>,
        s3_root_prefix: impl Into<String>,
    ) -> Self {
        let host_key_policy = if strict_host_key_checking {
            HostKeyVerification::Strict {
                known_hosts_path: expand_tilde(
                    &known_hosts_path.unwrap_or_else(|| PathBuf::from("~/.ssh/known_hosts")),
                ),
            }
        } else {
            HostKeyVerification::AcceptAll
        };

        SshSnapshotTransport {
            host: host.into(),
            port,
            user: user.into(),
            key_path: key_path.into(),
            host_key_policy,
            snapshot_root: snapshot_root.into(),
            s3_root_prefix: s3_root_prefix.into(),
        }
    }

    fn root_path(&self) -> String {
        self.snapshot_root.clone()
    }

    async fn connect(&self) -> Result<Handle<SnapshotSshHandler>, SsaError> {
        let config = Arc::new(client::Config::default());
        let policy = match &self.host_key_policy {
            HostKeyVerification::AcceptAll => HostKeyVerification::AcceptAll,
            HostKeyVerification::Strict { known_hosts_path } => HostKeyVerification::Strict {
                known_hosts_path: known_hosts_path.clone(),
            },
        };
        let handler = SnapshotSshHandler {
            host: self.host.clone(),
            port: self.port,
            policy,
        };

        let mut handle = client::connect(config, (self.host.as_str(), self.port), handler)
            .await
            .map_err(|e| SsaError::Transport(e.to_string()))?;

        let key: PrivateKey = load_secret_key(&self.key_path, None)
            .map_err(|e| SsaError::Transport(format!("failed to load SSH key: {e}")))?;

        let authenticated = handle
            .authenticate_publickey(&self.user, Arc::new(key))
            .await
            .map_err(|e| SsaError::Transport(e.to_string()))?;

        if !authenticated.success() {
            return Err(SsaError::Transport(
                "SSH public key authentication rejected".to_string(),
            ));
        }

        Ok(handle)
    }

    /// Scoped connect → SFTP subsystem → run → release, on every exit path
    /// (spec §4.2's transport contract). Callers box their future explicitly
    /// (`Box::pin(async move { ... })`) so its lifetime can tie back to the
    /// borrowed `&SftpSession` — a plain `FnOnce(&SftpSession) -> impl Future`
    /// can't express that borrow on stable.
    async fn with_sftp<T, F>(&self, f: F) -> Result<T, SsaError>
    where
        F: for<'a> FnOnce(&'a SftpSession) -> Pin<Box<dyn Future<Output = Result<T, SsaError>> + Send + 'a>>,
    {
        let handle = self.connect().await?;
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| SsaError::Transport(e.to_string()))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SsaError::Transport(e.to_string()))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SsaError::Transport(e.to_string()))?;

        let result = f(&sftp).await;
        let _ = sftp.close().await;
        drop(handle);
        result
    }
}

#[async_trait]
impl SnapshotAdapter for SshSnapshotTransport {
    async fn list_snapshots(&self) -> Result<Vec<SnapshotDescriptor>, SsaError> {
        let base_path = self.root_path();
        let s3_root_prefix = self.s3_root_prefix.clone();

        let result = self
            .with_sftp(move |sftp| {
                Box::pin(async move {
                    let mut descriptors = Vec::new();
                    let entries = sftp
                        .read_dir(&base_path)
                        .await
                        .map_err(|e| SsaError::Unavailable(e.to_string()))?;

                    for entry in entries {
                        let name = entry.file_name();
                        if name.starts_with('.') {
                            continue;
                        }
                        let verify_path = if s3_root_prefix.is_empty() || s3_root_prefix == "." {
                            format!("{base_path}/{name}")
                        } else {
                            format!("{base_path}/{name}/{s3_root_prefix}")
                        };
                        match sftp.metadata(&verify_path).await {
                            Ok(attrs) if attrs.is_dir() => {
                                descriptors.push(SnapshotDescriptor::from_name(name));
                            }
                            _ => continue,
                        }
                    }
                    Ok(descriptors)
                })
            })
            .await;

        let mut descriptors = match result {
            Ok(descriptors) => descriptors,
            Err(e) => {
                log::warn!("snapshot enumeration unavailable, degrading to empty set: {e}");
                Vec::new()
            }
        };

        snapshot_dir::sort_snapshots(&mut descriptors);
        Ok(descriptors)
    }

    async fn stat_snapshot_object(
        &self,
        snapshot: &str,
        bucket: &str,
        key: &str,
    ) -> Result<Option<FileInfo>, SsaError> {
        let path = snapshot_object_path(&self.snapshot_root, snapshot, &self.s3_root_prefix, bucket, key);
        let basename = key.rsplit('/').next().unwrap_or(key).to_string();

        self.with_sftp(move |sftp| {
            Box::pin(async move {
                match sftp.metadata(&path).await {
                    Ok(attrs) => Ok(Some(FileInfo {
                        path: path.clone(),
                        name: basename,
                        size: attrs.size.unwrap_or(0),
                        modified_time: mtime_to_utc(attrs.mtime),
                        is_dir: attrs.is_dir(),
                    })),
                    Err(e) if is_not_found(&e) => Ok(None),
                    Err(e) => Err(SsaError::Transport(e.to_string())),
                }
            })
        })
        .await
    }

    async fn read_snapshot_bytes(
        &self,
        snapshot: &str,
        bucket: &str,
        key: &str,
    ) -> Result<Vec<u8>, SsaError> {
        let path = snapshot_object_path(&self.snapshot_root, snapshot, &self.s3_root_prefix, bucket, key);

        self.with_sftp(move |sftp| {
            Box::pin(async move {
                use tokio::io::AsyncReadExt;

                let mut file = sftp.open(&path).await.map_err(|e| {
                    if is_not_found(&e) {
                        SsaError::NotFound
                    } else {
                        SsaError::Transport(e.to_string())
                    }
                })?;
                let mut buf = Vec::new();
                let mut chunk = vec![0u8; READ_CHUNK_SIZE];
                loop {
                    let n = file
                        .read(&mut chunk)
                        .await
                        .map_err(|e| SsaError::Transport(e.to_string()))?;
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                Ok(buf)
            })
        })
        .await
    }

    async fn list_snapshot_objects(
        &self,
        snapshot: &str,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<FileInfo>, SsaError> {
        let root = snapshot_root_path(&self.snapshot_root, snapshot, &self.s3_root_prefix);
        let base_path = if prefix.is_empty() {
            format!("{root}/{bucket}")
        } else {
            format!("{root}/{bucket}/{}", prefix.trim_end_matches('/'))
        };
        let prefix = prefix.to_string();

        let result = self
            .with_sftp(move |sftp| {
                Box::pin(async move {
                    let mut objects = Vec::new();
                    let entries = sftp
                        .read_dir(&base_path)
                        .await
                        .map_err(|e| SsaError::Unavailable(e.to_string()))?;

                    for entry in entries {
                        let name = entry.file_name();
                        if name.starts_with('.') {
                            continue;
                        }
                        let full_path = format!("{base_path}/{name}");
                        let key = if prefix.is_empty() {
                            name.to_string()
                        } else {
                            format!("{prefix}{name}")
                        };
                        let attrs = entry.metadata();
                        objects.push(FileInfo {
                            path: full_path,
                            name: key,
                            size: attrs.size.unwrap_or(0),
                            modified_time: mtime_to_utc(attrs.mtime),
                            is_dir: attrs.is_dir(),
                        });
                    }
                    Ok(objects)
                })
            })
            .await;

        match result {
            Ok(objects) => Ok(objects),
            Err(e) => {
                log::debug!("listing snapshot objects under {root} failed: {e}");
                Ok(Vec::new())
            }
        }
    }
}

/// SFTP reports a missing path as a `Status(NoSuchFile, ...)` response, not
/// a distinct error variant; everything else (permission, connection loss)
/// is a real transport problem and must not be mistaken for "not found".
fn is_not_found(err: &SftpError) -> bool {
    matches!(err, SftpError::Status(code, _) if *code == StatusCode::NoSuchFile)
}

fn mtime_to_utc(mtime: Option<u32>) -> DateTime<Utc> {
    DateTime::from_timestamp(mtime.unwrap_or(0) as i64, 0).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod test_path_construction {
    use super::*;

    #[test]
    fn nested_key_under_named_root_prefix() {
        let path = snapshot_object_path(".zfs", "daily_2025-12-01", "s3root", "my-bucket", "folder/file.txt");
        assert_eq!(path, ".zfs/daily_2025-12-01/s3root/my-bucket/folder/file.txt");
    }

    #[test]
    fn top_level_key_under_named_root_prefix() {
        let path = snapshot_object_path(".zfs", "hourly_2025-12-01_10", "s3root", "bucket", "file.txt");
        assert_eq!(path, ".zfs/hourly_2025-12-01_10/s3root/bucket/file.txt");
    }

    #[test]
    fn empty_root_prefix_is_elided() {
        let path = snapshot_object_path(".zfs", "snap1", "", "b", "k");
        assert_eq!(path, ".zfs/snap1/b/k");
    }

    #[test]
    fn dot_root_prefix_is_elided() {
        let path = snapshot_object_path(".zfs", "snap1", ".", "b", "k");
        assert_eq!(path, ".zfs/snap1/b/k");
    }

    #[test]
    fn expand_tilde_resolves_against_home_dir() {
        let home = dirs::home_dir().expect("test environment has a home dir");
        let expanded = expand_tilde(&PathBuf::from("~/.ssh/known_hosts"));
        assert_eq!(expanded, home.join(".ssh/known_hosts"));
    }

    #[test]
    fn expand_tilde_leaves_absolute_path_unchanged() {
        let path = PathBuf::from("/etc/ssh/known_hosts");
        assert_eq!(expand_tilde(&path), path);
    }
}
