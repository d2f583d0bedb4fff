//* Object Store Adapter: the live S3-compatible side (spec §4.1).
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt::{self, Formatter};

#[derive(Debug)]
pub enum OsaError {
    NotFound,
    Transport(String),
}

impl std::error::Error for OsaError {}

impl fmt::Display for OsaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OsaError::NotFound => write!(f, "object not found"),
            OsaError::Transport(msg) => write!(f, "S3 transport error: {msg}"),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BucketInfo {
    pub name: String,
    pub creation_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FolderSummary {
    pub name: String,
    pub prefix: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ObjectSummary {
    pub name: String,
    pub key: String,
    pub size: i64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ObjectListing {
    pub folders: Vec<FolderSummary>,
    pub files: Vec<ObjectSummary>,
    pub is_truncated: bool,
    pub prefix: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ObjectMetadata {
    pub key: String,
    pub size: i64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub content_type: String,
    pub metadata: HashMap<String, String>,
}

/// The five S3 operations the core needs (spec §4.1). A trait so the
/// Version Mapper can be built against a fake for tests (spec §9).
#[async_trait]
pub trait ObjectStoreAdapter: Send + Sync {
    async fn list_buckets(&self) -> Result<Vec<BucketInfo>, OsaError>;

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: &str,
        max_keys: i32,
    ) -> Result<ObjectListing, OsaError>;

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectMetadata>, OsaError>;

    async fn get_object_bytes(&self, bucket: &str, key: &str) -> Result<Bytes, OsaError>;
}

/// Talks to the live S3-compatible gateway: path-style addressing, SigV4,
/// explicit endpoint and credentials (no profile/instance-role chain).
pub struct S3Gateway {
    client: Client,
}

impl S3Gateway {
    pub fn new(endpoint: &str, access_key: &str, secret_key: &str) -> Self {
        let credentials = Credentials::new(access_key, secret_key, None, None, "snaptime-config");
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new("us-east-1"))
            .endpoint_url(endpoint)
            .force_path_style(true)
            .build();
        S3Gateway {
            client: Client::from_conf(config),
        }
    }
}

#[async_trait]
impl ObjectStoreAdapter for S3Gateway {
    async fn list_buckets(&self) -> Result<Vec<BucketInfo>, OsaError> {
        let response = self
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|e| OsaError::Transport(e.to_string()))?;

        Ok(response
            .buckets()
            .iter()
            .filter_map(|b| {
                b.name().map(|name| BucketInfo {
                    name: name.to_string(),
                    creation_time: b.creation_date().map(to_chrono),
                })
            })
            .collect())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: &str,
        max_keys: i32,
    ) -> Result<ObjectListing, OsaError> {
        let mut request = self.client.list_objects_v2().bucket(bucket).max_keys(max_keys);
        if !prefix.is_empty() {
            request = request.prefix(prefix);
        }
        if !delimiter.is_empty() {
            request = request.delimiter(delimiter);
        }

        let response = request
            .send()
            .await
            .map_err(|e| OsaError::Transport(e.to_string()))?;

        let folders = response
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix())
            .map(|folder_prefix| {
                let name = folder_prefix
                    .trim_end_matches('/')
                    .rsplit('/')
                    .next()
                    .unwrap_or("")
                    .to_string();
                FolderSummary {
                    name,
                    prefix: folder_prefix.to_string(),
                }
            })
            .collect();

        let files = response
            .contents()
            .iter()
            .filter_map(|obj| {
                let key = obj.key()?;
                if key == prefix {
                    return None;
                }
                let name = key.rsplit('/').next().unwrap_or("");
                if name.is_empty() {
                    return None;
                }
                Some(ObjectSummary {
                    name: name.to_string(),
                    key: key.to_string(),
                    size: obj.size().unwrap_or(0),
                    last_modified: obj.last_modified().map(to_chrono),
                    etag: obj.e_tag().map(|e| e.trim_matches('"').to_string()),
                })
            })
            .collect();

        Ok(ObjectListing {
            folders,
            files,
            is_truncated: response.is_truncated().unwrap_or(false),
            prefix: prefix.to_string(),
        })
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectMetadata>, OsaError> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(output) => Ok(Some(ObjectMetadata {
                key: key.to_string(),
                size: output.content_length().unwrap_or(0),
                last_modified: output.last_modified().map(to_chrono),
                etag: output.e_tag().map(|e| e.trim_matches('"').to_string()),
                content_type: output
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string(),
                metadata: output.metadata().cloned().unwrap_or_default(),
            })),
            Err(SdkError::ServiceError(e)) if matches!(e.err(), HeadObjectError::NotFound(_)) => {
                Ok(None)
            }
            Err(e) => Err(OsaError::Transport(e.to_string())),
        }
    }

    async fn get_object_bytes(&self, bucket: &str, key: &str) -> Result<Bytes, OsaError> {
        let output = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(output) => output,
            Err(SdkError::ServiceError(e)) if matches!(e.err(), GetObjectError::NoSuchKey(_)) => {
                return Err(OsaError::NotFound);
            }
            Err(e) => return Err(OsaError::Transport(e.to_string())),
        };

        let aggregated = output
            .body
            .collect()
            .await
            .map_err(|e| OsaError::Transport(e.to_string()))?;
        Ok(aggregated.into_bytes())
    }
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> DateTime<Utc> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()).unwrap_or_else(Utc::now)
}
