pub mod config;
pub mod osa;
pub mod snapshot_dir;
pub mod ssa;
pub mod version_mapper;

use crate::config::Config;
use crate::osa::S3Gateway;
use crate::ssa::SshSnapshotTransport;
use crate::version_mapper::VersionMapper;

/// Wires a `VersionMapper` against the real S3 and SFTP transports from a
/// validated `Config`. A construction convenience, not a process-wide
/// singleton — callers that need fakes should build `VersionMapper`
/// directly from their own adapters.
pub fn build_mapper(config: &Config) -> VersionMapper {
    let osa = S3Gateway::new(&config.s3_endpoint, &config.s3_access_key, &config.s3_secret_key);

    let ssa = SshSnapshotTransport::new(
        config.rsync_host.clone(),
        config.rsync_port,
        config.rsync_user.clone(),
        config.ssh_key_path.clone(),
        config.ssh_strict_host_key_checking,
        config.ssh_known_hosts_path.clone(),
        config.snapshot_dir.clone(),
        config.s3_root_prefix.clone(),
    );

    VersionMapper::new(std::sync::Arc::new(osa), std::sync::Arc::new(ssa))
}
