//! PostgreSQL container configuration
//!
//! Every branch container runs the same shape: the branch dataset mounted
//! as the data volume, the branch WAL archive mounted at /wal-archive with
//! archiving enabled, and the project certs mounted read-only. WAL
//! archiving is always on so any branch can later serve as a PITR source.

/// In-container data directory. One level below the volume mount so
/// PostgreSQL's permission check on the directory itself passes.
pub const PGDATA: &str = "/var/lib/postgresql/data/pgdata";

/// In-container WAL archive mount.
pub const WAL_ARCHIVE_MOUNT: &str = "/wal-archive";

/// In-container certificate directory.
pub const CERT_MOUNT: &str = "/etc/ssl/certs/postgresql";

#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    pub username: String,
    pub password: String,
    pub database: String,
    /// Host path of the branch dataset mountpoint.
    pub data_dir: String,
    /// Host path of the WAL archive directory to mount. During PITR this
    /// is the source branch's archive.
    pub wal_archive_dir: String,
    /// Host path of the project certificate directory.
    pub cert_dir: String,
    /// Specific host port, or 0 to let the runtime pick one.
    pub host_port: u16,
}

impl ContainerConfig {
    /// Arguments for `docker create`, image and server command included.
    pub fn to_create_args(&self) -> Vec<String> {
        let publish = if self.host_port == 0 {
            "0.0.0.0::5432".to_string()
        } else {
            format!("0.0.0.0:{}:5432", self.host_port)
        };

        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            self.name.clone(),
            "-e".into(),
            format!("POSTGRES_PASSWORD={}", self.password),
            "-e".into(),
            format!("POSTGRES_USER={}", self.username),
            "-e".into(),
            format!("POSTGRES_DB={}", self.database),
            "-e".into(),
            format!("PGDATA={}", PGDATA),
            "-v".into(),
            format!("{}:/var/lib/postgresql/data", self.data_dir),
            "-v".into(),
            format!("{}:{}", self.wal_archive_dir, WAL_ARCHIVE_MOUNT),
            "-v".into(),
            format!("{}:{}:ro", self.cert_dir, CERT_MOUNT),
            "-p".into(),
            publish,
            "--restart".into(),
            "unless-stopped".into(),
            self.image.clone(),
            "postgres".into(),
        ];

        for setting in [
            "wal_level=replica".to_string(),
            "archive_mode=on".to_string(),
            format!(
                "archive_command=test ! -f {mount}/%f && cp %p {mount}/%f",
                mount = WAL_ARCHIVE_MOUNT
            ),
            format!("restore_command=cp {}/%f %p", WAL_ARCHIVE_MOUNT),
            "max_wal_senders=3".to_string(),
            "wal_keep_size=1GB".to_string(),
            "ssl=on".to_string(),
            format!("ssl_cert_file={}/server.crt", CERT_MOUNT),
            format!("ssl_key_file={}/server.key", CERT_MOUNT),
        ] {
            args.push("-c".into());
            args.push(setting);
        }

        args
    }
}
