//! CLI handling for the blob store holding ingest buckets, locks and task queues.

use object_store::{DynObjectStore, local::LocalFileSystem, memory::InMemory};
use observability_deps::tracing::{info, warn};
use snafu::{ResultExt, Snafu};
use std::{fs, path::PathBuf, sync::Arc};

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum ParseError {
    #[snafu(display("Unable to create data directory {:?}: {}", path, source))]
    CreatingDataDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to create local store {:?}: {}", path, source))]
    CreateLocalFileSystem {
        path: PathBuf,
        source: object_store::Error,
    },

    #[snafu(display(
        "Specified {:?} for the object store, required configuration missing for {}",
        object_store,
        missing
    ))]
    MissingObjectStoreConfig {
        object_store: ObjectStoreType,
        missing: String,
    },

    #[snafu(display("Error configuring GCS: {}", source))]
    InvalidGCSConfig { source: object_store::Error },

    #[snafu(display("GCS support not enabled, recompile with the gcp feature enabled"))]
    GcsNotEnabled,
}

/// Object store type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
pub enum ObjectStoreType {
    /// In-memory. Nothing survives the process, useful for trying things out.
    Memory,

    /// Local file system, rooted at `--data-dir`.
    File,

    /// Google Cloud Storage.
    Google,
}

/// CLI config for the object store.
#[derive(Debug, Clone, clap::Parser)]
pub struct ObjectStoreConfig {
    /// Which object storage to use.
    #[clap(
        value_enum,
        long = "object-store",
        env = "DIRECT_INGEST_OBJECT_STORE",
        default_value = "memory",
        action
    )]
    pub object_store: ObjectStoreType,

    /// Root directory of the `file` object store.
    #[clap(long = "data-dir", env = "DIRECT_INGEST_DATA_DIR", action)]
    pub data_dir: Option<PathBuf>,

    /// Name of the bucket to use for the `google` object store.
    #[clap(long = "bucket", env = "DIRECT_INGEST_BUCKET", action)]
    pub bucket: Option<String>,

    /// When using Google Cloud Storage, path to the JSON file that contains
    /// the service account credentials.
    #[clap(
        long = "google-service-account",
        env = "GOOGLE_SERVICE_ACCOUNT",
        action
    )]
    pub google_service_account: Option<String>,
}

impl ObjectStoreConfig {
    /// Config for a file store in `data_dir`, or an in-memory store.
    pub fn new(data_dir: Option<PathBuf>) -> Self {
        Self {
            object_store: if data_dir.is_some() {
                ObjectStoreType::File
            } else {
                ObjectStoreType::Memory
            },
            data_dir,
            bucket: None,
            google_service_account: None,
        }
    }

    pub fn make_object_store(&self) -> Result<Arc<DynObjectStore>, ParseError> {
        if let Some(data_dir) = &self.data_dir {
            if self.object_store != ObjectStoreType::File {
                warn!(?data_dir, object_store_type = ?self.object_store,
                      "--data-dir / `DIRECT_INGEST_DATA_DIR` ignored. It only affects 'file' object stores");
            }
        }

        let object_store: Arc<DynObjectStore> = match &self.object_store {
            ObjectStoreType::Memory => {
                info!(object_store_type = "Memory", "Object Store");
                Arc::new(InMemory::new())
            }
            ObjectStoreType::File => self.new_local_file_system()?,
            ObjectStoreType::Google => self.new_gcs()?,
        };

        Ok(object_store)
    }

    fn new_local_file_system(&self) -> Result<Arc<DynObjectStore>, ParseError> {
        let Some(data_dir) = self.data_dir.as_ref() else {
            return MissingObjectStoreConfigSnafu {
                object_store: ObjectStoreType::File,
                missing: "data-dir",
            }
            .fail();
        };
        info!(?data_dir, object_store_type = "Directory", "Object Store");
        fs::create_dir_all(data_dir).context(CreatingDataDirectorySnafu { path: data_dir })?;

        let store = LocalFileSystem::new_with_prefix(data_dir)
            .context(CreateLocalFileSystemSnafu { path: data_dir })?
            .with_automatic_cleanup(true);
        Ok(Arc::new(store))
    }

    #[cfg(feature = "gcp")]
    fn new_gcs(&self) -> Result<Arc<DynObjectStore>, ParseError> {
        use object_store::gcp::GoogleCloudStorageBuilder;

        info!(bucket = ?self.bucket, object_store_type = "GCS", "Object Store");

        let Some(bucket) = &self.bucket else {
            return MissingObjectStoreConfigSnafu {
                object_store: ObjectStoreType::Google,
                missing: "bucket",
            }
            .fail();
        };
        let mut builder = GoogleCloudStorageBuilder::new().with_bucket_name(bucket);
        if let Some(account) = &self.google_service_account {
            builder = builder.with_service_account_path(account);
        }

        Ok(Arc::new(builder.build().context(InvalidGCSConfigSnafu)?))
    }

    #[cfg(not(feature = "gcp"))]
    fn new_gcs(&self) -> Result<Arc<DynObjectStore>, ParseError> {
        GcsNotEnabledSnafu.fail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use object_store::{ObjectStore, path::Path};
    use std::env;
    use tempfile::TempDir;

    #[test]
    fn default_object_store_is_memory() {
        let config = ObjectStoreConfig::try_parse_from(["server"]).unwrap();

        let object_store = config.make_object_store().unwrap();
        assert_eq!(&object_store.to_string(), "InMemory")
    }

    #[tokio::test]
    async fn valid_file_config() {
        let root = TempDir::new().unwrap();
        let root_path = root.path().to_str().unwrap();

        let config = ObjectStoreConfig::try_parse_from([
            "server",
            "--object-store",
            "file",
            "--data-dir",
            root_path,
        ])
        .unwrap();

        let object_store = config.make_object_store().unwrap();
        object_store
            .put(&Path::from("us_xx/primary/a.csv"), "x".into())
            .await
            .unwrap();
        assert!(root.path().join("us_xx/primary/a.csv").exists());
    }

    #[test]
    fn file_config_missing_params() {
        let mut config =
            ObjectStoreConfig::try_parse_from(["server", "--object-store", "file"]).unwrap();
        // the env var may be set in CI
        config.data_dir = None;

        let err = config.make_object_store().unwrap_err().to_string();
        assert_eq!(
            err,
            "Specified File for the object store, required configuration missing for \
            data-dir"
        );
    }

    #[test]
    fn new_picks_store_from_data_dir() {
        assert_eq!(
            ObjectStoreConfig::new(None).object_store,
            ObjectStoreType::Memory
        );
        assert_eq!(
            ObjectStoreConfig::new(Some(env::temp_dir())).object_store,
            ObjectStoreType::File
        );
    }
}
