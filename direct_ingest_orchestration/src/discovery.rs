//! Registration of raw files that state agencies drop into the ingest bucket.

use direct_ingest_metadata::RawFileMetadataManager;
use direct_ingest_types::{DirectIngestInstance, StateCode, filename::NormalizedRawFileName};
use futures::TryStreamExt;
use object_store::{ObjectMeta, ObjectStore, path::Path};
use observability_deps::tracing::{info, warn};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};

use crate::{Error, Result};

/// Bucket count key for files whose names do not follow the convention.
pub const UNNORMALIZED_FILE_TAG: &str = "UNNORMALIZED";
/// Bucket count key for files below the instance directory.
pub const IGNORED_IN_SUBDIRECTORY_FILE_TAG: &str = "IGNORED_IN_SUBDIRECTORY";

/// Prefix of the ingest bucket of an instance, e.g. `us_xx/secondary`.
pub fn ingest_bucket_prefix(state_code: &StateCode, instance: DirectIngestInstance) -> Path {
    Path::from(format!("{}/{}", state_code.lower(), instance.lower()))
}

/// What a discovery pass found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub newly_discovered: Vec<String>,
    pub already_discovered: usize,
    pub unnormalized: Vec<String>,
    pub ignored_in_subdirectory: usize,
}

/// A file in the ingest bucket, classified by its location and name.
enum BucketFile {
    Normalized(String, NormalizedRawFileName),
    Unnormalized(String),
    InSubdirectory,
}

#[derive(Debug, Clone)]
pub struct RawFileDiscovery {
    object_store: Arc<dyn ObjectStore>,
    raw_file_manager: RawFileMetadataManager,
}

impl RawFileDiscovery {
    pub fn new(object_store: Arc<dyn ObjectStore>, raw_file_manager: RawFileMetadataManager) -> Self {
        Self {
            object_store,
            raw_file_manager,
        }
    }

    fn prefix(&self) -> Path {
        ingest_bucket_prefix(
            self.raw_file_manager.region_code(),
            self.raw_file_manager.raw_data_instance(),
        )
    }

    async fn bucket_files(&self) -> Result<Vec<BucketFile>> {
        let prefix = self.prefix();
        let mut metas: Vec<ObjectMeta> = self
            .object_store
            .list(Some(&prefix))
            .try_collect()
            .await
            .map_err(|source| Error::IngestBucket {
                prefix: prefix.to_string(),
                source,
            })?;
        metas.sort_by(|a, b| a.location.cmp(&b.location));

        Ok(metas
            .into_iter()
            .filter_map(|meta| {
                let parts: Vec<_> = meta.location.prefix_match(&prefix)?.collect();
                let [name] = parts.as_slice() else {
                    return Some(BucketFile::InSubdirectory);
                };
                let name = name.as_ref().to_string();
                Some(match NormalizedRawFileName::parse(&name) {
                    Ok(parsed) => BucketFile::Normalized(name, parsed),
                    Err(e) => {
                        warn!(file = %meta.location, %e, "error getting file tag for file");
                        BucketFile::Unnormalized(name)
                    }
                })
            })
            .collect())
    }

    /// Registers every normalized, unprocessed file in the bucket that is not
    /// yet known. Already processed files are left alone.
    pub async fn discover(&self) -> Result<DiscoveryReport> {
        let mut report = DiscoveryReport::default();
        for file in self.bucket_files().await? {
            match file {
                BucketFile::Normalized(_, parsed) if parsed.processed => {
                    report.already_discovered += 1;
                }
                BucketFile::Normalized(name, _) => {
                    if self
                        .raw_file_manager
                        .has_raw_file_been_discovered(&name)
                        .await?
                    {
                        report.already_discovered += 1;
                    } else {
                        self.raw_file_manager
                            .mark_raw_file_as_discovered(&name)
                            .await?;
                        report.newly_discovered.push(name);
                    }
                }
                BucketFile::Unnormalized(name) => report.unnormalized.push(name),
                BucketFile::InSubdirectory => report.ignored_in_subdirectory += 1,
            }
        }

        info!(
            region_code = %self.raw_file_manager.region_code(),
            instance = %self.raw_file_manager.raw_data_instance(),
            newly_discovered = report.newly_discovered.len(),
            already_discovered = report.already_discovered,
            unnormalized = report.unnormalized.len(),
            "discovered raw files"
        );
        Ok(report)
    }

    /// Number of files in the bucket per file tag, with unparseable names under
    /// [`UNNORMALIZED_FILE_TAG`] and nested files under
    /// [`IGNORED_IN_SUBDIRECTORY_FILE_TAG`].
    pub async fn file_tag_counts(&self) -> Result<BTreeMap<String, u64>> {
        let mut counts = BTreeMap::new();
        for file in self.bucket_files().await? {
            let tag = match file {
                BucketFile::Normalized(_, parsed) => parsed.file_tag,
                BucketFile::Unnormalized(_) => UNNORMALIZED_FILE_TAG.to_string(),
                BucketFile::InSubdirectory => IGNORED_IN_SUBDIRECTORY_FILE_TAG.to_string(),
            };
            *counts.entry(tag).or_default() += 1;
        }
        Ok(counts)
    }
}
