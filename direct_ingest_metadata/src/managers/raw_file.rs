use chrono::{DateTime, Utc};
use direct_ingest_types::{
    DirectIngestInstance, DirectIngestInstanceError, RawFileMetadata, RawFileTagSummary,
    StateCode, filename::NormalizedRawFileName,
};
use observability_deps::tracing::info;
use snafu::ResultExt;
use std::{collections::BTreeMap, sync::Arc};

use super::{Error, FileNameSnafu, Result};
use crate::interface::{self, Catalog, RawFileMetadataParams};

/// Raw file bookkeeping for one region and raw data instance.
#[derive(Debug, Clone)]
pub struct RawFileMetadataManager {
    catalog: Arc<dyn Catalog>,
    region_code: StateCode,
    raw_data_instance: DirectIngestInstance,
}

impl RawFileMetadataManager {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        region_code: StateCode,
        raw_data_instance: DirectIngestInstance,
    ) -> Self {
        Self {
            catalog,
            region_code,
            raw_data_instance,
        }
    }

    pub fn region_code(&self) -> &StateCode {
        &self.region_code
    }

    pub fn raw_data_instance(&self) -> DirectIngestInstance {
        self.raw_data_instance
    }

    fn now(&self) -> DateTime<Utc> {
        self.catalog.time_provider().now().date_time()
    }

    /// Records a newly found raw file. Discovering the same file again returns
    /// the existing row.
    pub async fn mark_raw_file_as_discovered(
        &self,
        normalized_file_name: &str,
    ) -> Result<RawFileMetadata> {
        let parsed = NormalizedRawFileName::parse(normalized_file_name).context(FileNameSnafu)?;
        let params = RawFileMetadataParams {
            region_code: self.region_code.clone(),
            raw_data_instance: self.raw_data_instance,
            file_tag: parsed.file_tag,
            normalized_file_name: normalized_file_name.to_string(),
            update_datetime: parsed.update_datetime,
            file_discovery_time: self.now(),
        };

        let mut repos = self.catalog.repositories().await;
        match repos.raw_files().create(&params).await {
            Ok(row) => {
                info!(
                    region_code = %self.region_code,
                    instance = %self.raw_data_instance,
                    file_tag = %row.file_tag,
                    normalized_file_name,
                    "discovered raw file"
                );
                Ok(row)
            }
            Err(interface::Error::RawFileExists { .. }) => repos
                .raw_files()
                .get_by_normalized_file_name(
                    &self.region_code,
                    self.raw_data_instance,
                    normalized_file_name,
                )
                .await?
                .ok_or_else(|| self.not_discovered(normalized_file_name)),
            Err(e) => Err(e.into()),
        }
    }

    fn not_discovered(&self, normalized_file_name: &str) -> Error {
        Error::RawFileNotDiscovered {
            region_code: self.region_code.clone(),
            instance: self.raw_data_instance,
            normalized_file_name: normalized_file_name.to_string(),
        }
    }

    pub async fn get_raw_file_metadata(&self, normalized_file_name: &str) -> Result<RawFileMetadata> {
        self.catalog
            .repositories()
            .await
            .raw_files()
            .get_by_normalized_file_name(&self.region_code, self.raw_data_instance, normalized_file_name)
            .await?
            .ok_or_else(|| self.not_discovered(normalized_file_name))
    }

    pub async fn has_raw_file_been_discovered(&self, normalized_file_name: &str) -> Result<bool> {
        Ok(self
            .catalog
            .repositories()
            .await
            .raw_files()
            .get_by_normalized_file_name(&self.region_code, self.raw_data_instance, normalized_file_name)
            .await?
            .is_some())
    }

    pub async fn has_raw_file_been_processed(&self, normalized_file_name: &str) -> Result<bool> {
        Ok(self
            .catalog
            .repositories()
            .await
            .raw_files()
            .get_by_normalized_file_name(&self.region_code, self.raw_data_instance, normalized_file_name)
            .await?
            .is_some_and(|f| f.is_processed()))
    }

    pub async fn mark_raw_file_as_processed(
        &self,
        normalized_file_name: &str,
    ) -> Result<RawFileMetadata> {
        let result = self
            .catalog
            .repositories()
            .await
            .raw_files()
            .mark_processed(
                &self.region_code,
                self.raw_data_instance,
                normalized_file_name,
                self.now(),
            )
            .await;
        match result {
            Ok(row) => Ok(row),
            Err(interface::Error::RawFileNotFound { .. }) => {
                Err(self.not_discovered(normalized_file_name))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Non-invalidated files of `file_tag` discovered strictly after `cutoff`,
    /// or all of them when `cutoff` is `None`.
    pub async fn get_metadata_for_raw_files_discovered_after_datetime(
        &self,
        file_tag: &str,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawFileMetadata>> {
        Ok(self
            .catalog
            .repositories()
            .await
            .raw_files()
            .list_discovered_after(&self.region_code, self.raw_data_instance, file_tag, cutoff)
            .await?)
    }

    /// Every non-invalidated file of the instance. A rerun with raw data import
    /// may only start when this is empty.
    pub async fn get_non_invalidated_files(&self) -> Result<Vec<RawFileMetadata>> {
        Ok(self
            .catalog
            .repositories()
            .await
            .raw_files()
            .list(&self.region_code, self.raw_data_instance)
            .await?)
    }

    /// Per file tag counts and watermarks of the instance.
    pub async fn get_metadata_for_all_raw_files_in_region(
        &self,
    ) -> Result<BTreeMap<String, RawFileTagSummary>> {
        Ok(summarize(self.get_non_invalidated_files().await?))
    }

    pub async fn mark_instance_data_invalidated(&self) -> Result<u64> {
        let count = self
            .catalog
            .repositories()
            .await
            .raw_files()
            .invalidate_all(&self.region_code, self.raw_data_instance)
            .await?;
        info!(
            region_code = %self.region_code,
            instance = %self.raw_data_instance,
            count,
            "invalidated raw file metadata"
        );
        Ok(count)
    }

    /// Moves all metadata of this instance to `new_instance`, which must not have
    /// any non-invalidated metadata of its own.
    pub async fn transfer_metadata_to_new_instance(
        &self,
        new_instance: DirectIngestInstance,
    ) -> Result<u64> {
        if new_instance == self.raw_data_instance {
            return Err(DirectIngestInstanceError::new(format!(
                "Either state codes are not the same or new instance is same as origin: \
                 {region}/{instance} -> {region}/{new_instance}",
                region = self.region_code,
                instance = self.raw_data_instance,
            ))
            .into());
        }

        let mut txn = self.catalog.start_transaction().await?;
        let existing = txn
            .raw_files()
            .list(&self.region_code, new_instance)
            .await?;
        if !existing.is_empty() {
            txn.abort().await?;
            return Err(DirectIngestInstanceError::new(format!(
                "Destination instance should not have any valid raw file metadata rows: \
                 {} has {} for {}",
                new_instance,
                existing.len(),
                self.region_code
            ))
            .into());
        }
        let count = txn
            .raw_files()
            .transfer(&self.region_code, self.raw_data_instance, new_instance)
            .await?;
        txn.commit().await?;

        info!(
            region_code = %self.region_code,
            from = %self.raw_data_instance,
            to = %new_instance,
            count,
            "transferred raw file metadata"
        );
        Ok(count)
    }
}

fn summarize(files: Vec<RawFileMetadata>) -> BTreeMap<String, RawFileTagSummary> {
    let mut summaries: BTreeMap<String, RawFileTagSummary> = BTreeMap::new();
    for file in files {
        let summary = summaries
            .entry(file.file_tag.clone())
            .or_insert_with(|| RawFileTagSummary {
                file_tag: file.file_tag.clone(),
                number_processed_files: 0,
                number_unprocessed_files: 0,
                latest_discovery_time: file.file_discovery_time,
                latest_processed_time: None,
                latest_update_datetime: file.update_datetime,
            });
        if file.is_processed() {
            summary.number_processed_files += 1;
        } else {
            summary.number_unprocessed_files += 1;
        }
        summary.latest_discovery_time = summary.latest_discovery_time.max(file.file_discovery_time);
        summary.latest_update_datetime = summary.latest_update_datetime.max(file.update_datetime);
        summary.latest_processed_time = summary.latest_processed_time.max(file.file_processed_time);
    }
    summaries
}
