//! Step actions of the state machine.

use std::collections::HashSet;

use loopnode_core::job::Job;
use loopnode_core::messages::EVENT_UPDATE_TRAINING;
use loopnode_transfer::TransferService;
use tokio_util::sync::CancellationToken;

use crate::hooks::ImageFile;
use crate::machine::JobStateMachine;
use crate::StepError;

/// Workflow stages whose images are evaluated after training.
const DETECTION_STAGES: [&str; 4] = ["inbox", "annotate", "review", "complete"];

/// Manifest written by the Loop into every model archive.
const MODEL_MANIFEST: &str = "model.json";
/// Name the base model's manifest is moved to.
const BASE_MODEL_MANIFEST: &str = "base_model.json";

impl JobStateMachine {
    /// Fetch the annotated dataset and its images.
    pub(crate) async fn prepare(&self, job: &mut Job) -> Result<(), StepError> {
        create_dir(&job.images_folder).await?;
        create_dir(&job.training_folder).await?;

        let config = self.transfer.config();
        let ids = self
            .transfer
            .fetch_id_list(&job.context, "state=complete")
            .await?;
        let records = self
            .transfer
            .fetch_metadata(&job.context, &ids, config.metadata_chunk_size)
            .await;
        self.transfer
            .download_files(&job.context, &ids, &job.images_folder, config.download_chunk_size)
            .await?;

        let mut usable = Vec::with_capacity(records.len());
        for record in records {
            let path = TransferService::image_path(&job.images_folder, &record.id);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                usable.push(record);
            }
        }

        let skipped = ids.len().saturating_sub(usable.len());
        tracing::info!(
            job_id = %job.id,
            images = usable.len(),
            skipped,
            "Dataset prepared",
        );
        job.image_data = Some(usable);
        job.skipped_image_count = Some(skipped);
        Ok(())
    }

    /// Download the base model when it is a remote model id.
    pub(crate) async fn download_model(&self, job: &mut Job) -> Result<(), StepError> {
        let Some(model_id) = job.remote_base_model() else {
            tracing::info!(
                job_id = %job.id,
                base_model = job.base_model_uuid_or_name.as_deref().unwrap_or("none"),
                "No remote base model to download",
            );
            return Ok(());
        };

        create_dir(&job.training_folder).await?;
        self.transfer
            .download_model_archive(
                &job.training_folder,
                &job.context,
                &model_id.to_string(),
                self.hooks.model_format(),
            )
            .await?;

        let manifest = job.training_folder.join(MODEL_MANIFEST);
        if tokio::fs::try_exists(&manifest).await.unwrap_or(false) {
            tokio::fs::rename(&manifest, job.training_folder.join(BASE_MODEL_MANIFEST)).await?;
        }
        Ok(())
    }

    /// Start the training process and wait for it to exit.
    pub(crate) async fn run_training(
        &self,
        job: &mut Job,
        stop: &CancellationToken,
    ) -> Result<(), StepError> {
        let mut process = self.hooks.start_training(job).await?;

        loop {
            if stop.is_cancelled() {
                process.terminate(self.config.terminate_grace).await;
                return Err(StepError::Cancelled);
            }
            if !process.is_running().await {
                break;
            }

            tokio::select! {
                _ = stop.cancelled() => continue,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            if let Err(e) = self.sync_confusion_matrix(job).await {
                tracing::debug!(job_id = %job.id, error = %e, "Metrics sync during training failed");
            }
        }

        if let Some(error) = self.hooks.extract_error(job).await {
            return Err(StepError::Failed(error));
        }
        Ok(())
    }

    /// Report the metrics of a new best checkpoint, if there is one.
    pub(crate) async fn sync_confusion_matrix(&self, job: &mut Job) -> Result<(), StepError> {
        let Some(metrics) = self.hooks.new_best_model(job).await? else {
            return Ok(());
        };

        let payload = serde_json::json!({
            "organization": job.context.organization,
            "project": job.context.project,
            "trainer_id": self.node_id,
            "job_id": job.id,
            "confusion_matrix": metrics.confusion_matrix,
            "meta_information": metrics.meta_information,
            "train_image_count": job.train_image_count(),
            "test_image_count": job.test_image_count(),
            "hyperparameters": job.hyperparameters,
        });
        let reply = self.remote.call(EVENT_UPDATE_TRAINING, payload).await?;

        if reply.get("success").and_then(|v| v.as_bool()) == Some(false) {
            let message = reply
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("update_training rejected by the Loop");
            return Err(StepError::Failed(message.to_string()));
        }
        tracing::info!(job_id = %job.id, "Metrics of new best model synced");
        Ok(())
    }

    /// Upload the latest model in every format not uploaded yet.
    pub(crate) async fn upload_model(&self, job: &mut Job) -> Result<(), StepError> {
        let files = self
            .hooks
            .latest_model_files(job)
            .await?
            .filter(|files| files.values().any(|paths| !paths.is_empty()))
            .ok_or_else(|| StepError::Critical("no model files could be produced".into()))?;

        let markers = Self::markers(job);
        let already = markers.uploaded_model_formats().await?;

        let manifest = job.training_folder.join(MODEL_MANIFEST);
        let content = serde_json::json!({
            "categories": job.categories,
            "hyperparameters": job.hyperparameters,
            "model_variant": job.model_variant,
        });
        create_dir(&job.training_folder).await?;
        tokio::fs::write(&manifest, serde_json::to_vec_pretty(&content)?).await?;

        for (format, paths) in files {
            if paths.is_empty() {
                continue;
            }
            if already.contains(&format) {
                tracing::info!(job_id = %job.id, format = %format, "Model format already uploaded");
                continue;
            }

            let mut upload = paths;
            upload.push(manifest.clone());
            let model_id = self
                .transfer
                .upload_model(&job.context, job.job_number, &format, &upload)
                .await?;

            if format == self.hooks.model_format() || job.model_uuid_for_detecting.is_none() {
                job.model_uuid_for_detecting = Some(model_id);
            }
            markers.mark_model_format_uploaded(&format).await?;
            self.store.save(job).await?;
        }

        if job.model_uuid_for_detecting.is_none() {
            return Err(StepError::Failed(
                "model formats are marked uploaded but no model id is known".into(),
            ));
        }
        Ok(())
    }

    /// Evaluate the new model on every image of the project, one shard
    /// file per batch. The id list is frozen on the first attempt so shard
    /// `n` always covers the same images.
    pub(crate) async fn detect(&self, job: &mut Job, stop: &CancellationToken) -> Result<(), StepError> {
        let model_id = job
            .model_uuid_for_detecting
            .clone()
            .ok_or_else(|| StepError::Critical("no uploaded model to detect with".into()))?;

        let model_folder = Self::detection_model_folder(job);
        if !has_entries(&model_folder).await {
            self.transfer
                .download_model_archive(&model_folder, &job.context, &model_id, self.hooks.model_format())
                .await?;
        }

        let markers = Self::markers(job);
        let ids = match markers.detection_image_ids().await? {
            Some(ids) => ids,
            None => {
                let ids = self.detection_image_ids(job).await?;
                markers.set_detection_image_ids(&ids).await?;
                ids
            }
        };

        let chunk_size = self.transfer.config().download_chunk_size;
        self.transfer
            .download_files(&job.context, &ids, &job.images_folder, chunk_size)
            .await?;

        let done = markers.shard_indices().await?;
        let batch_size = self.config.detection_batch_size.max(1);
        let total = ids.len().div_ceil(batch_size);
        let progress = self.transfer.progress();

        for (index, batch_ids) in ids.chunks(batch_size).enumerate() {
            if stop.is_cancelled() {
                return Err(StepError::Cancelled);
            }
            if done.contains(&index) {
                continue;
            }
            let mut batch = Vec::with_capacity(batch_ids.len());
            for id in batch_ids {
                let path = TransferService::image_path(&job.images_folder, id);
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    batch.push(ImageFile { id: id.clone(), path });
                }
            }
            let detections = if batch.is_empty() {
                Vec::new()
            } else {
                self.hooks.detect_batch(job, &model_folder, &batch).await?
            };
            markers.write_shard(index, &detections).await?;
            progress.report(0.0, 1.0, index + 1, total);
            tracing::info!(job_id = %job.id, shard = index, images = batch.len(), "Detection shard written");
        }
        Ok(())
    }

    /// Image ids of every detection stage, in stage order and without
    /// duplicates.
    async fn detection_image_ids(&self, job: &Job) -> Result<Vec<String>, StepError> {
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for stage in DETECTION_STAGES {
            let stage_ids = self
                .transfer
                .fetch_id_list(&job.context, &format!("state={stage}"))
                .await?;
            ids.extend(stage_ids.into_iter().filter(|id| seen.insert(id.clone())));
        }
        Ok(ids)
    }

    /// Upload all shards, resuming at the persisted shard and row.
    pub(crate) async fn upload_detections(&self, job: &mut Job) -> Result<(), StepError> {
        let markers = Self::markers(job);
        let indices = markers.shard_indices().await?;
        if indices.is_empty() {
            tracing::info!(job_id = %job.id, "No detections to upload");
            return Ok(());
        }

        let start = markers.detection_shard_index().await?;
        let batch_size = self.config.detection_upload_batch_size.max(1);
        let progress = self.transfer.progress();
        let total = indices.len();

        for (position, index) in indices.into_iter().enumerate() {
            if index < start {
                continue;
            }
            markers.set_detection_shard_index(index).await?;
            let Some(shard) = markers.read_shard(index).await? else {
                continue;
            };

            let mut offset = markers.detection_upload_offset().await?;
            while offset < shard.len() {
                let end = (offset + batch_size).min(shard.len());
                self.transfer
                    .upload_detections(&job.context, &shard[offset..end])
                    .await?;
                offset = end;
                markers.set_detection_upload_offset(offset).await?;
            }

            markers.set_detection_upload_offset(0).await?;
            markers.set_detection_shard_index(index + 1).await?;
            progress.report(0.0, 1.0, position + 1, total);
            tracing::info!(job_id = %job.id, shard = index, records = shard.len(), "Detection shard uploaded");
        }
        Ok(())
    }
}

async fn create_dir(path: &std::path::Path) -> Result<(), StepError> {
    tokio::fs::create_dir_all(path).await?;
    Ok(())
}

async fn has_entries(path: &std::path::Path) -> bool {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}
