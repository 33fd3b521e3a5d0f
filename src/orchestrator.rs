// SPDX-License-Identifier: MIT

//! Cycle orchestrator: capture -> classify -> notify -> archive -> log
//!
//! One iteration per fixed interval, forever, with each stage's failure
//! scoped to that stage's own data. The only full escape hatch is capture
//! failure (there is no image to act on); every other stage degrades to a
//! safe default: no detection, not notified, kept at its original path.
//! No error ever propagates out of the loop; it stops only on the shutdown
//! signal.

use base64::{engine::general_purpose, Engine as _};
use chrono::{Local, Utc};
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::area::{Archived, ImageArea};
use crate::capture::CaptureSource;
use crate::classifier::{Classification, Classify};
use crate::config::AppConfig;
use crate::db::{Database, Detection, NewDetection};
use crate::notifier::Notify;
use crate::Result;

/// What one cycle did, for logging and tests
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Capture failed; no file, no record
    Skipped,
    /// The cycle ran to completion (possibly degraded)
    Completed(CycleReport),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub filename: String,
    pub detection: Detection,
    pub notified: bool,
    /// Final on-disk path of the original image
    pub image_path: std::path::PathBuf,
    pub processed_filename: Option<String>,
    /// False when the log append failed (the event is then lost from the
    /// store but the loop keeps running)
    pub logged: bool,
}

/// Drives the capture-classify-notify-persist loop for one camera
pub struct Orchestrator {
    config: AppConfig,
    area: ImageArea,
    db: Database,
    capture: Box<dyn CaptureSource>,
    classifier: Box<dyn Classify>,
    notifier: Option<Box<dyn Notify>>,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        area: ImageArea,
        db: Database,
        capture: Box<dyn CaptureSource>,
        classifier: Box<dyn Classify>,
        notifier: Option<Box<dyn Notify>>,
    ) -> Self {
        Self {
            config,
            area,
            db,
            capture,
            classifier,
            notifier,
        }
    }

    /// Run cycles until the shutdown channel flips, then release the camera
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.area.ensure_dirs()?;
        let interval = Duration::from_secs(self.config.interval_secs);
        info!(
            "Detection loop started for camera '{}', interval {}s",
            self.config.camera.name, self.config.interval_secs
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_cycle().await {
                CycleOutcome::Skipped => info!("Cycle skipped, retrying after interval"),
                CycleOutcome::Completed(report) => info!(
                    "Cycle complete: {} -> {}",
                    report.filename,
                    report.detection.label().unwrap_or("no detection")
                ),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.capture.release();
        info!("Detection loop stopped");
        Ok(())
    }

    /// Run exactly one cycle. Never returns an error: every stage failure
    /// is absorbed according to the failure policy.
    pub async fn run_cycle(&self) -> CycleOutcome {
        // Stage 1-2: unique filename + capture
        let inbox_path = self.area.next_capture_path(&self.config.camera.name, "jpg");
        let filename = inbox_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let captured_at = Utc::now();

        if let Err(e) = self.capture.capture(&inbox_path).await {
            error!("Capture failed: {}", e);
            // The device may have written a partial file before failing;
            // remove it so no orphan without a record accumulates in inbox
            let _ = std::fs::remove_file(&inbox_path);
            return CycleOutcome::Skipped;
        }
        info!("Captured {}", filename);

        // Stage 3: classify; failure degrades to no detection
        let classification = match self.classifier.classify(&inbox_path).await {
            Ok(c) => c,
            Err(e) => {
                error!("Classification failed, treating as no detection: {}", e);
                Classification::default()
            }
        };
        let detection = match classification.best() {
            Some(p) => {
                info!(
                    "Insect detected: {} (confidence {:.2})",
                    p.class, p.confidence
                );
                Detection::Insect {
                    label: p.class.clone(),
                    confidence: p.confidence,
                }
            }
            None => {
                info!("No insects detected");
                Detection::None
            }
        };

        // Stage 4: notify, only when a backend is configured
        let notified = match &self.notifier {
            Some(notifier) => {
                self.send_notification(
                    notifier.as_ref(),
                    &detection,
                    &inbox_path,
                    classification.annotated_image.as_deref(),
                )
                .await
            }
            None => false,
        };

        // Stage 5: archive; failure keeps the inbox path
        let archived = self.area.archive(&inbox_path, &detection);
        let image_path = archived.path().to_path_buf();
        if let Archived::Retained(_) = archived {
            warn!("Image kept at inbox path {:?}", image_path);
        }
        let processed_filename = classification
            .annotated_image
            .as_deref()
            .and_then(|b64| self.store_annotated(&image_path, b64));

        // Stage 6: append the record; failure is reported but non-blocking
        let record = NewDetection {
            camera_name: self.config.camera.name.clone(),
            filename: filename.clone(),
            processed_filename: processed_filename.clone(),
            detection: detection.clone(),
            environment: self.capture.environment().unwrap_or_default(),
            captured_at,
            notified,
        };
        let logged = match self.db.insert_detection(&record) {
            Ok(id) => {
                info!("Detection recorded (id {})", id);
                true
            }
            Err(e) => {
                error!("Failed to record detection: {}", e);
                false
            }
        };

        CycleOutcome::Completed(CycleReport {
            filename,
            detection,
            notified,
            image_path,
            processed_filename,
            logged,
        })
    }

    /// Build and send the operator message. Prefers the annotated image,
    /// falls back to the raw capture. Returns whether the backend confirmed.
    async fn send_notification(
        &self,
        notifier: &dyn Notify,
        detection: &Detection,
        image_path: &Path,
        annotated_b64: Option<&str>,
    ) -> bool {
        let text = format!(
            "Deteccion: {}\nCamara: {}\n{}",
            detection.label().unwrap_or("ninguno"),
            self.config.camera.name,
            Local::now().format("%d/%m/%Y %H:%M")
        );

        let photo = match annotated_b64 {
            Some(b64) => match general_purpose::STANDARD.decode(b64) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!("Annotated image is not valid base64 ({}), sending original", e);
                    std::fs::read(image_path).ok()
                }
            },
            None => std::fs::read(image_path).ok(),
        };

        match notifier.notify(&text, photo.as_deref()).await {
            Ok(()) => {
                info!("Notification sent");
                true
            }
            Err(e) => {
                warn!("Notification failed: {}", e);
                false
            }
        }
    }

    /// Decode the annotated variant and store it beside the archived
    /// original as `<stem>_annotated.jpg`. Returns the stored filename, or
    /// None when decoding or writing fails.
    fn store_annotated(&self, image_path: &Path, b64: &str) -> Option<String> {
        let bytes = match general_purpose::STANDARD.decode(b64) {
            Ok(b) => b,
            Err(e) => {
                warn!("Discarding undecodable annotated image: {}", e);
                return None;
            }
        };
        if image::guess_format(&bytes).is_err() {
            warn!("Annotated payload is not an image, discarding");
            return None;
        }

        let stem = image_path.file_stem()?.to_str()?;
        let name = format!("{}_annotated.jpg", stem);
        let dest = image_path.parent()?.join(&name);
        match std::fs::write(&dest, &bytes) {
            Ok(()) => Some(name),
            Err(e) => {
                warn!("Failed to store annotated image {:?}: {}", dest, e);
                None
            }
        }
    }
}
