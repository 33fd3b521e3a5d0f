// SPDX-License-Identifier: MIT

//! Capture source: acquiring one still image per cycle

use async_trait::async_trait;
use std::path::Path;
use tracing::debug;

use crate::config::CameraConfig;
use crate::db::EnvironmentReading;
use crate::{BugwatchError, Result};

/// Capability interface for the physical sensor
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Write one still image to the given path
    async fn capture(&self, dest: &Path) -> Result<()>;

    /// Temperature/humidity readings from the capture context, when the
    /// site has a sensor wired up
    fn environment(&self) -> Option<EnvironmentReading> {
        None
    }

    /// Release the sensor on shutdown
    fn release(&self) {}
}

/// Capture via an external still command (`rpicam-still` on the Pi)
pub struct StillCommand {
    command: String,
    width: u32,
    height: u32,
}

impl StillCommand {
    pub fn new(camera: &CameraConfig) -> Self {
        Self {
            command: camera.command.clone(),
            width: camera.width,
            height: camera.height,
        }
    }
}

#[async_trait]
impl CaptureSource for StillCommand {
    async fn capture(&self, dest: &Path) -> Result<()> {
        debug!("Capturing still to {:?}", dest);

        let status = tokio::process::Command::new(&self.command)
            .arg("--width")
            .arg(self.width.to_string())
            .arg("--height")
            .arg(self.height.to_string())
            .arg("--nopreview")
            .arg("--output")
            .arg(dest)
            .status()
            .await
            .map_err(|e| BugwatchError::Capture(format!("Failed to run {}: {}", self.command, e)))?;

        if !status.success() {
            return Err(BugwatchError::Capture(format!(
                "{} exited with {}",
                self.command, status
            )));
        }

        if !dest.is_file() {
            return Err(BugwatchError::Capture(format!(
                "{} reported success but wrote no file at {:?}",
                self.command, dest
            )));
        }

        Ok(())
    }
}
