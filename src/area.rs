// SPDX-License-Identifier: MIT

//! Image area: the three directories every capture moves through
//!
//! A file is born in `inbox` and ends each cycle in exactly one of
//! `detected` or `undetected`. Filenames are globally unique (camera id +
//! random token + timestamp), so placement never needs collision handling.

use chrono::Local;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::Detection;
use crate::Result;

/// The three capture directories
#[derive(Debug, Clone)]
pub struct ImageArea {
    pub inbox: PathBuf,
    pub detected: PathBuf,
    pub undetected: PathBuf,
}

/// Where an image ended up after the archive stage.
///
/// An explicit two-outcome result: either the move succeeded, or the file
/// stayed at its inbox path and the record must point there instead.
#[derive(Debug, Clone, PartialEq)]
pub enum Archived {
    /// Moved into the terminal directory
    Moved(PathBuf),
    /// Move failed; the original inbox path was kept so the event survives
    Retained(PathBuf),
}

impl Archived {
    pub fn path(&self) -> &Path {
        match self {
            Archived::Moved(p) | Archived::Retained(p) => p,
        }
    }
}

impl ImageArea {
    pub fn new(inbox: impl Into<PathBuf>, detected: impl Into<PathBuf>, undetected: impl Into<PathBuf>) -> Self {
        Self {
            inbox: inbox.into(),
            detected: detected.into(),
            undetected: undetected.into(),
        }
    }

    pub fn from_config(area: &crate::config::AreaConfig) -> Self {
        Self::new(&area.inbox, &area.detected, &area.undetected)
    }

    /// Create all three directories if missing
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.inbox, &self.detected, &self.undetected] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Unique inbox path for the next capture:
    /// `<camera>_<8-hex-token>_<YYYYmmdd-HHMMSS>.<ext>`.
    ///
    /// The random token keeps multiple cameras sharing one inbox from
    /// colliding within the same second.
    pub fn next_capture_path(&self, camera_name: &str, ext: &str) -> PathBuf {
        let token = Uuid::new_v4().simple().to_string();
        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        self.inbox
            .join(format!("{}_{}_{}.{}", camera_name, &token[..8], stamp, ext))
    }

    /// Terminal directory for a cycle's outcome
    pub fn terminal_dir(&self, detection: &Detection) -> &Path {
        if detection.is_insect() {
            &self.detected
        } else {
            &self.undetected
        }
    }

    /// Move a captured file to its terminal directory.
    ///
    /// Falls back to copy+remove when rename fails (cross-device inbox); if
    /// that fails too, the file stays put and the retained path is returned
    /// so the detection event is never lost.
    pub fn archive(&self, inbox_path: &Path, detection: &Detection) -> Archived {
        let filename = match inbox_path.file_name() {
            Some(name) => name,
            None => {
                warn!("Cannot archive path without filename: {:?}", inbox_path);
                return Archived::Retained(inbox_path.to_path_buf());
            }
        };
        let dest = self.terminal_dir(detection).join(filename);

        match std::fs::rename(inbox_path, &dest) {
            Ok(()) => {
                info!("Archived {:?} -> {:?}", filename, dest);
                Archived::Moved(dest)
            }
            Err(rename_err) => match std::fs::copy(inbox_path, &dest)
                .and_then(|_| std::fs::remove_file(inbox_path))
            {
                Ok(()) => {
                    info!("Archived (copied) {:?} -> {:?}", filename, dest);
                    Archived::Moved(dest)
                }
                Err(copy_err) => {
                    warn!(
                        "Failed to archive {:?} (rename: {}, copy: {}), keeping inbox path",
                        inbox_path, rename_err, copy_err
                    );
                    // A half-written copy at the destination would shadow the
                    // retained original when resolving; remove it.
                    let _ = std::fs::remove_file(&dest);
                    Archived::Retained(inbox_path.to_path_buf())
                }
            },
        }
    }

    /// Resolve a bare filename to its on-disk location, probing the
    /// directories in fixed order: detected, undetected, inbox. Tolerates
    /// images not yet archived.
    pub fn resolve(&self, filename: &str) -> Option<PathBuf> {
        // Basename only, so a crafted path cannot escape the area
        let name = Path::new(filename).file_name()?;
        for dir in [&self.detected, &self.undetected, &self.inbox] {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn area() -> (TempDir, ImageArea) {
        let tmp = TempDir::new().unwrap();
        let area = ImageArea::new(
            tmp.path().join("inbox"),
            tmp.path().join("detected"),
            tmp.path().join("undetected"),
        );
        area.ensure_dirs().unwrap();
        (tmp, area)
    }

    fn insect() -> Detection {
        Detection::Insect {
            label: "abeja".to_string(),
            confidence: 0.8,
        }
    }

    #[test]
    fn capture_paths_are_unique_and_well_formed() {
        let (_tmp, area) = area();
        let a = area.next_capture_path("cam1", "jpg");
        let b = area.next_capture_path("cam1", "jpg");
        assert_ne!(a, b);

        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("cam1_"));
        assert!(name.ends_with(".jpg"));
        assert_eq!(name.split('_').count(), 3);
        assert!(a.starts_with(&area.inbox));
    }

    #[test]
    fn archive_moves_to_matching_terminal_dir() {
        let (_tmp, area) = area();

        let path = area.next_capture_path("cam1", "jpg");
        std::fs::write(&path, b"jpeg").unwrap();
        let out = area.archive(&path, &insect());
        match out {
            Archived::Moved(dest) => {
                assert!(dest.starts_with(&area.detected));
                assert!(dest.is_file());
                assert!(!path.exists());
            }
            Archived::Retained(_) => panic!("expected move"),
        }

        let path = area.next_capture_path("cam1", "jpg");
        std::fs::write(&path, b"jpeg").unwrap();
        let out = area.archive(&path, &Detection::None);
        assert!(out.path().starts_with(&area.undetected));
    }

    #[test]
    fn archive_failure_retains_inbox_path() {
        let tmp = TempDir::new().unwrap();
        let area = ImageArea::new(
            tmp.path().join("inbox"),
            // Terminal dir is a plain file, so both rename and copy fail
            tmp.path().join("detected_blocker"),
            tmp.path().join("undetected"),
        );
        std::fs::create_dir_all(&area.inbox).unwrap();
        std::fs::create_dir_all(&area.undetected).unwrap();
        std::fs::write(&area.detected, b"not a directory").unwrap();

        let path = area.next_capture_path("cam1", "jpg");
        std::fs::write(&path, b"jpeg").unwrap();

        match area.archive(&path, &insect()) {
            Archived::Retained(kept) => {
                assert_eq!(kept, path);
                assert!(path.is_file());
            }
            Archived::Moved(_) => panic!("expected retained"),
        }
    }

    #[test]
    fn resolve_probes_in_fixed_order() {
        let (_tmp, area) = area();
        let name = "cam1_deadbeef_20250801-120000.jpg";

        assert!(area.resolve(name).is_none());

        std::fs::write(area.inbox.join(name), b"1").unwrap();
        assert_eq!(area.resolve(name).unwrap(), area.inbox.join(name));

        std::fs::write(area.undetected.join(name), b"2").unwrap();
        assert_eq!(area.resolve(name).unwrap(), area.undetected.join(name));

        std::fs::write(area.detected.join(name), b"3").unwrap();
        assert_eq!(area.resolve(name).unwrap(), area.detected.join(name));
    }

    #[test]
    fn resolve_strips_directory_components() {
        let (_tmp, area) = area();
        let name = "cam1_deadbeef_20250801-120000.jpg";
        std::fs::write(area.detected.join(name), b"x").unwrap();

        let resolved = area.resolve(&format!("../../../etc/{}", name)).unwrap();
        assert_eq!(resolved, area.detected.join(name));
    }
}
