//! Embedder backed by precomputed detections stored next to each image.
//!
//! An external model run writes `<image>.faces.json` (primary) and optionally
//! `<image>.fallback.faces.json` (fallback), each a JSON array of
//! [`FaceDetection`]. A missing file means "no face" for that embedder.

use faceid_core::{Embedder, EmbedderError, FaceDetection, Frame};
use std::path::{Path, PathBuf};

pub const PRIMARY_SUFFIX: &str = "faces.json";
pub const FALLBACK_SUFFIX: &str = "fallback.faces.json";

pub struct SidecarEmbedder {
    name: String,
    suffix: &'static str,
}

impl SidecarEmbedder {
    pub fn primary() -> Self {
        Self {
            name: "sidecar-primary".into(),
            suffix: PRIMARY_SUFFIX,
        }
    }

    pub fn fallback() -> Self {
        Self {
            name: "sidecar-fallback".into(),
            suffix: FALLBACK_SUFFIX,
        }
    }

    /// `photo.jpg` -> `photo.jpg.faces.json`.
    pub fn sidecar_path(&self, image: &Path) -> PathBuf {
        let mut name = image.as_os_str().to_os_string();
        name.push(".");
        name.push(self.suffix);
        PathBuf::from(name)
    }
}

impl Embedder for SidecarEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceDetection>, EmbedderError> {
        let source = frame
            .source
            .as_deref()
            .ok_or_else(|| EmbedderError::Failed("frame has no source path".into()))?;
        let path = self.sidecar_path(source);

        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::trace!(path = %path.display(), "no sidecar");
                return Err(EmbedderError::NoFace);
            }
            Err(e) => {
                return Err(EmbedderError::Failed(format!("{}: {e}", path.display())));
            }
        };

        serde_json::from_slice(&bytes)
            .map_err(|e| EmbedderError::Failed(format!("{}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceid_core::{DetectionOrchestrator, DetectorSource, OrchestratorConfig};

    const ONE_FACE: &str = r#"[{
        "region": {"x": 10.0, "y": 12.0, "width": 64.0, "height": 64.0},
        "embedding": {"values": [0.1, 0.2, 0.3]},
        "confidence": 0.93
    }]"#;

    fn frame_for(path: &Path) -> Frame {
        Frame::new(vec![0; 4], 2, 2).unwrap().with_source(path)
    }

    #[test]
    fn test_sidecar_path() {
        let path = SidecarEmbedder::fallback().sidecar_path(Path::new("/tmp/a/photo.jpg"));
        assert_eq!(path, PathBuf::from("/tmp/a/photo.jpg.fallback.faces.json"));
    }

    #[test]
    fn test_reads_detections() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("photo.png");
        std::fs::write(dir.path().join("photo.png.faces.json"), ONE_FACE).unwrap();

        let faces = SidecarEmbedder::primary().detect(&frame_for(&image)).unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].embedding.values, vec![0.1, 0.2, 0.3]);
        assert_eq!(faces[0].confidence, 0.93);
    }

    #[test]
    fn test_missing_sidecar_is_no_face() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("photo.png");
        assert!(matches!(
            SidecarEmbedder::primary().detect(&frame_for(&image)),
            Err(EmbedderError::NoFace)
        ));
    }

    #[test]
    fn test_garbage_sidecar_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("photo.png");
        std::fs::write(dir.path().join("photo.png.faces.json"), "{oops").unwrap();
        assert!(matches!(
            SidecarEmbedder::primary().detect(&frame_for(&image)),
            Err(EmbedderError::Failed(_))
        ));
    }

    #[test]
    fn test_fallback_used_when_primary_empty() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("photo.png");
        std::fs::write(dir.path().join("photo.png.faces.json"), "[]").unwrap();
        std::fs::write(dir.path().join("photo.png.fallback.faces.json"), ONE_FACE).unwrap();

        let mut orchestrator = DetectionOrchestrator::primary_with_fallback(
            Box::new(SidecarEmbedder::primary()),
            Box::new(SidecarEmbedder::fallback()),
            OrchestratorConfig::default(),
        );
        let results = orchestrator.detect(&frame_for(&image)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].detector_source, DetectorSource::Fallback);
    }
}
