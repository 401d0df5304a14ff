use image::{ImageFormat, RgbImage};
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

/// Length of the per-request artifact id, in hex characters.
pub const ARTIFACT_ID_LEN: usize = 12;

#[derive(Clone, Debug)]
pub struct MediaStore {
    media_dir: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum MediaStoreError {
    #[error("Media I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode {name}: {source}")]
    Encode {
        name: String,
        source: image::ImageError,
    },
}

/// File names of the two images written for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPair {
    pub id: String,
    pub original: String,
    pub preprocessed: String,
}

impl MediaStore {
    /// Opens the media directory, creating it when missing.
    pub fn new(media_dir: impl Into<PathBuf>) -> Result<Self, MediaStoreError> {
        let media_dir = media_dir.into();
        fs::create_dir_all(&media_dir)?;
        Ok(Self { media_dir })
    }

    pub fn generate_artifact_id() -> String {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(ARTIFACT_ID_LEN);
        id
    }

    pub fn original_name(id: &str) -> String {
        format!("original_{}.png", id)
    }

    pub fn preprocessed_name(id: &str) -> String {
        format!("preprocessed_{}.png", id)
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.media_dir.join(name)
    }

    pub fn save_png(&self, name: &str, image: &RgbImage) -> Result<(), MediaStoreError> {
        image
            .save_with_format(self.path_for(name), ImageFormat::Png)
            .map_err(|source| match source {
                image::ImageError::IoError(err) => MediaStoreError::Io(err),
                source => MediaStoreError::Encode {
                    name: name.to_string(),
                    source,
                },
            })
    }

    /// Writes both artifacts under a fresh id. If the second write fails the
    /// first is removed again.
    pub fn save_pair(
        &self,
        original: &RgbImage,
        preprocessed: &RgbImage,
    ) -> Result<ArtifactPair, MediaStoreError> {
        let id = Self::generate_artifact_id();
        let pair = ArtifactPair {
            original: Self::original_name(&id),
            preprocessed: Self::preprocessed_name(&id),
            id,
        };

        self.save_png(&pair.original, original)?;
        if let Err(e) = self.save_png(&pair.preprocessed, preprocessed) {
            self.discard(&pair);
            return Err(e);
        }
        log::debug!("Saved artifacts {} and {}", pair.original, pair.preprocessed);
        Ok(pair)
    }

    /// Best-effort removal of both artifacts of a pair.
    pub fn discard(&self, pair: &ArtifactPair) {
        for name in [&pair.original, &pair.preprocessed] {
            match fs::remove_file(self.path_for(name)) {
                Ok(()) => log::debug!("Removed artifact {}", name),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("Failed to remove artifact {}: {}", name, e),
            }
        }
    }
}
