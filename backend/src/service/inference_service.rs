use shared::BloodGroup;
use std::sync::Arc;

use crate::pipeline::augmentations::{FingerprintPreprocessor, PreprocessError};
use crate::pipeline::model::{ClassProbabilities, Classifier, InferenceError};
use crate::storage::media_store::{ArtifactPair, MediaStore, MediaStoreError};

/// Raw classifier verdict for one upload, before calibration.
#[derive(Debug, Clone)]
pub struct PredictionResult {
    pub label: BloodGroup,
    pub raw_confidence: f32,
    pub probabilities: ClassProbabilities,
    pub artifacts: ArtifactPair,
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceServiceError {
    #[error("Invalid image: {0}")]
    Decode(#[from] PreprocessError),
    #[error("Inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("Storage error: {0}")]
    Storage(#[from] MediaStoreError),
}

#[derive(Clone)]
pub struct InferenceService {
    classifier: Arc<dyn Classifier>,
    preprocessor: FingerprintPreprocessor,
    media: MediaStore,
    labels: Arc<[BloodGroup]>,
}

impl InferenceService {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        media: MediaStore,
        labels: Vec<BloodGroup>,
    ) -> Self {
        Self {
            classifier,
            preprocessor: FingerprintPreprocessor::default(),
            media,
            labels: labels.into(),
        }
    }

    pub fn media(&self) -> &MediaStore {
        &self.media
    }

    /// Decodes, normalizes, stores both artifacts and classifies one upload.
    /// Nothing is left in the media directory when this returns an error.
    pub fn run(&self, image_bytes: &[u8]) -> Result<PredictionResult, InferenceServiceError> {
        let original = FingerprintPreprocessor::decode(image_bytes)?;
        let prepared = self.preprocessor.normalize(&original);
        let artifacts = self.media.save_pair(&original, &prepared.visual)?;

        match self.classify(&prepared.tensor) {
            Ok((label, raw_confidence, probabilities)) => {
                log::debug!(
                    "Artifact {} classified as {} ({:.4})",
                    artifacts.id,
                    label,
                    raw_confidence
                );
                Ok(PredictionResult {
                    label,
                    raw_confidence,
                    probabilities,
                    artifacts,
                })
            }
            Err(e) => {
                self.media.discard(&artifacts);
                Err(e.into())
            }
        }
    }

    fn classify(
        &self,
        tensor: &ndarray::Array4<f32>,
    ) -> Result<(BloodGroup, f32, ClassProbabilities), InferenceError> {
        let probabilities = self.classifier.classify(tensor)?;
        if probabilities.len() != self.labels.len() {
            return Err(InferenceError::OutputShape {
                expected: self.labels.len(),
                actual: probabilities.len(),
            });
        }
        let (index, confidence) = probabilities.top1().ok_or(InferenceError::OutputShape {
            expected: self.labels.len(),
            actual: 0,
        })?;
        Ok((self.labels[index], confidence, probabilities))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use ndarray::Array4;
    use std::io::Cursor;
    use std::sync::Mutex;
    use strum::IntoEnumIterator;

    struct FixedClassifier(Vec<f32>);

    impl Classifier for FixedClassifier {
        fn classify(&self, _input: &Array4<f32>) -> Result<ClassProbabilities, InferenceError> {
            Ok(ClassProbabilities::new(self.0.clone()))
        }
    }

    /// Records the tensor it was given and fails.
    struct FailingClassifier(Mutex<Option<Vec<usize>>>);

    impl Classifier for FailingClassifier {
        fn classify(&self, input: &Array4<f32>) -> Result<ClassProbabilities, InferenceError> {
            *self.0.lock().unwrap() = Some(input.shape().to_vec());
            Err(InferenceError::NonFinite)
        }
    }

    fn png_bytes(image: RgbImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn service(dir: &std::path::Path, classifier: Arc<dyn Classifier>) -> InferenceService {
        let media = MediaStore::new(dir).unwrap();
        InferenceService::new(classifier, media, BloodGroup::iter().collect())
    }

    fn media_files(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn picks_argmax_and_stores_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let probs = vec![0.05, 0.05, 0.6, 0.1, 0.05, 0.05, 0.05, 0.05];
        let service = service(dir.path(), Arc::new(FixedClassifier(probs)));

        let image = RgbImage::from_pixel(100, 100, Rgb([128, 128, 128]));
        let result = service.run(&png_bytes(image)).unwrap();

        assert_eq!(result.label, BloodGroup::AbPositive);
        assert!((result.raw_confidence - 0.6).abs() < 1e-6);
        let preprocessed = image::open(service.media().path_for(&result.artifacts.preprocessed))
            .unwrap()
            .to_rgb8();
        assert_eq!(preprocessed.dimensions(), (224, 224));
        assert!(preprocessed.pixels().all(|p| *p == Rgb([130, 130, 130])));
        assert!(service.media().path_for(&result.artifacts.original).is_file());
    }

    #[test]
    fn decode_failure_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), Arc::new(FixedClassifier(vec![0.125; 8])));

        let err = service.run(b"\x89PNG not really").unwrap_err();
        assert!(matches!(err, InferenceServiceError::Decode(_)));
        assert_eq!(media_files(dir.path()), 0);
    }

    #[test]
    fn inference_failure_removes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = Arc::new(FailingClassifier(Mutex::new(None)));
        let service = service(dir.path(), classifier.clone());

        let err = service.run(&png_bytes(RgbImage::new(50, 80))).unwrap_err();
        assert!(matches!(err, InferenceServiceError::Inference(_)));
        assert_eq!(media_files(dir.path()), 0);
        assert_eq!(*classifier.0.lock().unwrap(), Some(vec![1, 3, 224, 224]));
    }

    #[test]
    fn rejects_output_that_does_not_match_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), Arc::new(FixedClassifier(vec![0.5, 0.5])));

        let err = service.run(&png_bytes(RgbImage::new(10, 10))).unwrap_err();
        assert!(matches!(
            err,
            InferenceServiceError::Inference(InferenceError::OutputShape { expected: 8, actual: 2 })
        ));
        assert_eq!(media_files(dir.path()), 0);
    }
}
