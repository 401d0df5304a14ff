use ndarray::Array4;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tch::{Device, Kind, Tensor, nn, nn::ModuleT};

use super::checkpoint::{self, CheckpointError, LoadReport};
use super::efficientnet::{EfficientNet, HeadLayout};

#[derive(Debug, thiserror::Error)]
pub enum ModelLoadError {
    #[error("Model file not found at {0}")]
    NotFound(PathBuf),
    #[error("Failed to read checkpoint: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("Failed to copy weights: {0}")]
    Tensor(#[from] tch::TchError),
    #[error("Checkpoint {0} matched none of the model parameters")]
    NoMatchingParameters(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Tensor error: {0}")]
    Tensor(#[from] tch::TchError),
    #[error("Expected input of shape (1, 3, H, W), got {0:?}")]
    InvalidInput(Vec<usize>),
    #[error("Model produced {actual} scores, expected {expected}")]
    OutputShape { expected: usize, actual: usize },
    #[error("Model produced non-finite scores")]
    NonFinite,
}

/// Softmax output, index-aligned with the label vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassProbabilities(Vec<f32>);

impl ClassProbabilities {
    pub fn new(probabilities: Vec<f32>) -> Self {
        Self(probabilities)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Index and probability of the most likely class; the first wins ties.
    pub fn top1(&self) -> Option<(usize, f32)> {
        self.0
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best, (idx, p)| match best {
                Some((_, best_p)) if best_p >= p => best,
                _ => Some((idx, p)),
            })
    }
}

/// Anything that maps a normalized fingerprint tensor to class probabilities.
pub trait Classifier: Send + Sync {
    fn classify(&self, input: &Array4<f32>) -> Result<ClassProbabilities, InferenceError>;
}

#[derive(Debug)]
pub struct Model {
    // Owns the parameters `net` reads from.
    _vs: nn::VarStore,
    net: EfficientNet,
    device: Device,
    num_classes: usize,
    report: LoadReport,
}

impl Model {
    pub fn load(
        weights_path: &Path,
        num_classes: i64,
        device: Device,
    ) -> Result<Self, ModelLoadError> {
        if !weights_path.is_file() {
            return Err(ModelLoadError::NotFound(weights_path.to_path_buf()));
        }
        log::info!("Loading weights from {} on {:?}", weights_path.display(), device);

        let named = checkpoint::read_named_tensors(weights_path, device)?;
        let named = checkpoint::unwrap_state_dict(named);

        let head_layout = HeadLayout::detect(named.iter().map(|(k, _)| k.as_str()))
            .or_else(|| {
                // Keys may still carry a wrapper prefix; look past it.
                HeadLayout::detect(named.iter().filter_map(|(k, _)| {
                    k.find("classifier.").map(|at| &k[at..])
                }))
            })
            .unwrap_or_else(|| {
                log::warn!(
                    "Checkpoint {} has no classifier weights; defaulting to dropout + linear head",
                    weights_path.display()
                );
                HeadLayout::Indexed
            });

        let mut vs = nn::VarStore::new(device);
        let net = EfficientNet::b0(&vs.root(), num_classes, head_layout);

        let (named, stripped_prefix) =
            checkpoint::strip_uniform_prefix(named, &checkpoint::model_roots(&vs));
        if let Some(prefix) = &stripped_prefix {
            log::info!("Stripped checkpoint key prefix '{}'", prefix);
        }
        let tensors: HashMap<String, Tensor> = named.into_iter().collect();

        let mut report = checkpoint::load_into(&vs, &tensors)?;
        report.stripped_prefix = stripped_prefix;

        if report.matched == 0 {
            return Err(ModelLoadError::NoMatchingParameters(weights_path.to_path_buf()));
        }
        if report.is_exact() {
            log::info!("Loaded all {} parameters ({:?} head)", report.matched, head_layout);
        } else {
            log::warn!(
                "Partial weight load from {}: {} matched, {} missing, {} unexpected, {} shape mismatches",
                weights_path.display(),
                report.matched,
                report.missing.len(),
                report.unexpected.len(),
                report.mismatched.len()
            );
            for name in report.missing.iter().chain(&report.mismatched) {
                log::warn!("  not loaded: {}", name);
            }
            for name in &report.unexpected {
                log::warn!("  unused checkpoint key: {}", name);
            }
        }

        vs.freeze();
        Ok(Self {
            _vs: vs,
            net,
            device,
            num_classes: num_classes as usize,
            report,
        })
    }

    pub fn load_report(&self) -> &LoadReport {
        &self.report
    }

    pub fn head_layout(&self) -> HeadLayout {
        self.net.head_layout()
    }

    pub fn infer(&self, input: &Array4<f32>) -> Result<ClassProbabilities, InferenceError> {
        let shape = input.shape().to_vec();
        if shape[0] != 1 || shape[1] != 3 {
            return Err(InferenceError::InvalidInput(shape));
        }

        let data: Vec<f32> = input.iter().copied().collect();
        let dims: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
        let xs = Tensor::f_from_slice(&data)?.f_view(dims.as_slice())?.to_device(self.device);

        let output = tch::no_grad(|| self.net.forward_t(&xs, false));
        let output = output
            .softmax(-1, Kind::Float)
            .to_device(Device::Cpu)
            .view([-1]);
        let probabilities = Vec::<f32>::try_from(&output)?;

        if probabilities.len() != self.num_classes {
            return Err(InferenceError::OutputShape {
                expected: self.num_classes,
                actual: probabilities.len(),
            });
        }
        if probabilities.iter().any(|p| !p.is_finite()) {
            return Err(InferenceError::NonFinite);
        }
        Ok(ClassProbabilities::new(probabilities))
    }
}

impl Classifier for Model {
    fn classify(&self, input: &Array4<f32>) -> Result<ClassProbabilities, InferenceError> {
        self.infer(input)
    }
}

/// One-time holder for a lazily loaded model. The first successful
/// initializer wins; later calls return the same `Arc` without running their
/// initializer. A failed initializer leaves the slot empty.
pub struct ModelCache<T> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T> Default for ModelCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ModelCache<T> {
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub fn get_or_try_init<E>(&self, init: impl FnOnce() -> Result<T, E>) -> Result<Arc<T>, E> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(model) = slot.as_ref() {
            return Ok(Arc::clone(model));
        }
        let model = Arc::new(init()?);
        *slot = Some(Arc::clone(&model));
        Ok(model)
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(Arc::clone)
    }
}

impl ModelCache<Model> {
    pub fn load(
        &self,
        weights_path: &Path,
        num_classes: i64,
        device: Device,
    ) -> Result<Arc<Model>, ModelLoadError> {
        self.get_or_try_init(|| Model::load(weights_path, num_classes, device))
    }
}
