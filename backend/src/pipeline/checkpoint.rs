//! Checkpoint reading and key reconciliation against a live `VarStore`.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use tch::{Device, TchError, Tensor, nn};

/// Key prefix of a training checkpoint that wraps the weights with optimizer state.
pub const STATE_DICT_PREFIX: &str = "model_state_dict.";

/// Buffers torchvision serializes that have no counterpart in the var store.
const IGNORED_SUFFIXES: &[&str] = &["num_batches_tracked"];

/// Outcome of copying checkpoint tensors into a var store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub matched: usize,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    pub mismatched: Vec<String>,
    pub stripped_prefix: Option<String>,
}

impl LoadReport {
    /// Every parameter loaded and nothing left over.
    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("{0}")]
    Tensor(#[from] TchError),
    #[error("Unreadable torch pickle: {0}")]
    Pickle(#[from] candle_core::Error),
}

/// Reads every named tensor from `path`, choosing the reader by extension.
/// `.pt`, `.pth` and `.bin` are `torch.save` archives; a `model_state_dict`
/// entry is taken when present.
pub fn read_named_tensors(
    path: &Path,
    device: Device,
) -> Result<Vec<(String, Tensor)>, CheckpointError> {
    let named = match path.extension().and_then(|ext| ext.to_str()) {
        Some("safetensors") => Tensor::read_safetensors(path)?,
        Some("pt") | Some("pth") | Some("bin") => read_torch_pickle(path)?,
        _ => Tensor::load_multi_with_device(path, device)?,
    };
    Ok(named
        .into_iter()
        .map(|(name, tensor)| (name, tensor.to_device(device)))
        .collect())
}

fn read_torch_pickle(path: &Path) -> Result<Vec<(String, Tensor)>, CheckpointError> {
    let key = STATE_DICT_PREFIX.trim_end_matches('.');
    let named = match candle_core::pickle::read_all_with_key(path, Some(key)) {
        Ok(named) if !named.is_empty() => named,
        _ => candle_core::pickle::read_all_with_key(path, None)?,
    };
    named
        .into_iter()
        .map(|(name, tensor)| Ok((name, from_candle(&tensor)?)))
        .collect()
}

/// Copies a CPU candle tensor into libtorch as `f32`.
fn from_candle(tensor: &candle_core::Tensor) -> Result<Tensor, CheckpointError> {
    let dims: Vec<i64> = tensor.dims().iter().map(|&d| d as i64).collect();
    let data = tensor
        .to_dtype(candle_core::DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    Ok(Tensor::f_from_slice(&data)?.f_view(dims.as_slice())?)
}

/// Keeps only the `model_state_dict` entries when the checkpoint is wrapped.
pub fn unwrap_state_dict<T>(entries: Vec<(String, T)>) -> Vec<(String, T)> {
    if !entries.iter().any(|(key, _)| key.starts_with(STATE_DICT_PREFIX)) {
        return entries;
    }
    entries
        .into_iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(STATE_DICT_PREFIX)
                .map(|stripped| (stripped.to_string(), value))
        })
        .collect()
}

/// Strips leading key segments shared by every entry that are not roots of
/// the live model (`module.` from data-parallel training, `_orig_mod.` from
/// compiled modules). Returns the removed prefix, if any.
pub fn strip_uniform_prefix<T>(
    entries: Vec<(String, T)>,
    model_roots: &HashSet<String>,
) -> (Vec<(String, T)>, Option<String>) {
    let mut prefix = String::new();
    loop {
        let candidate = match shared_first_segment(&entries, prefix.len()) {
            Some(segment) if !model_roots.contains(segment) => segment.to_string(),
            _ => break,
        };
        prefix.push_str(&candidate);
        prefix.push('.');
    }

    if prefix.is_empty() {
        return (entries, None);
    }
    let stripped = entries
        .into_iter()
        .map(|(key, value)| (key[prefix.len()..].to_string(), value))
        .collect();
    (stripped, Some(prefix))
}

fn shared_first_segment<T>(entries: &[(String, T)], offset: usize) -> Option<&str> {
    let mut shared: Option<&str> = None;
    for (key, _) in entries {
        let rest = &key[offset..];
        let (segment, remainder) = rest.split_once('.')?;
        if remainder.is_empty() {
            return None;
        }
        match shared {
            None => shared = Some(segment),
            Some(existing) if existing == segment => {}
            Some(_) => return None,
        }
    }
    shared
}

/// First key segment of every variable in the store.
pub fn model_roots(vs: &nn::VarStore) -> HashSet<String> {
    vs.variables()
        .keys()
        .filter_map(|name| name.split('.').next().map(str::to_string))
        .collect()
}

fn is_ignorable(key: &str) -> bool {
    IGNORED_SUFFIXES.iter().any(|suffix| key.ends_with(suffix))
}

/// Copies every checkpoint tensor whose name and shape match a variable.
pub fn load_into(
    vs: &nn::VarStore,
    tensors: &HashMap<String, Tensor>,
) -> Result<LoadReport, TchError> {
    let mut variables = vs.variables();
    let mut report = LoadReport::default();

    tch::no_grad(|| -> Result<(), TchError> {
        for (name, variable) in variables.iter_mut() {
            match tensors.get(name) {
                Some(source) if source.size() == variable.size() => {
                    variable.f_copy_(source)?;
                    report.matched += 1;
                }
                Some(_) => report.mismatched.push(name.clone()),
                None => report.missing.push(name.clone()),
            }
        }
        Ok(())
    })?;

    report.unexpected = tensors
        .keys()
        .filter(|key| !variables.contains_key(*key) && !is_ignorable(key))
        .cloned()
        .collect();

    report.missing.sort();
    report.mismatched.sort();
    report.unexpected.sort();
    Ok(report)
}
