//! Packed expert parameter archives.
//!
//! Every expert parameter is stored as its own tensor keyed
//! `"{expert_index}/{parameter_name}"`, e.g. `"3/wi_0_weight"`. Both
//! safetensors and numpy `.npz` archives are accepted; values are converted
//! to f32 and kept in host memory for the lifetime of the provider.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::error::{MoEError, Result};

/// Declared shape of one per-expert parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub dims: Vec<usize>,
}

impl ParamSpec {
    pub fn new(name: &'static str, dims: Vec<usize>) -> Self {
        Self { name, dims }
    }

    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }
}

#[derive(Debug)]
struct HostParam {
    dims: Vec<usize>,
    values: Vec<f32>,
}

/// Host-resident parameter table for all experts.
#[derive(Debug, Default)]
pub struct ExpertArchive {
    params: HashMap<String, HostParam>,
}

impl ExpertArchive {
    /// Archive key for one expert parameter.
    pub fn key(expert: usize, name: &str) -> String {
        format!("{expert}/{name}")
    }

    /// Read an archive from disk, choosing the format by file extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(MoEError::data(format!(
                "expert weight file {} does not exist or is not a regular file",
                path.display()
            )));
        }

        let tensors: Vec<(String, Tensor)> =
            match path.extension().and_then(|ext| ext.to_str()) {
                Some("npz") => Tensor::read_npz(path)
                    .map_err(|e| MoEError::data(format!("failed to read npz archive: {e}")))?,
                Some("safetensors") => candle_core::safetensors::load(path, &Device::Cpu)
                    .map_err(|e| {
                        MoEError::data(format!("failed to read safetensors archive: {e}"))
                    })?
                    .into_iter()
                    .collect(),
                _ => {
                    return Err(MoEError::data(format!(
                        "unsupported weight archive format: {}",
                        path.display()
                    )))
                }
            };

        let archive = Self::from_tensors(tensors)?;
        tracing::debug!(path = %path.display(), tensors = archive.len(), "loaded expert archive");
        Ok(archive)
    }

    /// Build an archive from in-memory tensors keyed like [`Self::key`].
    pub fn from_tensors(tensors: impl IntoIterator<Item = (String, Tensor)>) -> Result<Self> {
        let mut params = HashMap::new();
        for (name, tensor) in tensors {
            let dims = tensor.dims().to_vec();
            let values = tensor
                .to_dtype(DType::F32)?
                .flatten_all()?
                .to_vec1::<f32>()?;
            params.insert(name, HostParam { dims, values });
        }
        Ok(Self { params })
    }

    /// Check that every expert carries every declared parameter with the
    /// declared shape.
    pub fn validate(&self, expert_count: usize, specs: &[ParamSpec]) -> Result<()> {
        for expert in 0..expert_count {
            for spec in specs {
                let key = Self::key(expert, spec.name);
                let param = self
                    .params
                    .get(&key)
                    .ok_or_else(|| MoEError::data(format!("missing expert parameter {key}")))?;
                if param.dims != spec.dims {
                    return Err(MoEError::data(format!(
                        "shape mismatch for {key}: expected {:?}, got {:?}",
                        spec.dims, param.dims
                    )));
                }
            }
        }
        Ok(())
    }

    /// Flat f32 values of one parameter.
    pub fn get(&self, expert: usize, name: &str) -> Option<&[f32]> {
        self.tensor(&Self::key(expert, name)).map(|(_, values)| values)
    }

    /// Dims and flat f32 values of any stored tensor, keyed verbatim.
    pub fn tensor(&self, key: &str) -> Option<(&[usize], &[f32])> {
        self.params
            .get(key)
            .map(|p| (p.dims.as_slice(), p.values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensors(expert_count: usize) -> HashMap<String, Tensor> {
        let mut map = HashMap::new();
        for e in 0..expert_count {
            let values: Vec<f32> = (0..6).map(|i| (e * 10 + i) as f32).collect();
            map.insert(
                ExpertArchive::key(e, "w"),
                Tensor::from_vec(values, (2, 3), &Device::Cpu).unwrap(),
            );
        }
        map
    }

    #[test]
    fn validate_accepts_declared_shapes() {
        let archive = ExpertArchive::from_tensors(tensors(2)).unwrap();
        let specs = [ParamSpec::new("w", vec![2, 3])];
        assert!(archive.validate(2, &specs).is_ok());
        assert_eq!(archive.get(1, "w").unwrap()[0], 10.0);
    }

    #[test]
    fn tensor_lookup_by_raw_key() {
        let archive = ExpertArchive::from_tensors(tensors(1)).unwrap();
        let (dims, values) = archive.tensor("0/w").unwrap();
        assert_eq!(dims, &[2, 3]);
        assert_eq!(values.len(), 6);
        assert!(archive.tensor("gate/centroids").is_none());
    }

    #[test]
    fn validate_reports_missing_expert() {
        let archive = ExpertArchive::from_tensors(tensors(1)).unwrap();
        let specs = [ParamSpec::new("w", vec![2, 3])];
        let err = archive.validate(2, &specs).unwrap_err();
        assert!(err.to_string().contains("missing expert parameter 1/w"));
    }

    #[test]
    fn validate_reports_shape_mismatch() {
        let archive = ExpertArchive::from_tensors(tensors(1)).unwrap();
        let specs = [ParamSpec::new("w", vec![3, 2])];
        assert!(matches!(archive.validate(1, &specs), Err(MoEError::Data(_))));
    }

    #[test]
    fn safetensors_round_trip_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experts.safetensors");
        candle_core::safetensors::save(&tensors(2), &path).unwrap();

        let archive = ExpertArchive::load(&path).unwrap();
        assert_eq!(archive.len(), 2);
        assert_eq!(archive.get(0, "w").unwrap(), &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn load_missing_file_is_data_error() {
        let err = ExpertArchive::load("/nonexistent/experts.safetensors").unwrap_err();
        assert!(matches!(err, MoEError::Data(_)));
    }

    #[test]
    fn load_unknown_extension_is_data_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            ExpertArchive::load(file.path()),
            Err(MoEError::Data(_))
        ));
    }
}
