//! JSON checkpoints of model parameters.

use crate::config::ModelKind;
use crate::core::{ParameterStore, RbmError, RbmResult};
use crate::model::Rbm;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Serialized model state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointData {
    pub name: String,
    pub model_type: ModelKind,
    /// Training epochs performed when the checkpoint was written
    pub epochs: usize,
    /// Reconstruction error of the last epoch, if known
    pub reconstruction_error: Option<f32>,
    pub params: ParameterStore,
}

/// Write the parameters of `model` to `path`.
///
/// # Errors
/// - `Io` if the file cannot be created
/// - `Serialization` if encoding fails
pub fn save_checkpoint(
    model: &Rbm,
    path: impl AsRef<Path>,
    epochs: usize,
    reconstruction_error: Option<f32>,
) -> RbmResult<()> {
    let data = CheckpointData {
        name: model.name().to_string(),
        model_type: model.kind(),
        epochs,
        reconstruction_error,
        params: model.get_params(),
    };
    let writer = BufWriter::new(File::create(path.as_ref())?);
    serde_json::to_writer_pretty(writer, &data)?;
    log::debug!("saved checkpoint to {}", path.as_ref().display());
    Ok(())
}

/// Read a checkpoint and rebuild its model.
///
/// The model's random generator is seeded with `seed` (0 if `None`).
///
/// # Errors
/// - `Io` / `Serialization` if the file cannot be read or decoded
/// - `InvalidTopology` if the parameters are inconsistent or do not match
///   the stored model type
pub fn load_checkpoint(
    path: impl AsRef<Path>,
    seed: Option<u64>,
) -> RbmResult<(Rbm, CheckpointData)> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let data: CheckpointData = serde_json::from_reader(reader)?;
    data.params.validate()?;
    if data.params.visible.kind != data.model_type.visible_kind() {
        return Err(RbmError::InvalidTopology(format!(
            "checkpoint of type {} has {} visible units",
            data.model_type,
            data.params.visible.kind.name()
        )));
    }

    let mut model = Rbm::new(
        data.model_type,
        data.params.visible.labels.clone(),
        data.params.hidden.labels.clone(),
        seed.unwrap_or(0),
    )?
    .with_name(data.name.clone());
    if !model.set_params(&data.params) {
        return Err(RbmError::InvalidTopology(
            "checkpoint parameters could not be restored".to_string(),
        ));
    }
    Ok((model, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("rbm-checkpoint-{}-{name}.json", std::process::id()))
    }

    #[test]
    fn test_save_and_load() {
        let mut model = Rbm::new(
            ModelKind::Grbm,
            vec!["a".into(), "b".into()],
            vec!["h".into()],
            4,
        )
        .unwrap()
        .with_name("pretrained");
        let mut params = model.get_params();
        params.links.weight[[1, 0]] = -0.75;
        params.visible.log_variance = Some(ndarray::arr1(&[0.5, -0.5]));
        params.links.adjacency[[0, 0]] = false;
        assert!(model.set_params(&params));

        let path = temp_path("roundtrip");
        save_checkpoint(&model, &path, 42, Some(0.1)).unwrap();
        let (loaded, data) = load_checkpoint(&path, Some(1)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(data.epochs, 42);
        assert_eq!(loaded.name(), "pretrained");
        assert_eq!(loaded.kind(), ModelKind::Grbm);
        assert_eq!(loaded.get_params(), model.get_params());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            load_checkpoint(temp_path("missing"), None),
            Err(RbmError::Io(_))
        ));
    }

    #[test]
    fn test_load_rejects_kind_mismatch() {
        let model = Rbm::new(ModelKind::Rbm, vec!["a".into()], vec!["h".into()], 0).unwrap();
        let data = CheckpointData {
            name: "x".into(),
            model_type: ModelKind::Grbm,
            epochs: 0,
            reconstruction_error: None,
            params: model.get_params(),
        };
        let path = temp_path("mismatch");
        std::fs::write(&path, serde_json::to_string(&data).unwrap()).unwrap();
        let res = load_checkpoint(&path, None);
        std::fs::remove_file(&path).ok();
        assert!(matches!(res, Err(RbmError::InvalidTopology(_))));
    }
}
