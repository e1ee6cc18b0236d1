use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use bincode::{Decode, Encode};

use crate::encoder::BofModel;
use crate::error::{BofError, BofResult};

/// Version of the on-disk layout written by [`BofModel::save`].
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, PartialEq, Encode, Decode)]
struct ModelHeader {
    version: u32,
    patch_edge: u64,
    k: u64,
    levels: u64,
}

impl ModelHeader {
    fn of(model: &BofModel) -> Self {
        Self {
            version: FORMAT_VERSION,
            patch_edge: model.patch_edge() as u64,
            k: model.codebook().k() as u64,
            levels: model.codebook().levels() as u64,
        }
    }
}

impl BofModel {
    /// Persists the fitted model to a file.
    pub fn save(&self, path: impl AsRef<Path>) -> BofResult<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        let config = bincode::config::standard();

        bincode::encode_into_std_write(ModelHeader::of(self), &mut writer, config)
            .map_err(|e| BofError::Bincode(e.to_string()))?;
        bincode::encode_into_std_write(self, &mut writer, config)
            .map_err(|e| BofError::Bincode(e.to_string()))?;
        writer.flush()?;

        Ok(())
    }

    /// Loads a model from a file and verifies it against its header.
    pub fn load(path: impl AsRef<Path>) -> BofResult<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let config = bincode::config::standard();

        let header: ModelHeader = bincode::decode_from_std_read(&mut reader, config)
            .map_err(|e| BofError::Bincode(e.to_string()))?;

        if header.version != FORMAT_VERSION {
            return Err(BofError::ModelMismatch(format!(
                "expected format version {FORMAT_VERSION}, but found {}",
                header.version
            )));
        }

        let model: BofModel = bincode::decode_from_std_read(&mut reader, config)
            .map_err(|e| BofError::Bincode(e.to_string()))?;

        let found = ModelHeader::of(&model);
        if found != header {
            return Err(BofError::ModelMismatch(format!(
                "header declares patch_edge={} k={} levels={}, body holds patch_edge={} k={} levels={}",
                header.patch_edge, header.k, header.levels, found.patch_edge, found.k, found.levels
            )));
        }

        // a short branch would yield leaf indices outside k^levels
        model.check()?;

        log::debug!(
            "loaded model with {} codewords over {}x{} patches",
            model.leaf_count(),
            model.patch_edge(),
            model.patch_edge()
        );

        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augment::Augment;
    use crate::codebook::HierarchicalCodebook;
    use crate::kmeans::KMeans;
    use crate::patch::Patches;
    use crate::whiten::Whitener;

    fn tiny_model() -> BofResult<BofModel> {
        let centroids = Patches::from_vec((0..12).map(|v| v as f32).collect(), 4)?;
        let codebook = HierarchicalCodebook::from_kmeans(KMeans::from_centroids(centroids)?);
        BofModel::new(2, Augment::Reflect, Whitener::identity(4), codebook)
    }

    #[test]
    fn test_save_and_load() -> Result<(), BofError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.bof");

        let model = tiny_model()?;
        model.save(&path)?;
        let loaded = BofModel::load(&path)?;

        assert_eq!(loaded, model);
        assert_eq!(loaded.augment(), Augment::Reflect);
        assert_eq!(loaded.leaf_count(), 3);
        Ok(())
    }

    #[test]
    fn test_load_non_existent_file() -> Result<(), BofError> {
        let dir = tempfile::tempdir()?;
        let result = BofModel::load(dir.path().join("missing.bof"));
        assert!(matches!(result, Err(BofError::Io(_))));
        Ok(())
    }

    #[test]
    fn test_save_invalid_path() -> Result<(), BofError> {
        let result = tiny_model()?.save("/path/to/non/existent/directory/model.bof");
        assert!(matches!(result, Err(BofError::Io(_))));
        Ok(())
    }

    #[test]
    fn test_header_mismatch() -> Result<(), BofError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mismatch.bof");

        let model = tiny_model()?;
        let config = bincode::config::standard();
        let header = ModelHeader {
            levels: 2,
            ..ModelHeader::of(&model)
        };
        let mut bytes = bincode::encode_to_vec(header, config)
            .map_err(|e| BofError::Bincode(e.to_string()))?;
        bytes.extend(
            bincode::encode_to_vec(&model, config).map_err(|e| BofError::Bincode(e.to_string()))?,
        );
        std::fs::write(&path, bytes)?;

        assert!(matches!(
            BofModel::load(&path),
            Err(BofError::ModelMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn test_version_mismatch() -> Result<(), BofError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("version.bof");

        let model = tiny_model()?;
        let header = ModelHeader {
            version: FORMAT_VERSION + 1,
            ..ModelHeader::of(&model)
        };
        let bytes = bincode::encode_to_vec(header, bincode::config::standard())
            .map_err(|e| BofError::Bincode(e.to_string()))?;
        std::fs::write(&path, bytes)?;

        assert!(matches!(
            BofModel::load(&path),
            Err(BofError::ModelMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn test_truncated_file() -> Result<(), BofError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("truncated.bof");

        tiny_model()?.save(&path)?;
        let bytes = std::fs::read(&path)?;
        std::fs::write(&path, &bytes[..bytes.len() / 2])?;

        assert!(matches!(BofModel::load(&path), Err(BofError::Bincode(_))));
        Ok(())
    }

    #[test]
    fn test_non_finite_centroid_rejected() -> Result<(), BofError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nan.bof");

        tiny_model()?.save(&path)?;
        let mut bytes = std::fs::read(&path)?;
        // centroid value 7.0 is stored as little endian f32
        let seven = 7.0f32.to_le_bytes();
        let at = bytes
            .windows(4)
            .position(|w| w == seven)
            .ok_or_else(|| BofError::CorruptedModel("centroid not found".to_string()))?;
        bytes[at..at + 4].copy_from_slice(&f32::NAN.to_le_bytes());
        std::fs::write(&path, &bytes)?;

        assert!(matches!(BofModel::load(&path), Err(BofError::NonFinite(_))));
        Ok(())
    }
}
