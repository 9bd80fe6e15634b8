pub mod writer;

use anyhow::Result;
use fs2::FileExt;
use ndarray::{Array1, Array2, Ix1, Ix2};
use serde_json::{Map, Value, json};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zarrs::array::codec::{BloscCodec, BloscCompressionLevel, BloscCompressor, BloscShuffleMode};
use zarrs::array::{ArrayBuilder, DataType, FillValue};
use zarrs::filesystem::FilesystemStore;
use zarrs::group::GroupBuilder;
use zarrs::storage::{ReadableStorageTraits, StoreKey};

pub const NWB_VERSION: &str = "2.7.0";
pub const CORE_NAMESPACE: &str = "core";

/// Blosc LZ4 at level 5. Floats use bit-shuffle, integers byte-shuffle.
pub fn blosc_codec(shuffle_mode: BloscShuffleMode, typesize: usize) -> Result<Arc<BloscCodec>> {
    let compression_level = BloscCompressionLevel::try_from(5u8)
        .map_err(|e| anyhow::anyhow!("Invalid compression level: {}", e))?;
    Ok(Arc::new(BloscCodec::new(
        BloscCompressor::LZ4,
        compression_level,
        None,
        shuffle_mode,
        Some(typesize),
    )?))
}

/// `neurodata_type`, `namespace` and a fresh `object_id`
pub fn neurodata_attributes(neurodata_type: &str) -> Map<String, Value> {
    let mut attrs = Map::new();
    attrs.insert("neurodata_type".to_string(), json!(neurodata_type));
    attrs.insert("namespace".to_string(), json!(CORE_NAMESPACE));
    attrs.insert("object_id".to_string(), json!(uuid::Uuid::new_v4().to_string()));
    attrs
}

fn metadata_key(path: &str) -> Result<StoreKey> {
    let trimmed_path = path.trim_end_matches('/').trim_start_matches('/');
    let metadata_path = if trimmed_path.is_empty() {
        "zarr.json".to_string()
    } else {
        format!("{}/zarr.json", trimmed_path)
    };
    Ok(StoreKey::new(&metadata_path)?)
}

fn node_type(store: &Arc<FilesystemStore>, path: &str) -> Result<Option<String>> {
    match store.get(&metadata_key(path)?) {
        Ok(Some(data)) => {
            let json: Value = serde_json::from_slice(&data)?;
            Ok(json.get("node_type").and_then(|v| v.as_str()).map(str::to_string))
        }
        _ => Ok(None),
    }
}

/// Check if a Zarr group exists (Zarr v3 uses zarr.json with node_type)
pub fn group_exists(store: &Arc<FilesystemStore>, path: &str) -> Result<bool> {
    Ok(node_type(store, path)?.as_deref() == Some("group"))
}

pub fn array_exists(store: &Arc<FilesystemStore>, path: &str) -> Result<bool> {
    Ok(node_type(store, path)?.as_deref() == Some("array"))
}

/// Read attributes from a group's zarr.json file (Zarr v3 format)
pub fn read_group_attributes(store: &Arc<FilesystemStore>, path: &str) -> Result<Value> {
    let zarr_key = metadata_key(path)?;
    let zarr_bytes = store
        .get(&zarr_key)?
        .ok_or_else(|| anyhow::anyhow!("Metadata not found at {}", zarr_key.as_str()))?;
    let zarr_metadata: Value = serde_json::from_slice(&zarr_bytes)?;

    Ok(zarr_metadata
        .get("attributes")
        .cloned()
        .unwrap_or_else(|| json!({})))
}

/// An NWB-Zarr container being written
pub struct NwbStore {
    path: PathBuf,
    store: Arc<FilesystemStore>,
}

impl NwbStore {
    /// Create the root group of a new container at `path`
    pub fn create(path: &Path) -> Result<Self> {
        // Create the store directory if it doesn't exist
        std::fs::create_dir_all(path)?;
        let store = Arc::new(FilesystemStore::new(path)?);

        // Root group carries the NWBFile attributes
        let mut root_group = GroupBuilder::new().build(store.clone(), "/")?;
        let mut attrs = neurodata_attributes("NWBFile");
        attrs.insert("nwb_version".to_string(), json!(NWB_VERSION));
        root_group.attributes_mut().extend(attrs);
        root_group.store_metadata()?;

        // Top-level groups every NWB file has, even when empty
        for group in ["/general", "/acquisition", "/processing", "/stimulus", "/analysis"] {
            GroupBuilder::new().build(store.clone(), group)?.store_metadata()?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            store,
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let store = Arc::new(FilesystemStore::new(path)?);
        if !group_exists(&store, "/")? {
            anyhow::bail!("{} is not a Zarr container", path.display());
        }
        Ok(Self {
            path: path.to_path_buf(),
            store,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn store(&self) -> &Arc<FilesystemStore> {
        &self.store
    }

    /// Create `path` (and any missing parents) as a typed NWB group
    pub fn create_group(
        &self,
        path: &str,
        neurodata_type: Option<&str>,
        attrs: Map<String, Value>,
    ) -> Result<()> {
        self.ensure_parents(path)?;

        // Typed attributes first so caller attributes can override them
        let mut group = GroupBuilder::new().build(self.store.clone(), path)?;
        if let Some(neurodata_type) = neurodata_type {
            group.attributes_mut().extend(neurodata_attributes(neurodata_type));
        }
        group.attributes_mut().extend(attrs);
        group.store_metadata()?;
        Ok(())
    }

    fn ensure_parents(&self, path: &str) -> Result<()> {
        let mut current = String::new();
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            current.push('/');
            current.push_str(segment);
            if !group_exists(&self.store, &current)? {
                GroupBuilder::new().build(self.store.clone(), &current)?.store_metadata()?;
            }
        }
        Ok(())
    }

    /// Merge `attrs` into an existing group's attributes
    pub fn update_attributes(&self, path: &str, attrs: Map<String, Value>) -> Result<()> {
        let mut group = zarrs::group::Group::open(self.store.clone(), path)?;
        group.attributes_mut().extend(attrs);
        group.store_metadata()?;
        Ok(())
    }

    pub fn read_attributes(&self, path: &str) -> Result<Value> {
        read_group_attributes(&self.store, path)
    }

    /// Write a 1-D float64 dataset in one go
    pub fn write_f64_1d(&self, path: &str, dimension: &str, values: &[f64]) -> Result<()> {
        let len = values.len() as u64;
        let array = ArrayBuilder::new(
            vec![len],
            vec![len.clamp(1, 100_000)],
            DataType::Float64,
            FillValue::from(0.0f64),
        )
        .dimension_names(Some(vec![Some(dimension.to_string())]))
        .bytes_to_bytes_codecs(vec![blosc_codec(BloscShuffleMode::BitShuffle, 8)?])
        .build(self.store.clone(), path)?;

        array.store_metadata()?;
        // Zero-length arrays only get metadata
        if len > 0 {
            array.store_array_subset_ndarray::<f64, Ix1>(&[0], Array1::from_vec(values.to_vec()))?;
        }
        Ok(())
    }

    /// Write a `[samples, columns]` float64 dataset in one go
    pub fn write_f64_2d(&self, path: &str, values: Array2<f64>) -> Result<()> {
        let (rows, columns) = values.dim();
        // Whole rows per chunk
        let array = ArrayBuilder::new(
            vec![rows as u64, columns as u64],
            vec![(rows as u64).clamp(1, 100_000), columns.max(1) as u64],
            DataType::Float64,
            FillValue::from(0.0f64),
        )
        .dimension_names(Some(vec![
            Some("samples".to_string()),
            Some("columns".to_string()),
        ]))
        .bytes_to_bytes_codecs(vec![blosc_codec(BloscShuffleMode::BitShuffle, 8)?])
        .build(self.store.clone(), path)?;

        array.store_metadata()?;
        if rows > 0 && columns > 0 {
            array.store_array_subset_ndarray::<f64, Ix2>(&[0, 0], values)?;
        }
        Ok(())
    }

    pub fn array_shape(&self, path: &str) -> Result<Vec<u64>> {
        let array = zarrs::array::Array::open(self.store.clone(), path)?;
        Ok(array.shape().to_vec())
    }

    pub fn read_f64_1d(&self, path: &str) -> Result<Vec<f64>> {
        let array = zarrs::array::Array::open(self.store.clone(), path)?;
        let len = array.shape()[0];
        if len == 0 {
            return Ok(Vec::new());
        }
        let subset = zarrs::array_subset::ArraySubset::new_with_start_shape(vec![0], vec![len])?;
        let values = array.retrieve_array_subset_ndarray::<f64>(&subset)?;
        Ok(values.iter().copied().collect())
    }

    pub fn has_group(&self, path: &str) -> Result<bool> {
        group_exists(&self.store, path)
    }

    pub fn has_array(&self, path: &str) -> Result<bool> {
        array_exists(&self.store, path)
    }

    /// Names of the direct children of a group, sorted
    pub fn children(&self, path: &str) -> Result<Vec<String>> {
        let directory = self.path.join(path.trim_matches('/'));
        let mut names = Vec::new();
        for entry in std::fs::read_dir(directory)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() && entry.path().join("zarr.json").is_file() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// An output container written into a hidden sibling directory and moved
/// into place only by [`StagedOutput::commit`]. Dropping it without a
/// commit removes everything written so far.
pub struct StagedOutput {
    final_path: PathBuf,
    staging: tempfile::TempDir,
    lock: File,
}

impl StagedOutput {
    pub fn begin(final_path: &Path, overwrite: bool) -> Result<Self> {
        let parent = final_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = final_path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("Output path {} has no file name", final_path.display()))?
            .to_string_lossy()
            .to_string();

        std::fs::create_dir_all(parent)?;

        // Exclusive lock next to the output, held until commit or drop
        let lock_path = parent.join(format!(".{name}.lock"));
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        lock.try_lock_exclusive().map_err(|_| {
            anyhow::anyhow!("Another conversion is writing {}", final_path.display())
        })?;

        // Checked under the lock so two runs cannot both pass it
        if final_path.exists() && !overwrite {
            anyhow::bail!(
                "{} already exists (use --overwrite to replace it)",
                final_path.display()
            );
        }

        // Same parent directory, so the final rename stays on one filesystem
        let staging = tempfile::Builder::new()
            .prefix(&format!(".{name}.partial-"))
            .tempdir_in(parent)?;

        tracing::debug!("Staging {} in {}", final_path.display(), staging.path().display());

        Ok(Self {
            final_path: final_path.to_path_buf(),
            staging,
            lock,
        })
    }

    pub fn staging_path(&self) -> &Path {
        self.staging.path()
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Replace any previous container with the staged one
    pub fn commit(self) -> Result<PathBuf> {
        // Only reached with overwrite, checked in begin()
        if self.final_path.exists() {
            std::fs::remove_dir_all(&self.final_path)?;
        }
        std::fs::rename(self.staging.path(), &self.final_path)?;
        self.lock.unlock()?;
        Ok(self.final_path)
    }
}
