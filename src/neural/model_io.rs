//! Model and optimizer state I/O using the safetensors format.
//!
//! Serialization is portable across libtorch builds and deterministic:
//! tensors are written in name order with little-endian f32/i64 payloads,
//! so save → load → save reproduces the file byte for byte (the checkpoint
//! round-trip contract).

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use safetensors::serialize_to_file;
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use tch::{nn, Kind, Tensor};

use crate::error::{Result, TrainingError};

/// Save every variable of a VarStore, name-sorted.
pub fn save_varstore(vs: &nn::VarStore, path: impl AsRef<Path>) -> Result<()> {
    let entries: Vec<(String, Tensor)> = vs.variables().into_iter().collect();
    save_named_tensors(&entries, path)
}

/// Load a VarStore saved by [`save_varstore`].
///
/// All shapes are validated against the live network before anything is
/// copied, so a mismatch leaves the existing parameters untouched.
pub fn load_varstore(vs: &mut nn::VarStore, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let loaded = load_named_tensors(path)?;

    let live = vs.variables();
    for (name, var) in &live {
        let stored = loaded
            .get(name)
            .ok_or_else(|| TrainingError::ArchitectureMismatch {
                path: path.to_path_buf(),
                detail: format!("tensor '{name}' missing from checkpoint"),
            })?;
        if stored.size() != var.size() {
            return Err(TrainingError::ArchitectureMismatch {
                path: path.to_path_buf(),
                detail: format!(
                    "tensor '{name}' has shape {:?}, expected {:?}",
                    stored.size(),
                    var.size()
                ),
            });
        }
    }

    tch::no_grad(|| {
        for (name, mut var) in live {
            var.copy_(&loaded[&name]);
        }
    });
    Ok(())
}

/// Serialize named tensors (f32 or i64) to a safetensors file.
pub fn save_named_tensors(entries: &[(String, Tensor)], path: impl AsRef<Path>) -> Result<()> {
    // Sorted map fixes the on-disk layout regardless of caller order.
    let mut payloads: BTreeMap<String, (Dtype, Vec<usize>, Vec<u8>)> = BTreeMap::new();
    for (name, tensor) in entries {
        let shape: Vec<usize> = tensor.size().iter().map(|&d| d as usize).collect();
        let (dtype, bytes) = tensor_bytes(tensor)?;
        payloads.insert(name.clone(), (dtype, shape, bytes));
    }

    let views: Vec<(&str, TensorView<'_>)> = payloads
        .iter()
        .map(|(name, (dtype, shape, bytes))| {
            let view = TensorView::new(*dtype, shape.clone(), bytes)
                .map_err(|e| TrainingError::Encoding(format!("tensor '{name}': {e:?}")))?;
            Ok((name.as_str(), view))
        })
        .collect::<Result<_>>()?;

    serialize_to_file(views, &None, path.as_ref())
        .map_err(|e| TrainingError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    Ok(())
}

/// Read back a safetensors file written by [`save_named_tensors`].
pub fn load_named_tensors(path: impl AsRef<Path>) -> Result<BTreeMap<String, Tensor>> {
    let mut file = File::open(path.as_ref())?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;

    let tensors = SafeTensors::deserialize(&buffer)
        .map_err(|e| TrainingError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

    let mut out = BTreeMap::new();
    for (name, view) in tensors.tensors() {
        out.insert(name.to_string(), view_to_tensor(&view)?);
    }
    Ok(out)
}

fn tensor_bytes(tensor: &Tensor) -> Result<(Dtype, Vec<u8>)> {
    let flat = tensor
        .to_device(tch::Device::Cpu)
        .flatten(0, -1)
        .contiguous();
    match tensor.kind() {
        Kind::Float => {
            let data: Vec<f32> = Vec::<f32>::try_from(&flat)?;
            Ok((
                Dtype::F32,
                data.iter().flat_map(|x| x.to_le_bytes()).collect(),
            ))
        }
        Kind::Int64 => {
            let data: Vec<i64> = Vec::<i64>::try_from(&flat)?;
            Ok((
                Dtype::I64,
                data.iter().flat_map(|x| x.to_le_bytes()).collect(),
            ))
        }
        other => Err(TrainingError::Encoding(format!(
            "unsupported tensor kind {other:?} in checkpoint"
        ))),
    }
}

fn view_to_tensor(view: &TensorView) -> Result<Tensor> {
    let shape: Vec<i64> = view.shape().iter().map(|&d| d as i64).collect();
    let data = view.data();
    match view.dtype() {
        Dtype::F32 => {
            let floats: Vec<f32> = data
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect();
            Ok(Tensor::from_slice(&floats).reshape(&shape))
        }
        Dtype::I64 => {
            let longs: Vec<i64> = data
                .chunks_exact(8)
                .map(|chunk| {
                    i64::from_le_bytes([
                        chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6],
                        chunk[7],
                    ])
                })
                .collect();
            Ok(Tensor::from_slice(&longs).reshape(&shape))
        }
        other => Err(TrainingError::Encoding(format!(
            "unsupported dtype {other:?} in checkpoint"
        ))),
    }
}
