// Shader bytecode loading
//
// Reads compiled SPIR-V from disk. The bytes are owned by ShaderSource and
// released with it, whichever way the caller leaves.

use std::fs;
use std::path::Path;

use crate::error::{RenderError, RenderResult};

/// Raw SPIR-V for a vertex/fragment pair.
#[derive(Debug, Clone, Default)]
pub struct ShaderSource {
    pub vertex: Vec<u8>,
    pub fragment: Vec<u8>,
}

impl ShaderSource {
    pub fn load<V, F>(vertex_path: V, fragment_path: F) -> RenderResult<Self>
    where
        V: AsRef<Path>,
        F: AsRef<Path>,
    {
        let vertex = read_file(vertex_path.as_ref())?;
        let fragment = read_file(fragment_path.as_ref())?;

        log::info!(
            "Loaded shaders {:?} ({} bytes), {:?} ({} bytes)",
            vertex_path.as_ref(),
            vertex.len(),
            fragment_path.as_ref(),
            fragment.len()
        );

        Ok(Self { vertex, fragment })
    }
}

fn read_file(path: &Path) -> RenderResult<Vec<u8>> {
    fs::read(path).map_err(|source| RenderError::ShaderLoad {
        path: path.to_path_buf(),
        source,
    })
}
