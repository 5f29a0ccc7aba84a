// Shader module loading
//
// Shaders arrive as pre-compiled SPIR-V blobs on disk (see build.rs). They are
// opaque to the pipeline; an unreadable blob is a setup failure.

use anyhow::{Context, Result};
use ash::vk;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use super::DeviceContext;
use crate::error::RenderError;

/// Read a SPIR-V blob into 4-byte words.
pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let mut file = File::open(path).map_err(|source| RenderError::ShaderUnreadable {
        path: path.to_path_buf(),
        source,
    })?;

    // read_spv checks the magic number and fixes alignment/endianness
    ash::util::read_spv(&mut file).map_err(|source| {
        RenderError::ShaderUnreadable {
            path: path.to_path_buf(),
            source,
        }
        .into()
    })
}

/// Shader module that lives only as long as pipeline creation needs it.
pub struct ShaderModule {
    pub module: vk::ShaderModule,
    device: Arc<DeviceContext>,
}

impl ShaderModule {
    pub fn from_file(device: Arc<DeviceContext>, path: &Path) -> Result<Self> {
        let code = load_spirv(path)?;
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

        let module = unsafe { device.device.create_shader_module(&create_info, None) }
            .with_context(|| format!("Failed to create shader module from {:?}", path))?;

        log::debug!("Loaded shader {:?} ({} words)", path, code.len());
        Ok(Self { module, device })
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_shader_module(self.module, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn reads_words_from_valid_blob() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let words = [SPIRV_MAGIC, 0x0001_0000, 0, 8, 0];
        for word in words {
            file.write_all(&word.to_le_bytes()).unwrap();
        }

        let code = load_spirv(file.path()).unwrap();
        assert_eq!(code, words);
    }

    #[test]
    fn missing_blob_is_shader_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_spirv(&dir.path().join("missing.spv")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RenderError>(),
            Some(RenderError::ShaderUnreadable { .. })
        ));
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x03, 0x02, 0x23]).unwrap();
        assert!(load_spirv(file.path()).is_err());
    }
}
