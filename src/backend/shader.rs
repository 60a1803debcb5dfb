// Shader module loading
//
// Vulkan consumes SPIR-V bytecode. The build script compiles the GLSL in
// shaders/ and the renderer loads the result from disk at startup.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;

use super::VulkanDevice;

/// Read a SPIR-V binary into 32-bit words.
pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to open binary file {:?}", path))?;
    let words = parse_spirv(&bytes).with_context(|| format!("Invalid SPIR-V in {:?}", path))?;

    log::debug!("Binary file loaded {:?} ({}B)", path, bytes.len());
    Ok(words)
}

/// Reinterpret bytes as SPIR-V words. The length must be a multiple of four.
pub fn parse_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    // read_spv copies into aligned storage and fixes byte-swapped input
    Ok(ash::util::read_spv(&mut Cursor::new(bytes))?)
}

pub fn create_shader_module(device: &VulkanDevice, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    unsafe { device.device.create_shader_module(&create_info, None) }
        .context("Failed to create shader module")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: u32 = 0x0723_0203;

    #[test]
    fn parses_little_endian_words() {
        let mut bytes = MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        assert_eq!(parse_spirv(&bytes).unwrap(), vec![MAGIC, 0x0001_0000]);
    }

    #[test]
    fn rejects_truncated_words() {
        let mut bytes = MAGIC.to_le_bytes().to_vec();
        bytes.push(0);
        assert!(parse_spirv(&bytes).is_err());
    }

    #[test]
    fn missing_file_is_fatal() {
        let err = load_spirv(Path::new("no/such/shader.spv")).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to open binary file"));
    }
}
