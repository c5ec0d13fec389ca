//! WGSL shaders for the two presentation paths and the letterbox transform they share.

/// Uniform buffer structure (must match `Letterbox` in the WGSL sources)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "gpu", derive(bytemuck::Pod, bytemuck::Zeroable))]
pub struct LetterboxUniform {
    /// Fraction of the output covered by the frame on each axis
    pub scale: [f32; 2],
    pub _padding: [f32; 2],
}

impl LetterboxUniform {
    /// Fit a `frame_w` x `frame_h` frame inside the output, preserving aspect ratio.
    pub fn fit(frame_w: u32, frame_h: u32, output_w: u32, output_h: u32) -> Self {
        let mut scale = [1.0, 1.0];
        if frame_w > 0 && frame_h > 0 && output_w > 0 && output_h > 0 {
            let frame_aspect = frame_w as f32 / frame_h as f32;
            let output_aspect = output_w as f32 / output_h as f32;
            if frame_aspect > output_aspect {
                // bars top and bottom
                scale[1] = output_aspect / frame_aspect;
            } else {
                scale[0] = frame_aspect / output_aspect;
            }
        }
        Self {
            scale,
            _padding: [0.0; 2],
        }
    }
}

/// Vertex stage shared by both paths: a letterboxed quad from the vertex index.
const VERTEX_STAGE: &str = r#"
    struct Letterbox {
        scale: vec2<f32>,
        _padding: vec2<f32>,
    };

    @group(0) @binding(0) var<uniform> letterbox: Letterbox;

    struct VertexOutput {
        @location(0) tex_coords: vec2<f32>,
        @builtin(position) clip_position: vec4<f32>,
    };

    @vertex
    fn vs_main(@builtin(vertex_index) index: u32) -> VertexOutput {
        // two triangles: 0 1 2, 2 1 3
        var corners = array<vec2<f32>, 6>(
            vec2<f32>(0.0, 0.0),
            vec2<f32>(1.0, 0.0),
            vec2<f32>(0.0, 1.0),
            vec2<f32>(0.0, 1.0),
            vec2<f32>(1.0, 0.0),
            vec2<f32>(1.0, 1.0),
        );
        let uv = corners[index];
        var out: VertexOutput;
        let ndc = vec2<f32>(uv.x * 2.0 - 1.0, 1.0 - uv.y * 2.0);
        out.clip_position = vec4<f32>(ndc * letterbox.scale, 0.0, 1.0);
        out.tex_coords = uv;
        return out;
    }
"#;

/// Biplanar path: R8 luma and RG8 chroma textures, BT.601 limited range to RGB.
const NV12_FRAGMENT: &str = r#"
    @group(0) @binding(1) var t_luma: texture_2d<f32>;
    @group(0) @binding(2) var t_chroma: texture_2d<f32>;
    @group(0) @binding(3) var s_sampler: sampler;

    @fragment
    fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
        let y = (textureSample(t_luma, s_sampler, in.tex_coords).r - 16.0 / 255.0) * 1.164;
        let uv = textureSample(t_chroma, s_sampler, in.tex_coords).rg - vec2<f32>(0.5, 0.5);
        let r = y + 1.596 * uv.y;
        let g = y - 0.391 * uv.x - 0.813 * uv.y;
        let b = y + 2.018 * uv.x;
        return vec4<f32>(clamp(vec3<f32>(r, g, b), vec3<f32>(0.0), vec3<f32>(1.0)), 1.0);
    }
"#;

/// Packed path: a single BGRA texture, swizzled by the texture format.
const BGRA_FRAGMENT: &str = r#"
    @group(0) @binding(1) var t_image: texture_2d<f32>;
    @group(0) @binding(2) var s_sampler: sampler;

    @fragment
    fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
        return vec4<f32>(textureSample(t_image, s_sampler, in.tex_coords).rgb, 1.0);
    }
"#;

/// Full WGSL source of the biplanar pipeline.
pub fn nv12_source() -> String {
    format!("{}{}", VERTEX_STAGE, NV12_FRAGMENT)
}

/// Full WGSL source of the packed pipeline.
pub fn bgra_source() -> String {
    format!("{}{}", VERTEX_STAGE, BGRA_FRAGMENT)
}

/// Compile a shader module from WGSL source
#[cfg(feature = "gpu")]
pub fn compile_shader(device: &wgpu::Device, label: &str, source: &str) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_wide_frame_in_square_output() {
        let fit = LetterboxUniform::fit(1920, 1080, 500, 500);
        assert_eq!(fit.scale[0], 1.0);
        assert!((fit.scale[1] - 0.5625).abs() < 1e-6);
    }

    #[test]
    fn test_fit_tall_frame_in_wide_output() {
        let fit = LetterboxUniform::fit(1080, 1920, 1920, 1080);
        assert!((fit.scale[0] - 0.316_406_25).abs() < 1e-6);
        assert_eq!(fit.scale[1], 1.0);
    }

    #[test]
    fn test_degenerate_sizes_fill_output() {
        assert_eq!(LetterboxUniform::fit(0, 0, 100, 100).scale, [1.0, 1.0]);
        assert_eq!(LetterboxUniform::fit(640, 360, 0, 100).scale, [1.0, 1.0]);
    }

    #[test]
    fn test_sources_share_vertex_stage() {
        for source in [nv12_source(), bgra_source()] {
            assert!(source.contains("fn vs_main"));
            assert!(source.contains("fn fs_main"));
        }
        assert!(nv12_source().contains("t_chroma"));
    }
}
