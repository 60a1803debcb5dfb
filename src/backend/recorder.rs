// Per-frame draw command recording
//
// Stateless: everything the draw needs comes in through `DrawInputs`, so the
// same function is safe to call every frame against any slot.

use anyhow::{Context, Result};
use ash::vk;

/// Handles and sizes for one recorded draw
#[derive(Debug, Clone, Copy)]
pub struct DrawInputs {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub pipeline: vk::Pipeline,
    pub pipeline_layout: vk::PipelineLayout,
    pub descriptor_set: vk::DescriptorSet,
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub index_count: u32,
    pub clear_color: [f32; 4],
}

/// Clear values in attachment order: colour, then depth.
pub fn clear_values(clear_color: [f32; 4]) -> [vk::ClearValue; 2] {
    [
        vk::ClearValue {
            color: vk::ClearColorValue { float32: clear_color },
        },
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
    ]
}

/// Viewport and scissor covering the whole extent.
pub fn full_viewport(extent: vk::Extent2D) -> (vk::Viewport, vk::Rect2D) {
    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    (viewport, scissor)
}

/// Record one indexed draw of the whole index buffer into `cmd`.
///
/// `cmd` must already be reset.
pub fn record_draw(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    inputs: &DrawInputs,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::builder();
    let clear_values = clear_values(inputs.clear_color);
    let (viewport, scissor) = full_viewport(inputs.extent);

    let render_pass_info = vk::RenderPassBeginInfo::builder()
        .render_pass(inputs.render_pass)
        .framebuffer(inputs.framebuffer)
        .render_area(scissor)
        .clear_values(&clear_values);

    unsafe {
        device
            .begin_command_buffer(cmd, &begin_info)
            .context("Failed to begin command buffer")?;

        device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, inputs.pipeline);
        device.cmd_set_viewport(cmd, 0, &[viewport]);
        device.cmd_set_scissor(cmd, 0, &[scissor]);

        device.cmd_bind_vertex_buffers(cmd, 0, &[inputs.vertex_buffer], &[0]);
        device.cmd_bind_index_buffer(cmd, inputs.index_buffer, 0, vk::IndexType::UINT32);
        device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::GRAPHICS,
            inputs.pipeline_layout,
            0,
            &[inputs.descriptor_set],
            &[],
        );

        device.cmd_draw_indexed(cmd, inputs.index_count, 1, 0, 0, 0);
        device.cmd_end_render_pass(cmd);

        device
            .end_command_buffer(cmd)
            .context("Failed to end command buffer")?;
    }

    Ok(())
}
