//! Ray-traced frame rendering
//!
//! Descriptor sets bound for the dispatch:
//!
//! | set | binding | contents                               |
//! |-----|---------|----------------------------------------|
//! | 0   | 0       | render target (storage image, GENERAL) |
//! | 0   | 1       | scene top-level acceleration structure |
//! | 0   | 2       | [`CameraUniform`]                      |
//! | 1   | 0..=2   | bindless images, materials, geometry   |
//!
//! Each frame traces into the render target, then transfers it into the
//! acquired swapchain image and leaves that image ready for presentation.
//! The render target is a storage image and stays `R8G8B8A8_UNORM`; when the
//! swapchain uses another format (BGRA or sRGB surfaces) the transfer is a
//! blit, which converts channel order and encoding.

use ash::{vk, Device};
use bytemuck::{Pod, Zeroable};
use std::sync::Arc;

use crate::config::{CameraConfig, RendererConfig};
use crate::foundation::math::{look_at, perspective, to_cols_array_2d, Mat4, Vec3};
use crate::render::backends::vulkan::acceleration::top_level::TopLevelAccelerationStructure;
use crate::render::backends::vulkan::rendering::commands::{blit_image_to_image, copy_image_to_image};
use crate::render::backends::vulkan::rendering::ray_tracing_pipeline::RayTracingPipeline;
use crate::render::backends::vulkan::rendering::transitions::transition_image_layout;
use crate::render::backends::vulkan::resources::bindless::BindlessResources;
use crate::render::backends::vulkan::resources::buffer::{Buffer, BufferCreation};
use crate::render::backends::vulkan::resources::descriptor_set::{
    DescriptorPool, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorSetWriter,
};
use crate::render::backends::vulkan::resources::image::{Image, ImageCreation};
use crate::render::backends::vulkan::state::frame_pipeline::{FramePipeline, SwapchainTarget};
use crate::render::backends::vulkan::{VulkanContext, VulkanError, VulkanResult};

const RENDER_TARGET_BINDING: u32 = 0;
const TLAS_BINDING: u32 = 1;
const CAMERA_BINDING: u32 = 2;

/// Format of the ray-traced render target
pub const RENDER_TARGET_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Camera data read by the ray generation shader
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraUniform {
    /// Inverse view matrix, column-major
    pub view_inverse: [[f32; 4]; 4],
    /// Inverse projection matrix, column-major
    pub proj_inverse: [[f32; 4]; 4],
}

impl CameraUniform {
    /// Build inverse matrices for `camera` at the given aspect ratio
    ///
    /// The projection has its Y axis flipped to match Vulkan's clip space.
    pub fn from_camera(camera: &CameraConfig, aspect: f32) -> Self {
        let view = look_at(
            Vec3::from(camera.position),
            Vec3::from(camera.target),
            Vec3::from(camera.up),
        );
        let mut projection = perspective(camera.fov_y_degrees, aspect, camera.near, camera.far);
        projection[(1, 1)] *= -1.0;

        let invert = |matrix: Mat4| matrix.try_inverse().unwrap_or_else(Mat4::identity);
        Self {
            view_inverse: to_cols_array_2d(&invert(view)),
            proj_inverse: to_cols_array_2d(&invert(projection)),
        }
    }
}

/// How the render target reaches the swapchain image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentTransfer {
    /// Formats match, so a raw copy is exact
    Copy,
    /// Formats differ, so the transfer must convert
    Blit,
}

/// Transfer needed to move `render_format` texels into a `swapchain_format` image
pub fn present_transfer(render_format: vk::Format, swapchain_format: vk::Format) -> PresentTransfer {
    if render_format == swapchain_format {
        PresentTransfer::Copy
    } else {
        PresentTransfer::Blit
    }
}

/// Swapchain image for an acquired index
pub fn swapchain_image(images: &[vk::Image], image_index: u32) -> VulkanResult<vk::Image> {
    images
        .get(image_index as usize)
        .copied()
        .ok_or_else(|| VulkanError::InvalidOperation {
            reason: format!(
                "acquired swapchain image {} but the target lists {} images",
                image_index,
                images.len()
            ),
        })
}

fn aspect_ratio(extent: vk::Extent2D) -> f32 {
    if extent.height == 0 {
        1.0
    } else {
        extent.width as f32 / extent.height as f32
    }
}

/// Renders a ray-traced scene into host-owned swapchain images
///
/// The renderer borrows the scene's top-level structure and the bindless
/// resources its descriptor sets point at, so neither can be dropped or
/// modified while it is alive:
///
/// ```compile_fail
/// # use std::sync::Arc;
/// # use ash::vk;
/// # use rt_engine::prelude::*;
/// # fn frame(
/// #     context: &Arc<VulkanContext>,
/// #     config: &RendererConfig,
/// #     bindless: &BindlessResources,
/// #     tlas: TopLevelAccelerationStructure,
/// #     target: &SwapchainTarget,
/// # ) -> VulkanResult<()> {
/// let extent = vk::Extent2D { width: 800, height: 600 };
/// let mut renderer = RayTracingRenderer::new(context, config, extent, &tlas, bindless)?;
/// drop(tlas);
/// renderer.render(target)?;
/// # Ok(())
/// # }
/// ```
pub struct RayTracingRenderer<'a> {
    frames: FramePipeline,
    pipeline: RayTracingPipeline,
    scene_descriptor_set: vk::DescriptorSet,
    scene: &'a TopLevelAccelerationStructure,
    bindless: &'a BindlessResources,
    _scene_pool: DescriptorPool,
    _scene_layout: DescriptorSetLayout,
    camera_buffer: Buffer,
    render_target: Image,
    camera: CameraConfig,
    context: Arc<VulkanContext>,
}

impl<'a> RayTracingRenderer<'a> {
    /// Create the render target, camera uniform, scene descriptors, pipeline
    /// and frame pipeline
    pub fn new(
        context: &Arc<VulkanContext>,
        config: &RendererConfig,
        extent: vk::Extent2D,
        scene: &'a TopLevelAccelerationStructure,
        bindless: &'a BindlessResources,
    ) -> VulkanResult<Self> {
        let device = context.device();
        let stages = vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR;

        let scene_layout = DescriptorSetLayoutBuilder::new()
            .add_storage_image(RENDER_TARGET_BINDING, vk::ShaderStageFlags::RAYGEN_KHR)
            .add_acceleration_structure(TLAS_BINDING, stages)
            .add_uniform_buffer(CAMERA_BINDING, vk::ShaderStageFlags::RAYGEN_KHR)
            .build(device)?;

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: 1,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                descriptor_count: 1,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 1,
            },
        ];
        let scene_pool = DescriptorPool::new(device.clone(), &pool_sizes, 1, vk::DescriptorPoolCreateFlags::empty())?;
        let scene_descriptor_set = scene_pool.allocate(&scene_layout)?;

        let render_target = Self::create_render_target(context, extent)?;

        let camera_buffer = Buffer::new(
            context,
            &BufferCreation {
                size: std::mem::size_of::<CameraUniform>() as vk::DeviceSize,
                usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
                mappable: true,
                memory_usage: vk_mem::MemoryUsage::CpuToGpu,
                name: "camera uniform".to_string(),
            },
        )?;
        camera_buffer.write(&[CameraUniform::from_camera(&config.camera, aspect_ratio(extent))])?;

        DescriptorSetWriter::new(scene_descriptor_set)
            .images(
                RENDER_TARGET_BINDING,
                vk::DescriptorType::STORAGE_IMAGE,
                vec![Self::render_target_info(&render_target)],
            )
            .acceleration_structure(TLAS_BINDING, scene.structure().handle())
            .buffer(
                CAMERA_BINDING,
                vk::DescriptorType::UNIFORM_BUFFER,
                camera_buffer.handle(),
                camera_buffer.size(),
            )
            .update(device);

        let set_layouts = [scene_layout.handle(), bindless.descriptor_set_layout().handle()];
        let pipeline = RayTracingPipeline::new(context, &config.shaders, &set_layouts)?;
        let frames = FramePipeline::new(context, config.frames_in_flight)?;

        log::info!(
            "[RENDERER] Ray tracing renderer ready at {}x{}",
            extent.width,
            extent.height
        );

        Ok(Self {
            frames,
            pipeline,
            scene_descriptor_set,
            scene,
            bindless,
            _scene_pool: scene_pool,
            _scene_layout: scene_layout,
            camera_buffer,
            render_target,
            camera: config.camera.clone(),
            context: Arc::clone(context),
        })
    }

    fn create_render_target(context: &Arc<VulkanContext>, extent: vk::Extent2D) -> VulkanResult<Image> {
        Image::new(
            context,
            &ImageCreation {
                width: extent.width,
                height: extent.height,
                format: RENDER_TARGET_FORMAT,
                usage: vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
                name: "ray tracing render target".to_string(),
                ..Default::default()
            },
        )
    }

    fn render_target_info(render_target: &Image) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: render_target.view(),
            image_layout: vk::ImageLayout::GENERAL,
        }
    }

    /// Extent of the render target
    pub fn extent(&self) -> vk::Extent2D {
        self.render_target.extent()
    }

    /// Top-level structure the renderer traces against
    pub fn scene(&self) -> &TopLevelAccelerationStructure {
        self.scene
    }

    /// Replace the camera and rewrite the camera uniform
    ///
    /// Waits for queued frames first, since they read the same uniform.
    pub fn update_camera(&mut self, camera: CameraConfig) -> VulkanResult<()> {
        self.frames.wait_all()?;
        let uniform = CameraUniform::from_camera(&camera, aspect_ratio(self.extent()));
        self.camera_buffer.write(&[uniform])?;
        self.camera = camera;
        Ok(())
    }

    /// Recreate the render target after the swapchain changed size
    pub fn resize(&mut self, extent: vk::Extent2D) -> VulkanResult<()> {
        if extent == self.extent() {
            return Ok(());
        }
        self.context.wait_idle()?;

        self.render_target = Self::create_render_target(&self.context, extent)?;
        DescriptorSetWriter::new(self.scene_descriptor_set)
            .images(
                RENDER_TARGET_BINDING,
                vk::DescriptorType::STORAGE_IMAGE,
                vec![Self::render_target_info(&self.render_target)],
            )
            .update(self.context.device());

        let camera = self.camera.clone();
        self.update_camera(camera)?;
        log::info!("[RENDERER] Render target resized to {}x{}", extent.width, extent.height);
        Ok(())
    }

    /// Render and present one frame, returning the presented image index
    pub fn render(&mut self, target: &SwapchainTarget) -> VulkanResult<u32> {
        if target.extent != self.extent() {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "swapchain extent {}x{} differs from render target {}x{}; call resize first",
                    target.extent.width,
                    target.extent.height,
                    self.extent().width,
                    self.extent().height
                ),
            });
        }

        if target.images.is_empty() {
            return Err(VulkanError::InvalidOperation {
                reason: "swapchain target has no images".to_string(),
            });
        }

        let pipeline = &self.pipeline;
        let render_target = &self.render_target;
        let descriptor_sets = [self.scene_descriptor_set, self.bindless.descriptor_set()];
        let transfer = present_transfer(render_target.format(), target.format);
        let images = target.images;

        self.frames.render_frame(target, |device, command_buffer, image_index| {
            let image = swapchain_image(images, image_index)?;
            record_frame(
                device,
                command_buffer,
                pipeline,
                &descriptor_sets,
                render_target,
                image,
                transfer,
            );
            Ok(())
        })
    }
}

fn record_frame(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    pipeline: &RayTracingPipeline,
    descriptor_sets: &[vk::DescriptorSet],
    render_target: &Image,
    swapchain_image: vk::Image,
    transfer: PresentTransfer,
) {
    let extent = render_target.extent();

    transition_image_layout(
        device,
        command_buffer,
        render_target.handle(),
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::GENERAL,
    );

    pipeline.bind(device, command_buffer, descriptor_sets);
    pipeline.trace_rays(command_buffer, extent.width, extent.height);

    transition_image_layout(
        device,
        command_buffer,
        render_target.handle(),
        vk::ImageLayout::GENERAL,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    );
    // Previous contents are overwritten entirely
    transition_image_layout(
        device,
        command_buffer,
        swapchain_image,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    );

    match transfer {
        PresentTransfer::Copy => {
            copy_image_to_image(device, command_buffer, render_target.handle(), swapchain_image, extent);
        }
        PresentTransfer::Blit => {
            blit_image_to_image(device, command_buffer, render_target.handle(), swapchain_image, extent);
        }
    }

    transition_image_layout(
        device,
        command_buffer,
        swapchain_image,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::PRESENT_SRC_KHR,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec4;
    use approx::assert_relative_eq;

    fn column_major(columns: &[[f32; 4]; 4]) -> Mat4 {
        Mat4::from_fn(|row, column| columns[column][row])
    }

    #[test]
    fn test_camera_uniform_size() {
        assert_eq!(std::mem::size_of::<CameraUniform>(), 128);
    }

    #[test]
    fn test_view_inverse_maps_origin_to_eye() {
        let camera = CameraConfig {
            position: [1.0, 2.0, 3.0],
            target: [0.0, 0.0, 0.0],
            ..Default::default()
        };
        let uniform = CameraUniform::from_camera(&camera, 16.0 / 9.0);

        let eye = column_major(&uniform.view_inverse) * Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert_relative_eq!(eye.x, 1.0, epsilon = 1e-5);
        assert_relative_eq!(eye.y, 2.0, epsilon = 1e-5);
        assert_relative_eq!(eye.z, 3.0, epsilon = 1e-5);
    }

    #[test]
    fn test_projection_is_y_flipped() {
        let uniform = CameraUniform::from_camera(&CameraConfig::default(), 1.0);
        let inverse = column_major(&uniform.proj_inverse);
        let projection = inverse.try_inverse().unwrap();
        assert!(projection[(1, 1)] < 0.0);
    }

    #[test]
    fn test_matching_swapchain_format_is_copied() {
        assert_eq!(present_transfer(RENDER_TARGET_FORMAT, vk::Format::R8G8B8A8_UNORM), PresentTransfer::Copy);
    }

    #[test]
    fn test_bgra_and_srgb_swapchains_are_blitted() {
        assert_eq!(present_transfer(RENDER_TARGET_FORMAT, vk::Format::B8G8R8A8_UNORM), PresentTransfer::Blit);
        assert_eq!(present_transfer(RENDER_TARGET_FORMAT, vk::Format::B8G8R8A8_SRGB), PresentTransfer::Blit);
        assert_eq!(present_transfer(RENDER_TARGET_FORMAT, vk::Format::R8G8B8A8_SRGB), PresentTransfer::Blit);
    }

    #[test]
    fn test_acquired_index_outside_target_is_an_error() {
        let images = [vk::Image::null(), vk::Image::null()];
        assert!(swapchain_image(&images, 1).is_ok());
        assert!(matches!(swapchain_image(&images, 2), Err(VulkanError::InvalidOperation { .. })));
        assert!(swapchain_image(&[], 0).is_err());
    }

    #[test]
    fn test_aspect_ratio_guards_zero_height() {
        assert_relative_eq!(aspect_ratio(vk::Extent2D { width: 800, height: 0 }), 1.0);
        assert_relative_eq!(aspect_ratio(vk::Extent2D { width: 800, height: 400 }), 2.0);
    }
}
