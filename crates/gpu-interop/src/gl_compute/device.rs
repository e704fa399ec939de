//! [`GlInteropDevice`]: OpenGL 4.5 compute inside the host's context.
//!
//! Surfaces are GL textures, device memory is buffer objects, and pitched
//! transfers go through pixel pack/unpack buffers with a row length set to
//! the pitch. The driver serializes all work in one context, so `map` and
//! `synchronize` reduce to a memory barrier plus `glFinish`.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::sync::Once;

use gl::types::{GLenum, GLint, GLsizei, GLsizeiptr, GLuint};
use nnao_core::{SurfaceDesc, SurfaceFormat, SurfaceHandle};

use super::program::{check_gl, clear_gl_errors, compile_compute, is_context_current};
use crate::device::{ArrayHandle, DevicePtr, InteropDevice, MapFlags, ResourceHandle};
use crate::error::{InteropError, Result};
use crate::kernels::shaders::{self, KERNEL_SHADERS, PARAMS_SIZE, WORKGROUP_SIZE};
use crate::kernels::KernelLaunch;
use crate::pitched::{aligned_pitch, PitchedView};

static GL_INIT_ONCE: Once = Once::new();

/// Load GL function pointers through `gl_loader`, once per process.
fn load_gl() {
    GL_INIT_ONCE.call_once(|| {
        gl_loader::init_gl();
        gl::load_with(|s| gl_loader::get_proc_address(s).cast());
    });
}

fn internal_format(format: SurfaceFormat) -> GLenum {
    match format {
        SurfaceFormat::Rgba8Uint => gl::RGBA8UI,
        SurfaceFormat::Rgba8Unorm => gl::RGBA8,
        SurfaceFormat::R32Float => gl::R32F,
    }
}

/// Client pixel format and type for transfers of `format`.
fn transfer_format(format: SurfaceFormat) -> (GLenum, GLenum) {
    match format {
        SurfaceFormat::Rgba8Uint => (gl::RGBA_INTEGER, gl::UNSIGNED_BYTE),
        SurfaceFormat::Rgba8Unorm => (gl::RGBA, gl::UNSIGNED_BYTE),
        SurfaceFormat::R32Float => (gl::RED, gl::FLOAT),
    }
}

fn surface_format(internal: GLenum) -> Option<SurfaceFormat> {
    match internal {
        gl::RGBA8UI => Some(SurfaceFormat::Rgba8Uint),
        gl::RGBA8 => Some(SurfaceFormat::Rgba8Unorm),
        gl::R32F => Some(SurfaceFormat::R32Float),
        _ => None,
    }
}

fn texture_name(surface: SurfaceHandle) -> Result<GLuint> {
    GLuint::try_from(surface.0).map_err(|_| InteropError::UnknownHandle(surface.0))
}

fn buffer_name(ptr: DevicePtr) -> Result<GLuint> {
    GLuint::try_from(ptr.0).map_err(|_| InteropError::UnknownHandle(ptr.0))
}

#[derive(Debug)]
struct GlRegistration {
    texture: GLuint,
    desc: SurfaceDesc,
    flags: MapFlags,
    mapped: bool,
}

#[derive(Debug, Default)]
struct GlState {
    next_resource: u64,
    registrations: HashMap<u64, GlRegistration>,
    registered_textures: HashSet<GLuint>,
    owned_textures: HashSet<GLuint>,
    /// Live buffer objects and their sizes.
    buffers: HashMap<GLuint, usize>,
}

impl GlState {
    fn registration(&self, resource: ResourceHandle) -> Result<&GlRegistration> {
        self.registrations
            .get(&resource.0)
            .ok_or(InteropError::UnknownHandle(resource.0))
    }

    fn registration_mut(&mut self, resource: ResourceHandle) -> Result<&mut GlRegistration> {
        self.registrations
            .get_mut(&resource.0)
            .ok_or(InteropError::UnknownHandle(resource.0))
    }

    /// Registration whose array is `array`, if it is currently mapped.
    fn mapped(&self, array: ArrayHandle) -> Result<&GlRegistration> {
        self.registrations
            .values()
            .find(|r| u64::from(r.texture) == array.0)
            .filter(|r| r.mapped)
            .ok_or(InteropError::NotMapped)
    }

    fn buffer_size(&self, ptr: DevicePtr) -> Result<usize> {
        let name = buffer_name(ptr)?;
        self.buffers
            .get(&name)
            .copied()
            .ok_or(InteropError::UnknownHandle(ptr.0))
    }
}

/// GL compute interop device. Must be created and used with the host's GL
/// context current on the calling thread.
pub struct GlInteropDevice {
    programs: HashMap<&'static str, GLuint>,
    params_ubo: GLuint,
    state: RefCell<GlState>,
}

impl GlInteropDevice {
    /// Load GL, compile the conversion kernels and create the parameter
    /// block.
    pub fn new() -> Result<Self> {
        load_gl();
        if !is_context_current() {
            return Err(InteropError::call("glGetString", "no GL context is current"));
        }
        clear_gl_errors();

        let mut programs = HashMap::new();
        for shader in &KERNEL_SHADERS {
            match compile_compute(shader.entry_point, shader.glsl) {
                Ok(program) => {
                    programs.insert(shader.entry_point, program);
                }
                Err(err) => {
                    for program in programs.values() {
                        unsafe { gl::DeleteProgram(*program) };
                    }
                    return Err(err);
                }
            }
        }

        let mut params_ubo: GLuint = 0;
        unsafe {
            gl::CreateBuffers(1, &mut params_ubo);
            gl::NamedBufferStorage(
                params_ubo,
                PARAMS_SIZE as GLsizeiptr,
                std::ptr::null(),
                gl::DYNAMIC_STORAGE_BIT,
            );
        }
        let device = Self {
            programs,
            params_ubo,
            state: RefCell::new(GlState::default()),
        };
        check_gl("glNamedBufferStorage")?;
        tracing::info!(kernels = device.programs.len(), "GL compute interop device ready");
        Ok(device)
    }

    fn query_texture(&self, texture: GLuint) -> Result<SurfaceDesc> {
        let mut width: GLint = 0;
        let mut height: GLint = 0;
        let mut internal: GLint = 0;
        unsafe {
            if gl::IsTexture(texture) == gl::FALSE {
                return Err(InteropError::UnknownHandle(u64::from(texture)));
            }
            gl::GetTextureLevelParameteriv(texture, 0, gl::TEXTURE_WIDTH, &mut width);
            gl::GetTextureLevelParameteriv(texture, 0, gl::TEXTURE_HEIGHT, &mut height);
            gl::GetTextureLevelParameteriv(texture, 0, gl::TEXTURE_INTERNAL_FORMAT, &mut internal);
        }
        check_gl("glGetTextureLevelParameteriv")?;
        let format = surface_format(internal as GLenum).ok_or_else(|| {
            InteropError::call(
                "glGetTextureLevelParameteriv",
                format!("texture {texture} has unsupported internal format 0x{internal:04X}"),
            )
        })?;
        Ok(SurfaceDesc::new(width as u32, height as u32, format))
    }
}

impl Drop for GlInteropDevice {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        if !st.buffers.is_empty() || !st.registrations.is_empty() {
            tracing::warn!(
                buffers = st.buffers.len(),
                registrations = st.registrations.len(),
                "GL interop device dropped with live resources"
            );
        }
        unsafe {
            for program in self.programs.values() {
                gl::DeleteProgram(*program);
            }
            gl::DeleteBuffers(1, &self.params_ubo);
        }
    }
}

impl InteropDevice for GlInteropDevice {
    fn name(&self) -> &str {
        "gl-compute"
    }

    fn surface_desc(&self, surface: SurfaceHandle) -> Result<SurfaceDesc> {
        clear_gl_errors();
        self.query_texture(texture_name(surface)?)
    }

    fn create_texture(&self, desc: &SurfaceDesc) -> Result<SurfaceHandle> {
        clear_gl_errors();
        let mut texture: GLuint = 0;
        unsafe {
            gl::CreateTextures(gl::TEXTURE_2D, 1, &mut texture);
            gl::TextureStorage2D(
                texture,
                1,
                internal_format(desc.format),
                desc.width as GLsizei,
                desc.height as GLsizei,
            );
            gl::TextureParameteri(texture, gl::TEXTURE_MIN_FILTER, gl::NEAREST as GLint);
            gl::TextureParameteri(texture, gl::TEXTURE_MAG_FILTER, gl::NEAREST as GLint);
        }
        if let Err(err) = check_gl("glTextureStorage2D") {
            unsafe { gl::DeleteTextures(1, &texture) };
            return Err(err);
        }
        self.state.borrow_mut().owned_textures.insert(texture);
        Ok(SurfaceHandle(u64::from(texture)))
    }

    fn release_texture(&self, texture: SurfaceHandle) -> Result<()> {
        let name = texture_name(texture)?;
        let mut st = self.state.borrow_mut();
        if st.registered_textures.contains(&name) {
            return Err(InteropError::call(
                "glDeleteTextures",
                format!("{texture} is still registered for interop"),
            ));
        }
        if !st.owned_textures.remove(&name) {
            return Err(InteropError::call(
                "glDeleteTextures",
                format!("{texture} was not created by this device"),
            ));
        }
        clear_gl_errors();
        unsafe { gl::DeleteTextures(1, &name) };
        check_gl("glDeleteTextures")
    }

    fn copy_surface(&self, dst: SurfaceHandle, src: SurfaceHandle) -> Result<()> {
        clear_gl_errors();
        let src_name = texture_name(src)?;
        let dst_name = texture_name(dst)?;
        let desc = self.query_texture(src_name)?;
        unsafe {
            gl::CopyImageSubData(
                src_name,
                gl::TEXTURE_2D,
                0,
                0,
                0,
                0,
                dst_name,
                gl::TEXTURE_2D,
                0,
                0,
                0,
                0,
                desc.width as GLsizei,
                desc.height as GLsizei,
                1,
            );
        }
        check_gl("glCopyImageSubData")
    }

    fn flush(&self) -> Result<()> {
        clear_gl_errors();
        unsafe { gl::Flush() };
        check_gl("glFlush")
    }

    fn alloc_pitched(&self, width_bytes: usize, height: usize) -> Result<(DevicePtr, usize)> {
        let pitch = aligned_pitch(width_bytes);
        let ptr = self.alloc_linear(pitch * height.max(1))?;
        Ok((ptr, pitch))
    }

    fn alloc_linear(&self, bytes: usize) -> Result<DevicePtr> {
        clear_gl_errors();
        let size = bytes.max(4);
        let mut buffer: GLuint = 0;
        unsafe {
            gl::CreateBuffers(1, &mut buffer);
            gl::NamedBufferStorage(
                buffer,
                size as GLsizeiptr,
                std::ptr::null(),
                gl::DYNAMIC_STORAGE_BIT,
            );
        }
        if let Err(err) = check_gl("glNamedBufferStorage") {
            unsafe { gl::DeleteBuffers(1, &buffer) };
            return Err(err);
        }
        self.state.borrow_mut().buffers.insert(buffer, size);
        Ok(DevicePtr(u64::from(buffer)))
    }

    fn memset(&self, ptr: DevicePtr, value: u8, bytes: usize) -> Result<()> {
        let size = self.state.borrow().buffer_size(ptr)?;
        if bytes > size {
            return Err(InteropError::call(
                "glClearNamedBufferSubData",
                format!("{bytes} bytes exceed a {size}-byte buffer"),
            ));
        }
        clear_gl_errors();
        unsafe {
            gl::ClearNamedBufferSubData(
                buffer_name(ptr)?,
                gl::R8UI,
                0,
                bytes as GLsizeiptr,
                gl::RED_INTEGER,
                gl::UNSIGNED_BYTE,
                &value as *const u8 as *const c_void,
            );
        }
        check_gl("glClearNamedBufferSubData")
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        let name = buffer_name(ptr)?;
        if self.state.borrow_mut().buffers.remove(&name).is_none() {
            return Err(InteropError::UnknownHandle(ptr.0));
        }
        clear_gl_errors();
        unsafe { gl::DeleteBuffers(1, &name) };
        check_gl("glDeleteBuffers")
    }

    fn read_linear(&self, ptr: DevicePtr, offset: usize, len: usize) -> Result<Vec<u8>> {
        let size = self.state.borrow().buffer_size(ptr)?;
        if offset + len > size {
            return Err(InteropError::call(
                "glGetNamedBufferSubData",
                format!("read of {len} bytes at {offset} exceeds a {size}-byte buffer"),
            ));
        }
        clear_gl_errors();
        let mut bytes = vec![0u8; len];
        unsafe {
            gl::MemoryBarrier(gl::BUFFER_UPDATE_BARRIER_BIT);
            gl::GetNamedBufferSubData(
                buffer_name(ptr)?,
                offset as isize,
                len as GLsizeiptr,
                bytes.as_mut_ptr() as *mut c_void,
            );
        }
        check_gl("glGetNamedBufferSubData")?;
        Ok(bytes)
    }

    fn write_linear(&self, ptr: DevicePtr, offset: usize, bytes: &[u8]) -> Result<()> {
        let size = self.state.borrow().buffer_size(ptr)?;
        if offset + bytes.len() > size {
            return Err(InteropError::call(
                "glNamedBufferSubData",
                format!(
                    "write of {} bytes at {offset} exceeds a {size}-byte buffer",
                    bytes.len()
                ),
            ));
        }
        clear_gl_errors();
        unsafe {
            gl::NamedBufferSubData(
                buffer_name(ptr)?,
                offset as isize,
                bytes.len() as GLsizeiptr,
                bytes.as_ptr() as *const c_void,
            );
        }
        check_gl("glNamedBufferSubData")
    }

    fn register_surface(&self, surface: SurfaceHandle) -> Result<ResourceHandle> {
        clear_gl_errors();
        let texture = texture_name(surface)
            .map_err(|err| InteropError::registration(surface, err.to_string()))?;
        let desc = self
            .query_texture(texture)
            .map_err(|err| InteropError::registration(surface, err.to_string()))?;
        let mut st = self.state.borrow_mut();
        if !st.registered_textures.insert(texture) {
            return Err(InteropError::registration(surface, "texture is already registered"));
        }
        st.next_resource += 1;
        let id = st.next_resource;
        st.registrations.insert(
            id,
            GlRegistration {
                texture,
                desc,
                flags: MapFlags::default(),
                mapped: false,
            },
        );
        Ok(ResourceHandle(id))
    }

    fn set_map_flags(&self, resource: ResourceHandle, flags: MapFlags) -> Result<()> {
        let mut st = self.state.borrow_mut();
        let reg = st.registration_mut(resource)?;
        if reg.mapped {
            return Err(InteropError::call(
                "set_map_flags",
                "flags cannot change while mapped",
            ));
        }
        reg.flags = flags;
        Ok(())
    }

    fn map(&self, resource: ResourceHandle) -> Result<()> {
        let mut st = self.state.borrow_mut();
        let reg = st.registration_mut(resource)?;
        if reg.mapped {
            return Err(InteropError::call("map", "resource is already mapped"));
        }
        clear_gl_errors();
        unsafe {
            gl::MemoryBarrier(gl::ALL_BARRIER_BITS);
            gl::Finish();
        }
        check_gl("glFinish")?;
        reg.mapped = true;
        tracing::trace!(texture = reg.texture, flags = ?reg.flags, "texture mapped");
        Ok(())
    }

    fn mapped_array(&self, resource: ResourceHandle) -> Result<ArrayHandle> {
        let st = self.state.borrow();
        let reg = st.registration(resource)?;
        if !reg.mapped {
            return Err(InteropError::NotMapped);
        }
        Ok(ArrayHandle(u64::from(reg.texture)))
    }

    fn unmap(&self, resource: ResourceHandle) -> Result<()> {
        let mut st = self.state.borrow_mut();
        let reg = st.registration_mut(resource)?;
        if !reg.mapped {
            return Err(InteropError::NotMapped);
        }
        clear_gl_errors();
        unsafe { gl::MemoryBarrier(gl::ALL_BARRIER_BITS) };
        check_gl("glMemoryBarrier")?;
        reg.mapped = false;
        Ok(())
    }

    fn unregister(&self, resource: ResourceHandle) -> Result<()> {
        let mut st = self.state.borrow_mut();
        let reg = st.registration(resource)?;
        if reg.mapped {
            return Err(InteropError::call("unregister", "resource is still mapped"));
        }
        let texture = reg.texture;
        st.registrations.remove(&resource.0);
        st.registered_textures.remove(&texture);
        Ok(())
    }

    fn copy_array_to_pitched(
        &self,
        dst: &PitchedView,
        src: ArrayHandle,
        width_bytes: usize,
        height: usize,
    ) -> Result<()> {
        let st = self.state.borrow();
        let reg = st.mapped(src)?;
        let bpp = reg.desc.format.bytes_per_pixel();
        let size = st.buffer_size(dst.ptr)?;
        let needed = dst.pitch * height;
        if width_bytes > dst.pitch || needed > size || width_bytes % bpp != 0 {
            return Err(InteropError::call(
                "glGetTextureSubImage",
                format!("{width_bytes}x{height} does not fit pitch {} of a {size}-byte buffer", dst.pitch),
            ));
        }
        let (format, ty) = transfer_format(reg.desc.format);
        clear_gl_errors();
        unsafe {
            gl::BindBuffer(gl::PIXEL_PACK_BUFFER, buffer_name(dst.ptr)?);
            gl::PixelStorei(gl::PACK_ROW_LENGTH, (dst.pitch / bpp) as GLint);
            gl::PixelStorei(gl::PACK_ALIGNMENT, 4);
            gl::GetTextureSubImage(
                reg.texture,
                0,
                0,
                0,
                0,
                (width_bytes / bpp) as GLsizei,
                height as GLsizei,
                1,
                format,
                ty,
                needed as GLsizei,
                std::ptr::null_mut(),
            );
            gl::PixelStorei(gl::PACK_ROW_LENGTH, 0);
            gl::BindBuffer(gl::PIXEL_PACK_BUFFER, 0);
            gl::Finish();
        }
        check_gl("glGetTextureSubImage")
    }

    fn copy_pitched_to_array(
        &self,
        dst: ArrayHandle,
        src: &PitchedView,
        width_bytes: usize,
        height: usize,
    ) -> Result<()> {
        let st = self.state.borrow();
        let reg = st.mapped(dst)?;
        let bpp = reg.desc.format.bytes_per_pixel();
        let size = st.buffer_size(src.ptr)?;
        if width_bytes > src.pitch || src.pitch * height > size || width_bytes % bpp != 0 {
            return Err(InteropError::call(
                "glTextureSubImage2D",
                format!("{width_bytes}x{height} does not fit pitch {} of a {size}-byte buffer", src.pitch),
            ));
        }
        let (format, ty) = transfer_format(reg.desc.format);
        clear_gl_errors();
        unsafe {
            gl::MemoryBarrier(gl::PIXEL_BUFFER_BARRIER_BIT);
            gl::BindBuffer(gl::PIXEL_UNPACK_BUFFER, buffer_name(src.ptr)?);
            gl::PixelStorei(gl::UNPACK_ROW_LENGTH, (src.pitch / bpp) as GLint);
            gl::PixelStorei(gl::UNPACK_ALIGNMENT, 4);
            gl::TextureSubImage2D(
                reg.texture,
                0,
                0,
                0,
                (width_bytes / bpp) as GLsizei,
                height as GLsizei,
                format,
                ty,
                std::ptr::null(),
            );
            gl::PixelStorei(gl::UNPACK_ROW_LENGTH, 0);
            gl::BindBuffer(gl::PIXEL_UNPACK_BUFFER, 0);
            gl::Finish();
        }
        check_gl("glTextureSubImage2D")
    }

    fn synchronize(&self) -> Result<()> {
        clear_gl_errors();
        unsafe { gl::Finish() };
        check_gl("glFinish")
    }

    fn launch(&self, launch: &KernelLaunch) -> Result<()> {
        if launch.block != WORKGROUP_SIZE {
            return Err(InteropError::Unsupported(
                "GL kernels are compiled for 16x16 workgroups",
            ));
        }
        let shader = shaders::shader_for(&launch.op);
        let program = *self
            .programs
            .get(shader.entry_point)
            .ok_or(InteropError::Unsupported("kernel was not compiled"))?;
        let bindings = shaders::storage_bindings(&launch.op)
            .into_iter()
            .map(buffer_name)
            .collect::<Result<Vec<GLuint>>>()?;
        let params = shaders::params_bytes(launch);
        let grid = launch.grid();

        clear_gl_errors();
        unsafe {
            gl::NamedBufferSubData(
                self.params_ubo,
                0,
                PARAMS_SIZE as GLsizeiptr,
                params.as_ptr() as *const c_void,
            );
            gl::UseProgram(program);
            gl::BindBufferBase(gl::UNIFORM_BUFFER, 0, self.params_ubo);
            for (slot, buffer) in bindings.iter().enumerate() {
                gl::BindBufferBase(gl::SHADER_STORAGE_BUFFER, slot as GLuint + 1, *buffer);
            }
            gl::DispatchCompute(grid.blocks_x as GLuint, grid.blocks_y as GLuint, 1);
            gl::MemoryBarrier(
                gl::SHADER_STORAGE_BARRIER_BIT
                    | gl::PIXEL_BUFFER_BARRIER_BIT
                    | gl::BUFFER_UPDATE_BARRIER_BIT,
            );
            for slot in 0..bindings.len() {
                gl::BindBufferBase(gl::SHADER_STORAGE_BUFFER, slot as GLuint + 1, 0);
            }
            gl::BindBufferBase(gl::UNIFORM_BUFFER, 0, 0);
            gl::UseProgram(0);
        }
        check_gl("glDispatchCompute")?;
        tracing::trace!(
            kernel = shader.entry_point,
            groups_x = grid.blocks_x,
            groups_y = grid.blocks_y,
            "dispatched"
        );
        Ok(())
    }
}
