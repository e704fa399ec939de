//! [`HostDevice`]: an [`InteropDevice`] backed by host memory.
//!
//! Surfaces, arrays and allocations are plain byte vectors and kernels run
//! through [`kernels::cpu`](crate::kernels::cpu). The device keeps the same
//! bookkeeping a GPU driver would (live allocations, registrations,
//! mappings) and exposes it so callers can check nothing leaks. Individual
//! calls can be made to fail on demand.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

use nnao_core::{SurfaceDesc, SurfaceHandle};

use crate::device::{ArrayHandle, DevicePtr, InteropDevice, MapFlags, ResourceHandle};
use crate::error::{InteropError, Result};
use crate::kernels::{cpu, KernelLaunch, KernelOp};
use crate::pitched::{aligned_pitch, PitchedView};

/// Call counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStats {
    pub allocs: usize,
    pub frees: usize,
    pub registers: usize,
    pub unregisters: usize,
    pub maps: usize,
    pub unmaps: usize,
    pub syncs: usize,
    pub launches: usize,
    pub surface_copies: usize,
    pub textures_created: usize,
    pub textures_released: usize,
}

#[derive(Debug)]
struct SurfaceSlot {
    desc: SurfaceDesc,
    data: Vec<u8>,
    /// Created through `create_texture`, as opposed to handed in by the host.
    owned: bool,
    bound_elsewhere: bool,
    registration: Option<u64>,
}

#[derive(Debug)]
struct Registration {
    surface: SurfaceHandle,
    flags: MapFlags,
    mapped: bool,
}

#[derive(Debug)]
struct Fault {
    call: String,
    remaining: usize,
}

#[derive(Debug, Default)]
struct HostState {
    next_id: u64,
    surfaces: BTreeMap<u64, SurfaceSlot>,
    allocations: BTreeMap<u64, Vec<u8>>,
    registrations: BTreeMap<u64, Registration>,
    pitched_allocs: usize,
    pitch_overrides: HashMap<usize, usize>,
    faults: Vec<Fault>,
    stats: DeviceStats,
}

impl HostState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    #[track_caller]
    fn check_fault(&mut self, call: &'static str) -> Result<()> {
        let Some(index) = self.faults.iter().position(|f| f.call == call) else {
            return Ok(());
        };
        if self.faults[index].remaining == 0 {
            self.faults.remove(index);
            return Err(InteropError::call(call, "injected failure"));
        }
        self.faults[index].remaining -= 1;
        Ok(())
    }

    fn surface(&self, surface: SurfaceHandle) -> Result<&SurfaceSlot> {
        self.surfaces
            .get(&surface.0)
            .ok_or(InteropError::UnknownHandle(surface.0))
    }

    fn surface_mut(&mut self, surface: SurfaceHandle) -> Result<&mut SurfaceSlot> {
        self.surfaces
            .get_mut(&surface.0)
            .ok_or(InteropError::UnknownHandle(surface.0))
    }

    fn allocation(&self, ptr: DevicePtr) -> Result<&Vec<u8>> {
        self.allocations
            .get(&ptr.0)
            .ok_or(InteropError::UnknownHandle(ptr.0))
    }

    fn registration_mut(&mut self, resource: ResourceHandle) -> Result<&mut Registration> {
        self.registrations
            .get_mut(&resource.0)
            .ok_or(InteropError::UnknownHandle(resource.0))
    }

    /// The surface behind a mapped array.
    fn mapped_surface(&self, array: ArrayHandle) -> Result<SurfaceHandle> {
        let surface = SurfaceHandle(array.0);
        let slot = self.surface(surface)?;
        match slot.registration.and_then(|id| self.registrations.get(&id)) {
            Some(reg) if reg.mapped => Ok(surface),
            _ => Err(InteropError::NotMapped),
        }
    }
}

#[track_caller]
fn check_span(call: &'static str, what: &str, len: usize, need: usize) -> Result<()> {
    if need > len {
        return Err(InteropError::call(
            call,
            format!("{what} of {len} bytes, access needs {need}"),
        ));
    }
    Ok(())
}

fn pitched_span(pitch: usize, width_bytes: usize, height: usize) -> usize {
    if height == 0 {
        0
    } else {
        (height - 1) * pitch + width_bytes
    }
}

/// Software interop device.
#[derive(Debug, Default)]
pub struct HostDevice {
    state: RefCell<HostState>,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand the device a host-owned surface. `data` is resized to the
    /// surface's dense size.
    pub fn create_surface(&self, desc: SurfaceDesc, mut data: Vec<u8>) -> SurfaceHandle {
        data.resize(desc.byte_len(), 0);
        let mut st = self.state.borrow_mut();
        let id = st.next_id();
        st.surfaces.insert(
            id,
            SurfaceSlot {
                desc,
                data,
                owned: false,
                bound_elsewhere: false,
                registration: None,
            },
        );
        SurfaceHandle(id)
    }

    pub fn write_surface(&self, surface: SurfaceHandle, data: &[u8]) -> Result<()> {
        let mut st = self.state.borrow_mut();
        let slot = st.surface_mut(surface)?;
        check_span("write_surface", "surface", slot.data.len(), data.len())?;
        slot.data[..data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read_surface(&self, surface: SurfaceHandle) -> Result<Vec<u8>> {
        Ok(self.state.borrow().surface(surface)?.data.clone())
    }

    /// Mark a surface as bound by another consumer; registering it fails.
    pub fn set_bound_elsewhere(&self, surface: SurfaceHandle, bound: bool) {
        if let Some(slot) = self.state.borrow_mut().surfaces.get_mut(&surface.0) {
            slot.bound_elsewhere = bound;
        }
    }

    /// Make the `nth` (0-based) upcoming invocation of `call` fail.
    ///
    /// Names match [`InteropDevice`] method names.
    pub fn fail_call(&self, call: &str, nth: usize) {
        self.state.borrow_mut().faults.push(Fault {
            call: call.to_string(),
            remaining: nth,
        });
    }

    /// Force the pitch returned by the `index`-th (0-based) pitched
    /// allocation made on this device.
    pub fn override_pitch(&self, index: usize, pitch: usize) {
        self.state.borrow_mut().pitch_overrides.insert(index, pitch);
    }

    pub fn live_allocations(&self) -> usize {
        self.state.borrow().allocations.len()
    }

    pub fn live_registrations(&self) -> usize {
        self.state.borrow().registrations.len()
    }

    pub fn mapped_resources(&self) -> usize {
        self.state
            .borrow()
            .registrations
            .values()
            .filter(|r| r.mapped)
            .count()
    }

    /// Device-created textures still alive.
    pub fn live_textures(&self) -> usize {
        self.state
            .borrow()
            .surfaces
            .values()
            .filter(|s| s.owned)
            .count()
    }

    pub fn stats(&self) -> DeviceStats {
        self.state.borrow().stats
    }
}

impl InteropDevice for HostDevice {
    fn name(&self) -> &str {
        "host"
    }

    fn surface_desc(&self, surface: SurfaceHandle) -> Result<SurfaceDesc> {
        Ok(self.state.borrow().surface(surface)?.desc)
    }

    fn create_texture(&self, desc: &SurfaceDesc) -> Result<SurfaceHandle> {
        let mut st = self.state.borrow_mut();
        st.check_fault("create_texture")?;
        let id = st.next_id();
        st.surfaces.insert(
            id,
            SurfaceSlot {
                desc: *desc,
                data: vec![0; desc.byte_len()],
                owned: true,
                bound_elsewhere: false,
                registration: None,
            },
        );
        st.stats.textures_created += 1;
        Ok(SurfaceHandle(id))
    }

    fn release_texture(&self, texture: SurfaceHandle) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.check_fault("release_texture")?;
        let slot = st.surface(texture)?;
        if !slot.owned {
            return Err(InteropError::call(
                "release_texture",
                format!("{texture} is owned by the host"),
            ));
        }
        if slot.registration.is_some() {
            return Err(InteropError::call(
                "release_texture",
                format!("{texture} is still registered for interop"),
            ));
        }
        st.surfaces.remove(&texture.0);
        st.stats.textures_released += 1;
        Ok(())
    }

    fn copy_surface(&self, dst: SurfaceHandle, src: SurfaceHandle) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.check_fault("copy_surface")?;
        let source = st.surface(src)?;
        let src_desc = source.desc;
        let data = source.data.clone();
        let target = st.surface_mut(dst)?;
        let dst_desc = target.desc;
        if (src_desc.width, src_desc.height) != (dst_desc.width, dst_desc.height)
            || src_desc.format.bytes_per_pixel() != dst_desc.format.bytes_per_pixel()
        {
            return Err(InteropError::call(
                "copy_surface",
                format!("{src} ({src_desc:?}) is not copy-compatible with {dst} ({dst_desc:?})"),
            ));
        }
        target.data = data;
        st.stats.surface_copies += 1;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.state.borrow_mut().check_fault("flush")
    }

    fn alloc_pitched(&self, width_bytes: usize, height: usize) -> Result<(DevicePtr, usize)> {
        let mut st = self.state.borrow_mut();
        st.check_fault("alloc_pitched")?;
        let index = st.pitched_allocs;
        st.pitched_allocs += 1;
        let pitch = st
            .pitch_overrides
            .get(&index)
            .copied()
            .unwrap_or_else(|| aligned_pitch(width_bytes));
        if pitch < width_bytes {
            return Err(InteropError::call(
                "alloc_pitched",
                format!("pitch {pitch} is narrower than a {width_bytes}-byte row"),
            ));
        }
        let id = st.next_id();
        st.allocations.insert(id, vec![0; pitch * height]);
        st.stats.allocs += 1;
        Ok((DevicePtr(id), pitch))
    }

    fn alloc_linear(&self, bytes: usize) -> Result<DevicePtr> {
        let mut st = self.state.borrow_mut();
        st.check_fault("alloc_linear")?;
        let id = st.next_id();
        st.allocations.insert(id, vec![0; bytes]);
        st.stats.allocs += 1;
        Ok(DevicePtr(id))
    }

    fn memset(&self, ptr: DevicePtr, value: u8, bytes: usize) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.check_fault("memset")?;
        let allocation = st
            .allocations
            .get_mut(&ptr.0)
            .ok_or(InteropError::UnknownHandle(ptr.0))?;
        check_span("memset", "allocation", allocation.len(), bytes)?;
        allocation[..bytes].fill(value);
        Ok(())
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.check_fault("free")?;
        st.allocations
            .remove(&ptr.0)
            .ok_or(InteropError::UnknownHandle(ptr.0))?;
        st.stats.frees += 1;
        Ok(())
    }

    fn read_linear(&self, ptr: DevicePtr, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut st = self.state.borrow_mut();
        st.check_fault("read_linear")?;
        let allocation = st.allocation(ptr)?;
        check_span("read_linear", "allocation", allocation.len(), offset + len)?;
        Ok(allocation[offset..offset + len].to_vec())
    }

    fn write_linear(&self, ptr: DevicePtr, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.check_fault("write_linear")?;
        let allocation = st
            .allocations
            .get_mut(&ptr.0)
            .ok_or(InteropError::UnknownHandle(ptr.0))?;
        check_span("write_linear", "allocation", allocation.len(), offset + bytes.len())?;
        allocation[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn register_surface(&self, surface: SurfaceHandle) -> Result<ResourceHandle> {
        let mut st = self.state.borrow_mut();
        st.check_fault("register_surface")
            .map_err(|err| InteropError::registration(surface, err.to_string()))?;
        let slot = st
            .surface(surface)
            .map_err(|err| InteropError::registration(surface, err.to_string()))?;
        if slot.bound_elsewhere {
            return Err(InteropError::registration(
                surface,
                "surface is currently bound elsewhere",
            ));
        }
        if slot.registration.is_some() {
            return Err(InteropError::registration(surface, "surface is already registered"));
        }
        let id = st.next_id();
        st.registrations.insert(
            id,
            Registration {
                surface,
                flags: MapFlags::default(),
                mapped: false,
            },
        );
        st.surface_mut(surface)?.registration = Some(id);
        st.stats.registers += 1;
        Ok(ResourceHandle(id))
    }

    fn set_map_flags(&self, resource: ResourceHandle, flags: MapFlags) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.check_fault("set_map_flags")?;
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
        st.check_fault("map")?;
        let reg = st.registration_mut(resource)?;
        if reg.mapped {
            return Err(InteropError::call("map", "resource is already mapped"));
        }
        reg.mapped = true;
        tracing::trace!(?resource, flags = ?reg.flags, "resource mapped");
        // Mapping orders all submitted work before it.
        st.stats.maps += 1;
        st.stats.syncs += 1;
        Ok(())
    }

    fn mapped_array(&self, resource: ResourceHandle) -> Result<ArrayHandle> {
        let mut st = self.state.borrow_mut();
        st.check_fault("mapped_array")?;
        let reg = st.registration_mut(resource)?;
        if !reg.mapped {
            return Err(InteropError::NotMapped);
        }
        Ok(ArrayHandle(reg.surface.0))
    }

    fn unmap(&self, resource: ResourceHandle) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.check_fault("unmap")?;
        let reg = st.registration_mut(resource)?;
        if !reg.mapped {
            return Err(InteropError::NotMapped);
        }
        reg.mapped = false;
        st.stats.unmaps += 1;
        Ok(())
    }

    fn unregister(&self, resource: ResourceHandle) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.check_fault("unregister")?;
        let reg = st
            .registrations
            .get(&resource.0)
            .ok_or(InteropError::UnknownHandle(resource.0))?;
        if reg.mapped {
            return Err(InteropError::call("unregister", "resource is still mapped"));
        }
        let surface = reg.surface;
        st.registrations.remove(&resource.0);
        if let Some(slot) = st.surfaces.get_mut(&surface.0) {
            slot.registration = None;
        }
        st.stats.unregisters += 1;
        Ok(())
    }

    fn copy_array_to_pitched(
        &self,
        dst: &PitchedView,
        src: ArrayHandle,
        width_bytes: usize,
        height: usize,
    ) -> Result<()> {
        const CALL: &str = "copy_array_to_pitched";
        let mut st = self.state.borrow_mut();
        st.check_fault(CALL)?;
        let surface = st.mapped_surface(src)?;
        let slot = st.surface(surface)?;
        let row_bytes = slot.desc.row_bytes();
        check_span(CALL, "array row", row_bytes, width_bytes)?;
        check_span(CALL, "array", slot.data.len(), row_bytes * height)?;
        check_span(CALL, "pitch", dst.pitch, width_bytes)?;
        let packed: Vec<u8> = slot
            .data
            .chunks(row_bytes.max(1))
            .take(height)
            .flat_map(|row| row[..width_bytes].iter().copied())
            .collect();

        let target = st
            .allocations
            .get_mut(&dst.ptr.0)
            .ok_or(InteropError::UnknownHandle(dst.ptr.0))?;
        check_span(CALL, "buffer", target.len(), pitched_span(dst.pitch, width_bytes, height))?;
        for (y, row) in packed.chunks(width_bytes.max(1)).enumerate() {
            target[y * dst.pitch..y * dst.pitch + row.len()].copy_from_slice(row);
        }
        Ok(())
    }

    fn copy_pitched_to_array(
        &self,
        dst: ArrayHandle,
        src: &PitchedView,
        width_bytes: usize,
        height: usize,
    ) -> Result<()> {
        const CALL: &str = "copy_pitched_to_array";
        let mut st = self.state.borrow_mut();
        st.check_fault(CALL)?;
        let surface = st.mapped_surface(dst)?;
        check_span(CALL, "pitch", src.pitch, width_bytes)?;
        let source = st.allocation(src.ptr)?;
        check_span(CALL, "buffer", source.len(), pitched_span(src.pitch, width_bytes, height))?;
        let rows: Vec<Vec<u8>> = (0..height)
            .map(|y| source[y * src.pitch..y * src.pitch + width_bytes].to_vec())
            .collect();

        let slot = st.surface_mut(surface)?;
        let row_bytes = slot.desc.row_bytes();
        check_span(CALL, "array row", row_bytes, width_bytes)?;
        check_span(CALL, "array", slot.data.len(), row_bytes * height)?;
        for (y, row) in rows.iter().enumerate() {
            slot.data[y * row_bytes..y * row_bytes + width_bytes].copy_from_slice(row);
        }
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.check_fault("synchronize")?;
        st.stats.syncs += 1;
        Ok(())
    }

    fn launch(&self, launch: &KernelLaunch) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.check_fault("launch")?;

        let (dst, sources): (DevicePtr, Vec<DevicePtr>) = match launch.op {
            KernelOp::PackNormalsDepth {
                normals, depth, out, ..
            } => (out, vec![normals.ptr, depth.ptr]),
            KernelOp::NormalsToTensor { normals, out } => (out, vec![normals.ptr]),
            KernelOp::DepthToTensor { depth, out, .. } => (out, vec![depth.ptr]),
            KernelOp::TensorToScalar { tensor, out } | KernelOp::TensorToDepth { tensor, out, .. } => {
                (out.ptr, vec![tensor])
            }
        };
        if sources.contains(&dst) {
            return Err(InteropError::call(
                "launch",
                format!("{} writes to one of its inputs", launch.op.name()),
            ));
        }

        let mut out = st
            .allocations
            .remove(&dst.0)
            .ok_or(InteropError::UnknownHandle(dst.0))?;
        let result = run_kernel(&st, launch, &sources, &mut out);
        st.allocations.insert(dst.0, out);
        st.stats.launches += 1;
        tracing::trace!(kernel = launch.op.name(), dims = ?launch.dims, ok = result.is_ok(), "kernel launched");
        result
    }
}

fn run_kernel(
    st: &HostState,
    launch: &KernelLaunch,
    sources: &[DevicePtr],
    out: &mut [u8],
) -> Result<()> {
    let grid = launch.grid();
    let dims = launch.dims;
    let pitch = launch.op.pitch();
    let inputs = sources
        .iter()
        .map(|ptr| st.allocation(*ptr).map(Vec::as_slice))
        .collect::<Result<Vec<&[u8]>>>()?;
    match launch.op {
        KernelOp::PackNormalsDepth { range, .. } => {
            cpu::pack_normals_depth(grid, dims, pitch, range, inputs[0], inputs[1], out)
        }
        KernelOp::NormalsToTensor { .. } => cpu::normals_to_tensor(grid, dims, pitch, inputs[0], out),
        KernelOp::DepthToTensor { range, .. } => {
            cpu::depth_to_tensor(grid, dims, pitch, range, inputs[0], out)
        }
        KernelOp::TensorToScalar { .. } => cpu::tensor_to_scalar(grid, dims, pitch, inputs[0], out),
        KernelOp::TensorToDepth { range, .. } => {
            cpu::tensor_to_depth(grid, dims, pitch, range, inputs[0], out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nnao_core::SurfaceFormat;

    #[test]
    fn pitched_copies_respect_row_padding() {
        let device = HostDevice::new();
        let desc = SurfaceDesc::new(2, 2, SurfaceFormat::Rgba8Uint);
        let pixels: Vec<u8> = (1..=16).collect();
        let surface = device.create_surface(desc, pixels.clone());
        let resource = device.register_surface(surface).unwrap();
        device.map(resource).unwrap();
        let array = device.mapped_array(resource).unwrap();

        let (ptr, pitch) = device.alloc_pitched(8, 2).unwrap();
        let view = PitchedView {
            ptr,
            pitch,
            width: 2,
            height: 2,
            bytes_per_pixel: 4,
        };
        device.copy_array_to_pitched(&view, array, 8, 2).unwrap();
        let bytes = device.read_linear(ptr, 0, pitch * 2).unwrap();
        assert_eq!(&bytes[..8], &pixels[..8]);
        assert_eq!(&bytes[pitch..pitch + 8], &pixels[8..]);
        assert!(bytes[8..pitch].iter().all(|&b| b == 0));

        device.write_surface(surface, &[0; 16]).unwrap();
        device.copy_pitched_to_array(array, &view, 8, 2).unwrap();
        assert_eq!(device.read_surface(surface).unwrap(), pixels);
    }

    #[test]
    fn transfers_need_a_mapped_array() {
        let device = HostDevice::new();
        let surface = device.create_surface(SurfaceDesc::new(1, 1, SurfaceFormat::R32Float), vec![]);
        let resource = device.register_surface(surface).unwrap();
        let (ptr, pitch) = device.alloc_pitched(4, 1).unwrap();
        let view = PitchedView {
            ptr,
            pitch,
            width: 1,
            height: 1,
            bytes_per_pixel: 4,
        };
        let err = device
            .copy_array_to_pitched(&view, ArrayHandle(surface.0), 4, 1)
            .unwrap_err();
        assert!(matches!(err, InteropError::NotMapped));
        assert!(matches!(
            device.mapped_array(resource),
            Err(InteropError::NotMapped)
        ));
    }

    #[test]
    fn injected_fault_fires_once_on_the_nth_call() {
        let device = HostDevice::new();
        device.fail_call("synchronize", 1);
        assert!(device.synchronize().is_ok());
        let err = device.synchronize().unwrap_err();
        assert!(err.to_string().starts_with("synchronize failed at "));
        assert!(device.synchronize().is_ok());
    }

    #[test]
    fn host_surfaces_are_never_released() {
        let device = HostDevice::new();
        let host = device.create_surface(SurfaceDesc::new(1, 1, SurfaceFormat::Rgba8Unorm), vec![]);
        assert!(device.release_texture(host).is_err());

        let owned = device
            .create_texture(&SurfaceDesc::new(1, 1, SurfaceFormat::Rgba8Uint))
            .unwrap();
        assert_eq!(device.live_textures(), 1);
        device.release_texture(owned).unwrap();
        assert_eq!(device.live_textures(), 0);
    }

    #[test]
    fn launch_rejects_aliased_buffers() {
        let device = HostDevice::new();
        let (ptr, pitch) = device.alloc_pitched(16, 1).unwrap();
        let view = PitchedView {
            ptr,
            pitch,
            width: 4,
            height: 1,
            bytes_per_pixel: 4,
        };
        let launch = KernelLaunch::new(
            KernelOp::NormalsToTensor {
                normals: view,
                out: ptr,
            },
            crate::kernels::ImageDims::new(4, 1),
            crate::kernels::BlockSize::default(),
        );
        assert!(device.launch(&launch).is_err());
        assert_eq!(device.live_allocations(), 1);
    }
}
