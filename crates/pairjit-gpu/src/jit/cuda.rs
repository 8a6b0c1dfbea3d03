//! NVRTC backend.
//!
//! User source is CUDA C++ compiled once per launch bound with
//! `-DPAIRJIT_LAUNCH_BOUND=N`, optionally linked against auxiliary PTX /
//! cubin / fatbin / archive libraries, and loaded through the driver API.
//! A generated prelude defines the argument block every kernel receives:
//!
//! ```cuda
//! PAIRJIT_KERNEL(lj)          // extern "C" __global__ __launch_bounds__(..)
//! {                           //   void lj(const pairjit_args* args)
//!     ...
//! }
//! ```
//!
//! External parameters are `__device__` pointer globals; binding writes the
//! device address into the global of every loaded module. Kernels report
//! faults by storing a nonzero code in `pairjit_fault`.

use super::{
    AuxLibrary, CompileOptions, DeviceProperties, KernelFactory, LaunchStats, ModuleInfo,
    PairKernelArgs, ParamAddress, ParamArray,
};
use crate::autotuner::KernelTimer;
use crate::shapes::NarrowPhaseCounts;
use anyhow::{anyhow, bail, Context};
use cudarc::driver::sys;
use cudarc::driver::{CudaContext, CudaStream};
use pairjit_core::{ForceBuffers, LaunchParams, PairJitError, Result, Scalar4, VIRIAL_COMPONENTS};
use std::collections::{BTreeMap, HashMap};
use std::ffi::{c_void, CString};
use std::path::Path;
use std::sync::Arc;

const FAULT_SYMBOL: &str = "pairjit_fault";
const LINK_LOG_BYTES: usize = 16 * 1024;

const PRELUDE: &str = r#"
struct pairjit_node {
    float lower[3];
    float upper[3];
    unsigned int skip, right, leaf_start, leaf_count;
};

struct pairjit_args {
    unsigned int n;
    const unsigned int* n_neigh;
    const unsigned int* nlist;
    const unsigned long long* head_list;
    const float* positions;
    const float* velocities;
    const unsigned int* tags;
    const unsigned int* types;
    const float* orientations;
    float box[3];
    unsigned int periodic[3];
    const float* rcutsq;
    unsigned int n_types;
    float4* force;
    float* virial;
    unsigned int pressure_tensor;
    unsigned long long seed;
    unsigned long long timestep;
    unsigned int block_size;
    unsigned int lanes;
    unsigned int eval_threads;
    unsigned int n_shape_types;
    const unsigned int* shape_node_offset;
    const unsigned int* shape_item_offset;
    const pairjit_node* nodes;
    const unsigned int* order;
    const float* c_positions;
    const float* c_orientations;
    const float* c_diameters;
    const float* c_charges;
    const unsigned int* c_typeids;
    float r_cut_constituent;
    unsigned long long* stats;
};

__device__ unsigned int pairjit_fault;

#define PAIRJIT_KERNEL(name) \
    extern "C" __global__ void __launch_bounds__(PAIRJIT_LAUNCH_BOUND) \
    name(const pairjit_args* args)
"#;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawArgs {
    n: u32,
    n_neigh: u64,
    nlist: u64,
    head_list: u64,
    positions: u64,
    velocities: u64,
    tags: u64,
    types: u64,
    orientations: u64,
    box_lengths: [f32; 3],
    periodic: [u32; 3],
    rcutsq: u64,
    n_types: u32,
    force: u64,
    virial: u64,
    pressure_tensor: u32,
    seed: u64,
    timestep: u64,
    block_size: u32,
    lanes: u32,
    eval_threads: u32,
    n_shape_types: u32,
    shape_node_offset: u64,
    shape_item_offset: u64,
    nodes: u64,
    order: u64,
    c_positions: u64,
    c_orientations: u64,
    c_diameters: u64,
    c_charges: u64,
    c_typeids: u64,
    r_cut_constituent: f32,
    stats: u64,
}

fn check(res: sys::CUresult, what: &str) -> anyhow::Result<()> {
    if res == sys::CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(anyhow!("{} failed: {:?}", what, res))
    }
}

fn backend(e: anyhow::Error) -> PairJitError {
    PairJitError::backend(format!("{:#}", e))
}

fn arch_name(target_arch: u32) -> anyhow::Result<&'static str> {
    Ok(match target_arch {
        60 => "sm_60",
        61 => "sm_61",
        70 => "sm_70",
        75 => "sm_75",
        80 => "sm_80",
        86 => "sm_86",
        87 => "sm_87",
        89 => "sm_89",
        90 => "sm_90",
        other => bail!("unsupported target architecture {}", other),
    })
}

/// Growable device allocation reused across launches.
#[derive(Debug, Default)]
struct DeviceVec {
    ptr: sys::CUdeviceptr,
    bytes: usize,
}

impl DeviceVec {
    fn reserve(&mut self, bytes: usize) -> anyhow::Result<()> {
        if bytes <= self.bytes && self.ptr != 0 {
            return Ok(());
        }
        self.release();
        let bytes = bytes.max(16);
        let mut ptr: sys::CUdeviceptr = 0;
        unsafe { check(sys::cuMemAlloc_v2(&mut ptr, bytes), "cuMemAlloc")? };
        self.ptr = ptr;
        self.bytes = bytes;
        Ok(())
    }

    fn upload<T: Copy>(&mut self, data: &[T], stream: sys::CUstream) -> anyhow::Result<u64> {
        let bytes = std::mem::size_of_val(data);
        self.reserve(bytes)?;
        if bytes > 0 {
            unsafe {
                check(
                    sys::cuMemcpyHtoDAsync_v2(self.ptr, data.as_ptr() as *const c_void, bytes, stream),
                    "cuMemcpyHtoDAsync",
                )?
            };
        }
        Ok(self.ptr)
    }

    fn zeroed(&mut self, bytes: usize, stream: sys::CUstream) -> anyhow::Result<u64> {
        self.reserve(bytes)?;
        unsafe { check(sys::cuMemsetD8Async(self.ptr, 0, bytes, stream), "cuMemsetD8Async")? };
        Ok(self.ptr)
    }

    fn download<T: Copy>(&self, out: &mut [T], stream: sys::CUstream) -> anyhow::Result<()> {
        let bytes = std::mem::size_of_val(out);
        if bytes == 0 {
            return Ok(());
        }
        unsafe {
            check(
                sys::cuMemcpyDtoHAsync_v2(out.as_mut_ptr() as *mut c_void, self.ptr, bytes, stream),
                "cuMemcpyDtoHAsync",
            )
        }
    }

    fn release(&mut self) {
        if self.ptr != 0 {
            unsafe {
                sys::cuMemFree_v2(self.ptr);
            }
            self.ptr = 0;
            self.bytes = 0;
        }
    }
}

impl Drop for DeviceVec {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Default)]
struct Buffers {
    n_neigh: DeviceVec,
    nlist: DeviceVec,
    head_list: DeviceVec,
    positions: DeviceVec,
    velocities: DeviceVec,
    tags: DeviceVec,
    types: DeviceVec,
    orientations: DeviceVec,
    rcutsq: DeviceVec,
    force: DeviceVec,
    virial: DeviceVec,
    shape_node_offset: DeviceVec,
    shape_item_offset: DeviceVec,
    nodes: DeviceVec,
    order: DeviceVec,
    c_positions: DeviceVec,
    c_orientations: DeviceVec,
    c_diameters: DeviceVec,
    c_charges: DeviceVec,
    c_typeids: DeviceVec,
    stats: DeviceVec,
    args: DeviceVec,
}

struct LoadedModule {
    module: sys::CUmodule,
    function: sys::CUfunction,
}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        unsafe {
            sys::cuModuleUnload(self.module);
        }
    }
}

struct InFlight {
    n: usize,
}

/// Inputs uploaded ahead of a launch.
struct Staged {
    params: LaunchParams,
    n: usize,
    args_ptr: u64,
}

/// Kernel factory backed by NVRTC and the CUDA driver.
pub struct CudaKernelFactory {
    context: Arc<CudaContext>,
    info: ModuleInfo,
    modules: BTreeMap<u32, LoadedModule>,
    launch_bounds: Vec<u32>,
    host_params: HashMap<String, (ParamArray, DeviceVec)>,
    buffers: Buffers,
    staged: Option<Staged>,
    in_flight: Option<InFlight>,
    device: DeviceProperties,
}

// Raw module handles are only used from the owning dispatcher's thread.
unsafe impl Send for CudaKernelFactory {}

impl CudaKernelFactory {
    /// Compile `source` for every launch bound in `options` on device `ordinal`.
    pub fn new(
        ordinal: usize,
        source: &str,
        entry: &str,
        options: &[String],
        libraries: &[AuxLibrary],
        target_arch: u32,
    ) -> Result<Self> {
        let context = CudaContext::new(ordinal)
            .map_err(|e| PairJitError::backend(format!("CUDA context {}: {:?}", ordinal, e)))?;
        context
            .bind_to_thread()
            .map_err(|e| PairJitError::backend(format!("bind context: {:?}", e)))?;
        let opts = CompileOptions::parse(options)?;
        let arch = arch_name(target_arch).map_err(|e| PairJitError::config(e.to_string()))?;
        let full_source = format!("{}\n#line 1 \"<source>\"\n{}", PRELUDE, source);

        let mut libs = Vec::with_capacity(libraries.len());
        for lib in libraries {
            libs.push(load_library(lib, &opts, arch)?);
        }

        let mut modules = BTreeMap::new();
        let mut log = String::new();
        for &lb in &opts.launch_bounds {
            let ptx = compile(&full_source, entry, &opts, arch, lb, !libs.is_empty())?;
            let (module, link_log) = if libs.is_empty() {
                (load_ptx(&ptx).map_err(backend)?, String::new())
            } else {
                link(entry, &ptx, &libs)?
            };
            log.push_str(&link_log);

            let c_entry = CString::new(entry).map_err(|_| PairJitError::symbol(entry))?;
            let mut function: sys::CUfunction = std::ptr::null_mut();
            let res = unsafe { sys::cuModuleGetFunction(&mut function, module, c_entry.as_ptr()) };
            if res != sys::CUresult::CUDA_SUCCESS {
                unsafe {
                    sys::cuModuleUnload(module);
                }
                return Err(PairJitError::symbol(entry));
            }
            modules.insert(lb, LoadedModule { module, function });
        }
        log::info!(
            "Compiled '{}' for {} with launch bounds {:?}",
            entry,
            arch,
            opts.launch_bounds
        );

        let device = device_properties(ordinal).map_err(backend)?;
        Ok(Self {
            context,
            info: ModuleInfo {
                entry: entry.to_string(),
                union_entry: opts.union_kernel.clone(),
                externs: Vec::new(),
                log,
            },
            modules,
            launch_bounds: opts.launch_bounds,
            host_params: HashMap::new(),
            buffers: Buffers::default(),
            staged: None,
            in_flight: None,
            device,
        })
    }

    pub fn context(&self) -> &Arc<CudaContext> {
        &self.context
    }

    fn write_global(&self, symbol: &str, value: u64) -> anyhow::Result<bool> {
        let c_name = CString::new(symbol)?;
        let mut found = false;
        for m in self.modules.values() {
            let mut dptr: sys::CUdeviceptr = 0;
            let mut bytes: usize = 0;
            let res =
                unsafe { sys::cuModuleGetGlobal_v2(&mut dptr, &mut bytes, m.module, c_name.as_ptr()) };
            if res != sys::CUresult::CUDA_SUCCESS {
                continue;
            }
            if bytes != std::mem::size_of::<u64>() {
                bail!("global '{}' is {} bytes, expected a pointer", symbol, bytes);
            }
            unsafe {
                check(
                    sys::cuMemcpyHtoD_v2(dptr, &value as *const u64 as *const c_void, bytes),
                    "cuMemcpyHtoD",
                )?
            };
            found = true;
        }
        Ok(found)
    }

    fn read_fault(&self) -> anyhow::Result<u32> {
        let c_name = CString::new(FAULT_SYMBOL)?;
        let mut fault = 0u32;
        for m in self.modules.values() {
            let mut dptr: sys::CUdeviceptr = 0;
            let mut bytes: usize = 0;
            unsafe {
                check(
                    sys::cuModuleGetGlobal_v2(&mut dptr, &mut bytes, m.module, c_name.as_ptr()),
                    "cuModuleGetGlobal",
                )?;
                let mut value = 0u32;
                check(
                    sys::cuMemcpyDtoH_v2(&mut value as *mut u32 as *mut c_void, dptr, 4),
                    "cuMemcpyDtoH",
                )?;
                if value != 0 {
                    fault = value;
                    let zero = 0u32;
                    check(
                        sys::cuMemcpyHtoD_v2(dptr, &zero as *const u32 as *const c_void, 4),
                        "cuMemcpyHtoD",
                    )?;
                }
            }
        }
        Ok(fault)
    }

    fn module_for(&self, params: &LaunchParams) -> Result<&LoadedModule> {
        let wanted = match params {
            LaunchParams::NarrowPhase(np) => {
                return self.modules.get(&np.launch_bound).ok_or_else(|| {
                    PairJitError::usage(format!(
                        "module was not compiled for launch bound {} (have {:?})",
                        np.launch_bound, self.launch_bounds
                    ))
                })
            }
            LaunchParams::Pair(p) => p.block_size,
        };
        self.modules
            .range(wanted..)
            .next()
            .map(|(_, m)| m)
            .ok_or_else(|| {
                PairJitError::usage(format!(
                    "no compiled launch bound admits block size {} (have {:?})",
                    wanted, self.launch_bounds
                ))
            })
    }

    /// Upload every input of one launch and return the staged argument block.
    fn upload_inputs(
        &mut self,
        params: &LaunchParams,
        args: &PairKernelArgs<'_>,
        stream: sys::CUstream,
    ) -> anyhow::Result<Staged> {
        for (symbol, (array, dev)) in self.host_params.iter_mut() {
            let values = array.read();
            let ptr = dev.upload(values.as_slice(), stream)?;
            drop(values);
            let c_name = CString::new(symbol.as_str())?;
            for m in self.modules.values() {
                let mut dptr: sys::CUdeviceptr = 0;
                let mut bytes: usize = 0;
                unsafe {
                    if sys::cuModuleGetGlobal_v2(&mut dptr, &mut bytes, m.module, c_name.as_ptr())
                        == sys::CUresult::CUDA_SUCCESS
                    {
                        check(
                            sys::cuMemcpyHtoDAsync_v2(
                                dptr,
                                &ptr as *const u64 as *const c_void,
                                bytes,
                                stream,
                            ),
                            "cuMemcpyHtoDAsync",
                        )?;
                    }
                }
            }
        }

        let n = args.n();
        let b = &mut self.buffers;
        let head_list: Vec<u64> = args.head_list.iter().map(|&h| h as u64).collect();
        let orientations: Option<Vec<[f32; 4]>> = args
            .orientations
            .map(|o| o.iter().map(|q| [q.w, q.i, q.j, q.k]).collect());

        let mut raw = RawArgs {
            n: n as u32,
            n_neigh: b.n_neigh.upload(args.n_neigh, stream)?,
            nlist: b.nlist.upload(args.nlist, stream)?,
            head_list: b.head_list.upload(&head_list, stream)?,
            positions: b.positions.upload(args.positions, stream)?,
            velocities: b.velocities.upload(args.velocities, stream)?,
            tags: b.tags.upload(args.tags, stream)?,
            types: b.types.upload(args.types, stream)?,
            orientations: match &orientations {
                Some(o) => b.orientations.upload(o, stream)?,
                None => 0,
            },
            box_lengths: args.sim_box.lengths,
            periodic: args.sim_box.periodic.map(u32::from),
            rcutsq: b.rcutsq.upload(args.cutoffs.as_slice(), stream)?,
            n_types: args.cutoffs.n_types() as u32,
            force: b.force.zeroed(n * std::mem::size_of::<Scalar4>(), stream)?,
            virial: b
                .virial
                .zeroed(n * VIRIAL_COMPONENTS * std::mem::size_of::<f32>(), stream)?,
            pressure_tensor: args.flags.pressure_tensor as u32,
            seed: args.seed,
            timestep: args.timestep,
            block_size: params.block_size(),
            lanes: params.lanes_per_particle(),
            eval_threads: params.eval_threads(),
            stats: b.stats.zeroed(3 * std::mem::size_of::<u64>(), stream)?,
            ..Default::default()
        };

        if let Some(shapes) = args.shapes {
            let mut node_offset = Vec::with_capacity(shapes.n_types() + 1);
            let mut item_offset = Vec::with_capacity(shapes.n_types() + 1);
            let mut nodes = Vec::new();
            let mut order = Vec::new();
            let mut pos = Vec::new();
            let mut orient = Vec::new();
            let mut diam = Vec::new();
            let mut charge = Vec::new();
            let mut typeid = Vec::new();
            for t in 0..shapes.n_types() {
                node_offset.push(nodes.len() as u32);
                item_offset.push(pos.len() as u32);
                let view = shapes.index(t).map_err(|e| anyhow!("{}", e))?;
                nodes.extend_from_slice(view.tree.nodes());
                order.extend_from_slice(view.tree.order());
                let c = view.constituents;
                pos.extend(c.positions.iter().map(|p| [p.x, p.y, p.z]));
                orient.extend(c.orientations.iter().map(|q| [q.w, q.i, q.j, q.k]));
                diam.extend_from_slice(&c.diameters);
                charge.extend_from_slice(&c.charges);
                typeid.extend_from_slice(&c.typeids);
            }
            node_offset.push(nodes.len() as u32);
            item_offset.push(pos.len() as u32);

            raw.n_shape_types = shapes.n_types() as u32;
            raw.shape_node_offset = b.shape_node_offset.upload(&node_offset, stream)?;
            raw.shape_item_offset = b.shape_item_offset.upload(&item_offset, stream)?;
            raw.nodes = b.nodes.upload(&nodes, stream)?;
            raw.order = b.order.upload(&order, stream)?;
            raw.c_positions = b.c_positions.upload(&pos, stream)?;
            raw.c_orientations = b.c_orientations.upload(&orient, stream)?;
            raw.c_diameters = b.c_diameters.upload(&diam, stream)?;
            raw.c_charges = b.c_charges.upload(&charge, stream)?;
            raw.c_typeids = b.c_typeids.upload(&typeid, stream)?;
            raw.r_cut_constituent = shapes.r_cut_constituent();
        }

        let args_ptr = b.args.upload(std::slice::from_ref(&raw), stream)?;
        Ok(Staged {
            params: *params,
            n,
            args_ptr,
        })
    }

    /// Enqueue the kernel alone on inputs already uploaded by `upload_inputs`.
    fn enqueue(&mut self, staged: Staged, stream: sys::CUstream) -> anyhow::Result<()> {
        let Staged {
            params,
            n,
            mut args_ptr,
        } = staged;
        let block = params.block_size();
        let ppb = params.particles_per_block().max(1) as usize;
        let grid = n.div_ceil(ppb).max(1) as u32;
        let function = self
            .module_for(&params)
            .map_err(|e| anyhow!("{}", e))?
            .function;
        let mut kernel_params = [&mut args_ptr as *mut u64 as *mut c_void];
        unsafe {
            check(
                sys::cuLaunchKernel(
                    function,
                    grid,
                    1,
                    1,
                    block,
                    1,
                    1,
                    0,
                    stream,
                    kernel_params.as_mut_ptr(),
                    std::ptr::null_mut(),
                ),
                "cuLaunchKernel",
            )?
        };
        log::trace!("Launched '{}': grid {} block {}", self.info.entry, grid, block);
        self.in_flight = Some(InFlight { n });
        Ok(())
    }
}

fn device_properties(ordinal: usize) -> anyhow::Result<DeviceProperties> {
    let mut dev: sys::CUdevice = 0;
    let mut warp = 0i32;
    let mut max_threads = 0i32;
    unsafe {
        check(sys::cuDeviceGet(&mut dev, ordinal as i32), "cuDeviceGet")?;
        check(
            sys::cuDeviceGetAttribute(
                &mut warp,
                sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_WARP_SIZE,
                dev,
            ),
            "cuDeviceGetAttribute(warp size)",
        )?;
        check(
            sys::cuDeviceGetAttribute(
                &mut max_threads,
                sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK,
                dev,
            ),
            "cuDeviceGetAttribute(max threads)",
        )?;
    }
    Ok(DeviceProperties {
        warp_size: warp as u32,
        max_threads_per_block: max_threads as u32,
    })
}

fn compile(
    source: &str,
    entry: &str,
    opts: &CompileOptions,
    arch: &'static str,
    launch_bound: u32,
    relocatable: bool,
) -> Result<cudarc::nvrtc::Ptx> {
    let mut options: Vec<String> = opts
        .defines
        .iter()
        .map(|(k, v)| format!("-D{}={}", k, v))
        .collect();
    options.push(format!("-DPAIRJIT_LAUNCH_BOUND={}", launch_bound));
    if relocatable {
        options.push("-rdc=true".to_string());
    }
    options.extend(opts.passthrough.iter().cloned());

    cudarc::nvrtc::compile_ptx_with_opts(
        source,
        cudarc::nvrtc::CompileOptions {
            arch: Some(arch),
            options,
            ..Default::default()
        },
    )
    .map_err(|e| {
        let diagnostics = match e {
            cudarc::nvrtc::CompileError::CompileError { log, .. } => {
                log.to_string_lossy().into_owned()
            }
            other => format!("{:?}", other),
        };
        PairJitError::compilation(entry, diagnostics)
    })
}

fn load_ptx(ptx: &cudarc::nvrtc::Ptx) -> anyhow::Result<sys::CUmodule> {
    let image = CString::new(ptx.to_src()).context("PTX contains a NUL byte")?;
    let mut module: sys::CUmodule = std::ptr::null_mut();
    unsafe {
        check(
            sys::cuModuleLoadData(&mut module, image.as_ptr() as *const c_void),
            "cuModuleLoadData",
        )?
    };
    Ok(module)
}

struct LinkInput {
    name: CString,
    kind: sys::CUjitInputType,
    data: Vec<u8>,
}

fn load_library(lib: &AuxLibrary, opts: &CompileOptions, arch: &'static str) -> Result<LinkInput> {
    match lib {
        AuxLibrary::Path(path) => {
            let kind = match path.extension().and_then(|e| e.to_str()) {
                Some("ptx") => sys::CUjitInputType::CU_JIT_INPUT_PTX,
                Some("cubin") => sys::CUjitInputType::CU_JIT_INPUT_CUBIN,
                Some("fatbin") => sys::CUjitInputType::CU_JIT_INPUT_FATBINARY,
                Some("a") | Some("lib") => sys::CUjitInputType::CU_JIT_INPUT_LIBRARY,
                _ => {
                    return Err(PairJitError::config(format!(
                        "cannot link '{}': expected .ptx, .cubin, .fatbin or .a",
                        path.display()
                    )))
                }
            };
            let mut data = std::fs::read(path)?;
            if kind == sys::CUjitInputType::CU_JIT_INPUT_PTX {
                data.push(0);
            }
            Ok(LinkInput {
                name: c_name(path),
                kind,
                data,
            })
        }
        AuxLibrary::Source { name, text } => {
            let full = format!("{}\n{}", PRELUDE, text);
            let ptx = compile(&full, name, opts, arch, 0, true)?;
            let mut data = ptx.to_src().into_bytes();
            data.push(0);
            Ok(LinkInput {
                name: CString::new(name.as_str()).unwrap_or_default(),
                kind: sys::CUjitInputType::CU_JIT_INPUT_PTX,
                data,
            })
        }
    }
}

fn c_name(path: &Path) -> CString {
    CString::new(path.display().to_string()).unwrap_or_default()
}

/// Link the entry PTX with `libs`, returning the module and linker log.
fn link(
    entry: &str,
    ptx: &cudarc::nvrtc::Ptx,
    libs: &[LinkInput],
) -> Result<(sys::CUmodule, String)> {
    let mut error_log = vec![0u8; LINK_LOG_BYTES];
    let mut info_log = vec![0u8; LINK_LOG_BYTES];
    let mut jit_options = [
        sys::CUjit_option::CU_JIT_ERROR_LOG_BUFFER,
        sys::CUjit_option::CU_JIT_ERROR_LOG_BUFFER_SIZE_BYTES,
        sys::CUjit_option::CU_JIT_INFO_LOG_BUFFER,
        sys::CUjit_option::CU_JIT_INFO_LOG_BUFFER_SIZE_BYTES,
    ];
    let mut jit_values = [
        error_log.as_mut_ptr() as *mut c_void,
        LINK_LOG_BYTES as *mut c_void,
        info_log.as_mut_ptr() as *mut c_void,
        LINK_LOG_BYTES as *mut c_void,
    ];
    let log_text = |buf: &[u8]| {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    };

    let mut main = ptx.to_src().into_bytes();
    main.push(0);
    let main_name = CString::new("<source>").unwrap_or_default();

    let mut state: sys::CUlinkState = std::ptr::null_mut();
    unsafe {
        check(
            sys::cuLinkCreate_v2(
                jit_options.len() as u32,
                jit_options.as_mut_ptr(),
                jit_values.as_mut_ptr(),
                &mut state,
            ),
            "cuLinkCreate",
        )
        .map_err(backend)?;

        let inputs = std::iter::once((&main_name, sys::CUjitInputType::CU_JIT_INPUT_PTX, &main))
            .chain(libs.iter().map(|l| (&l.name, l.kind, &l.data)));
        for (name, kind, data) in inputs {
            let res = sys::cuLinkAddData_v2(
                state,
                kind,
                data.as_ptr() as *mut c_void,
                data.len(),
                name.as_ptr(),
                0,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            );
            if res != sys::CUresult::CUDA_SUCCESS {
                sys::cuLinkDestroy(state);
                return Err(PairJitError::compilation(entry, log_text(&error_log)));
            }
        }

        let mut cubin: *mut c_void = std::ptr::null_mut();
        let mut size: usize = 0;
        if sys::cuLinkComplete(state, &mut cubin, &mut size) != sys::CUresult::CUDA_SUCCESS {
            sys::cuLinkDestroy(state);
            return Err(PairJitError::compilation(entry, log_text(&error_log)));
        }
        let mut module: sys::CUmodule = std::ptr::null_mut();
        let res = sys::cuModuleLoadData(&mut module, cubin);
        sys::cuLinkDestroy(state);
        check(res, "cuModuleLoadData").map_err(backend)?;
        Ok((module, log_text(&info_log)))
    }
}

impl KernelFactory for CudaKernelFactory {
    type Stream = Arc<CudaStream>;

    fn device(&self) -> DeviceProperties {
        self.device
    }

    fn module_info(&self) -> &ModuleInfo {
        &self.info
    }

    fn set_parameter_pointer(&mut self, symbol: &str, address: ParamAddress) -> Result<()> {
        match address {
            ParamAddress::Device(ptr) => {
                if !self.write_global(symbol, ptr).map_err(backend)? {
                    return Err(PairJitError::symbol(symbol));
                }
                self.host_params.remove(symbol);
            }
            ParamAddress::Host(array) => {
                // Validate the symbol now; the array is uploaded at each launch.
                if !self.write_global(symbol, 0).map_err(backend)? {
                    return Err(PairJitError::symbol(symbol));
                }
                self.host_params
                    .insert(symbol.to_string(), (array, DeviceVec::default()));
            }
        }
        if !self.info.externs.iter().any(|e| e == symbol) {
            self.info.externs.push(symbol.to_string());
        }
        log::debug!("Bound '{}' in {} module(s)", symbol, self.modules.len());
        Ok(())
    }

    fn launch_bound_candidates(&self) -> &[u32] {
        &self.launch_bounds
    }

    fn stage(
        &mut self,
        params: &LaunchParams,
        args: &PairKernelArgs<'_>,
        stream: &Arc<CudaStream>,
    ) -> Result<()> {
        args.validate()?;
        self.context
            .bind_to_thread()
            .map_err(|e| PairJitError::backend(format!("bind context: {:?}", e)))?;
        self.module_for(params)?;
        let staged = self
            .upload_inputs(params, args, stream.cu_stream())
            .map_err(backend)?;
        self.staged = Some(staged);
        Ok(())
    }

    fn launch(
        &mut self,
        params: &LaunchParams,
        args: &PairKernelArgs<'_>,
        stream: &Arc<CudaStream>,
    ) -> Result<()> {
        let staged = match self.staged.take() {
            Some(s) if s.params == *params && s.n == args.n() => s,
            _ => {
                self.stage(params, args, stream)?;
                self.staged
                    .take()
                    .ok_or_else(|| PairJitError::usage("launch inputs were not staged"))?
            }
        };
        self.enqueue(staged, stream.cu_stream()).map_err(backend)
    }

    fn check_errors(&mut self, stream: &Arc<CudaStream>) -> Result<()> {
        let res = unsafe { sys::cuStreamSynchronize(stream.cu_stream()) };
        if res != sys::CUresult::CUDA_SUCCESS {
            log::warn!("Kernel '{}' faulted: {:?}", self.info.entry, res);
            return Err(PairJitError::device(&self.info.entry, format!("{:?}", res)));
        }
        let fault = self.read_fault().map_err(backend)?;
        if fault != 0 {
            log::warn!("Kernel '{}' reported fault code {}", self.info.entry, fault);
            return Err(PairJitError::device(
                &self.info.entry,
                format!("kernel reported fault code {}", fault),
            ));
        }
        Ok(())
    }

    fn synchronize(
        &mut self,
        stream: &Arc<CudaStream>,
        out: &mut ForceBuffers,
    ) -> Result<LaunchStats> {
        let InFlight { n } = self
            .in_flight
            .take()
            .ok_or_else(|| PairJitError::usage("synchronize called with no launch in flight"))?;
        out.reset(n);
        let mut stats = [0u64; 3];
        let s = stream.cu_stream();
        let b = &self.buffers;
        b.force
            .download(&mut out.force, s)
            .and_then(|_| b.virial.download(&mut out.virial, s))
            .and_then(|_| b.stats.download(&mut stats, s))
            .and_then(|_| unsafe { check(sys::cuStreamSynchronize(s), "cuStreamSynchronize") })
            .map_err(backend)?;
        Ok(LaunchStats {
            pairs: stats[0],
            constituents: NarrowPhaseCounts {
                evaluated: stats[1],
                pruned: stats[2],
            },
        })
    }

    fn timer(&self, stream: &Arc<CudaStream>) -> Box<dyn KernelTimer> {
        Box::new(EventTimer::new(stream.cu_stream()))
    }
}

/// Device event pair timing work on one stream.
pub struct EventTimer {
    stream: sys::CUstream,
    start: sys::CUevent,
    stop: sys::CUevent,
}

// Events belong to the stream's context and are only touched by its owner.
unsafe impl Send for EventTimer {}

impl EventTimer {
    pub fn new(stream: sys::CUstream) -> Self {
        let mut start: sys::CUevent = std::ptr::null_mut();
        let mut stop: sys::CUevent = std::ptr::null_mut();
        unsafe {
            if sys::cuEventCreate(&mut start, 0) != sys::CUresult::CUDA_SUCCESS
                || sys::cuEventCreate(&mut stop, 0) != sys::CUresult::CUDA_SUCCESS
            {
                log::warn!("cuEventCreate failed; kernel timings will read as zero");
            }
        }
        Self {
            stream,
            start,
            stop,
        }
    }
}

impl KernelTimer for EventTimer {
    fn start(&mut self) {
        if !self.start.is_null() {
            unsafe {
                sys::cuEventRecord(self.start, self.stream);
            }
        }
    }

    fn stop(&mut self) -> f32 {
        if self.start.is_null() || self.stop.is_null() {
            return 0.0;
        }
        let mut ms = 0.0f32;
        unsafe {
            sys::cuEventRecord(self.stop, self.stream);
            if sys::cuEventSynchronize(self.stop) != sys::CUresult::CUDA_SUCCESS {
                return 0.0;
            }
            if sys::cuEventElapsedTime(&mut ms, self.start, self.stop) != sys::CUresult::CUDA_SUCCESS
            {
                return 0.0;
            }
        }
        ms
    }
}

impl Drop for EventTimer {
    fn drop(&mut self) {
        unsafe {
            if !self.start.is_null() {
                sys::cuEventDestroy_v2(self.start);
            }
            if !self.stop.is_null() {
                sys::cuEventDestroy_v2(self.stop);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arch_names() {
        assert_eq!(arch_name(86).unwrap(), "sm_86");
        assert!(arch_name(12).is_err());
    }

    #[test]
    fn test_raw_args_layout_is_pointer_aligned() {
        assert_eq!(std::mem::align_of::<RawArgs>(), 8);
        assert_eq!(std::mem::size_of::<RawArgs>() % 8, 0);
    }

    #[test]
    #[ignore] // Requires a CUDA device
    fn test_compile_error_carries_nvrtc_log() {
        env_logger::builder().is_test(true).try_init().ok();
        let src = "PAIRJIT_KERNEL(broken) { this is not cuda }";
        let err = CudaKernelFactory::new(0, src, "broken", &[], &[], 86).unwrap_err();
        assert!(!err.diagnostics().unwrap().is_empty());
    }
}
