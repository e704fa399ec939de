//! Transpile the WGSL conversion kernels to GLSL 4.50 compute shaders.
//!
//! Each kernel lives in its own file with an entry point of the same name.
//! The output is written to `OUT_DIR/<entry_point>.glsl` and embedded by
//! `kernels::shaders`.

use std::collections::BTreeMap;
use std::path::Path;

const KERNELS: [&str; 5] = [
    "pack_normals_depth",
    "normals_to_tensor",
    "depth_to_tensor",
    "tensor_to_scalar",
    "tensor_to_depth",
];

fn main() {
    let out_dir = std::env::var("OUT_DIR").unwrap();
    let shader_dir = Path::new("shaders");

    for entry_point in KERNELS {
        let wgsl_path = shader_dir.join(format!("{entry_point}.wgsl"));
        println!("cargo:rerun-if-changed={}", wgsl_path.display());

        let source = std::fs::read_to_string(&wgsl_path).unwrap_or_else(|e| {
            panic!("Failed to read WGSL source {wgsl_path:?}: {e}");
        });
        let module = naga::front::wgsl::parse_str(&source).unwrap_or_else(|e| {
            panic!("Failed to parse WGSL {wgsl_path:?}: {e}");
        });
        let info = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .unwrap_or_else(|e| {
            panic!("WGSL validation failed for {wgsl_path:?}: {e}");
        });

        // Keep the WGSL binding numbers as GL binding points. Uniform and
        // storage blocks have separate binding namespaces in GL.
        let binding_map: BTreeMap<naga::ResourceBinding, u8> = module
            .global_variables
            .iter()
            .filter_map(|(_, var)| var.binding.clone())
            .map(|rb| {
                let slot = u8::try_from(rb.binding).unwrap_or_else(|_| {
                    panic!("binding {} in {entry_point} does not fit a GL slot", rb.binding)
                });
                (rb, slot)
            })
            .collect();

        let options = naga::back::glsl::Options {
            version: naga::back::glsl::Version::Desktop(450),
            writer_flags: naga::back::glsl::WriterFlags::empty(),
            binding_map,
            zero_initialize_workgroup_memory: true,
        };
        let pipeline_options = naga::back::glsl::PipelineOptions {
            shader_stage: naga::ShaderStage::Compute,
            entry_point: entry_point.to_string(),
            multiview: None,
        };

        let mut glsl_source = String::new();
        let mut writer = naga::back::glsl::Writer::new(
            &mut glsl_source,
            &module,
            &info,
            &options,
            &pipeline_options,
            naga::proc::BoundsCheckPolicies::default(),
        )
        .unwrap_or_else(|e| {
            panic!("GLSL writer init failed for {entry_point}: {e}");
        });
        writer.write().unwrap_or_else(|e| {
            panic!("GLSL transpilation failed for {entry_point}: {e}");
        });

        let glsl_path = format!("{out_dir}/{entry_point}.glsl");
        std::fs::write(&glsl_path, &glsl_source).unwrap_or_else(|e| {
            panic!("Failed to write {glsl_path}: {e}");
        });
    }
}
