use compute::layout::{ScaleParameters, SCALE_THREADS_PER_GROUP, STORAGE_DATA, UNIFORM_PARAMS};
use compute::startup;
use std::fs;
use std::path::{Path, PathBuf};

fn scale_kernel_path() -> PathBuf {
    let registry = startup(Path::new(env!("CARGO_MANIFEST_DIR")).join("../../shaders")).unwrap();
    registry.scale_kernel().unwrap().source_path().to_path_buf()
}

// Helper function to parse and validate a WGSL shader file using naga
fn validate_wgsl_shader(shader_path: &Path) -> naga::Module {
    let shader_source = match fs::read_to_string(shader_path) {
        Ok(s) => s,
        Err(e) => panic!("Failed to read shader file {shader_path:?}: {e}"),
    };

    let module = match naga::front::wgsl::parse_str(&shader_source) {
        Ok(m) => m,
        Err(e) => {
            panic!(
                "WGSL parsing error in {shader_path:?}:\n{error_report}",
                error_report = e.emit_to_string(&shader_source)
            );
        }
    };

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );

    if let Err(e) = validator.validate(&module) {
        panic!(
            "WGSL validation error in {shader_path:?}:\n{error_report}",
            error_report = e.emit_to_string(&shader_source)
        );
    }
    module
}

#[test]
fn scale_shader_compiles() {
    validate_wgsl_shader(&scale_kernel_path());
}

#[test]
fn entry_point_matches_host_group_math() {
    let module = validate_wgsl_shader(&scale_kernel_path());
    let entry = module
        .entry_points
        .iter()
        .find(|ep| ep.name == "MainCS")
        .expect("MainCS entry point");
    assert_eq!(entry.stage, naga::ShaderStage::Compute);
    assert_eq!(entry.workgroup_size, [SCALE_THREADS_PER_GROUP, 1, 1]);
}

#[test]
fn uniform_block_matches_host_layout() {
    let module = validate_wgsl_shader(&scale_kernel_path());

    let (_, uniform) = module
        .global_variables
        .iter()
        .find(|(_, var)| var.space == naga::AddressSpace::Uniform)
        .expect("uniform parameter block");
    let binding = uniform.binding.as_ref().expect("uniform binding");
    assert_eq!((binding.group, binding.binding), (0, UNIFORM_PARAMS));
    match &module.types[uniform.ty].inner {
        naga::TypeInner::Struct { members, span } => {
            assert_eq!(*span as usize, std::mem::size_of::<ScaleParameters>());
            let offsets: Vec<u32> = members.iter().map(|m| m.offset).collect();
            assert_eq!(offsets, [0, 4, 8]);
        }
        other => panic!("uniform block is not a struct: {other:?}"),
    }

    let storage = module
        .global_variables
        .iter()
        .find_map(|(_, var)| match var.space {
            naga::AddressSpace::Storage { .. } => var.binding.clone(),
            _ => None,
        })
        .expect("storage buffer binding");
    assert_eq!(storage.binding, STORAGE_DATA);
}
