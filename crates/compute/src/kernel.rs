//! Kernel registration.
//!
//! A [`KernelRegistry`] is built once at startup through a
//! [`KernelRegistryBuilder`] and frozen behind an `Arc`. After [`build`] the
//! table is never written again, so any thread may read it without locking.
//!
//! [`build`]: KernelRegistryBuilder::build

use crate::layout::{self, ScaleParameters, SCALE_THREADS_PER_GROUP};
use crate::ComputeError;
use bytemuck::Pod;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Virtual root under which the bundled shaders are mapped.
pub const SHADER_ROOT: &str = "/ClothComputeShaders";
pub const SCALE_KERNEL_PATH: &str = "/ClothComputeShaders/Private/TestCompute.wgsl";
pub const SCALE_KERNEL_ENTRY: &str = "MainCS";

/// Capability tier of a device or compiled target, ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeatureLevel {
    Es31,
    Sm5,
    Sm6,
}

impl FeatureLevel {
    pub const ALL: [FeatureLevel; 3] = [FeatureLevel::Es31, FeatureLevel::Sm5, FeatureLevel::Sm6];
}

/// Physical directories for virtual shader roots.
#[derive(Debug, Clone, Default)]
pub struct ShaderDirectoryMap {
    roots: BTreeMap<String, PathBuf>,
}

impl ShaderDirectoryMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `virtual_root` (e.g. `/ClothComputeShaders`) onto `directory`.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::InvalidVirtualPath`] if the root does not start
    /// with `/`, is just `/`, or ends with `/`.
    pub fn map(&mut self, virtual_root: &str, directory: impl Into<PathBuf>) -> Result<(), ComputeError> {
        if !virtual_root.starts_with('/') || virtual_root.len() < 2 || virtual_root.ends_with('/') {
            return Err(ComputeError::InvalidVirtualPath(virtual_root.to_owned()));
        }
        let directory = directory.into();
        tracing::debug!("Mapping shader root {virtual_root} -> {}", directory.display());
        self.roots.insert(virtual_root.to_owned(), directory);
        Ok(())
    }

    /// Resolves a virtual shader path against the longest matching root.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::UnmappedVirtualPath`] when no root covers the path.
    pub fn resolve(&self, virtual_path: &str) -> Result<PathBuf, ComputeError> {
        self.roots
            .iter()
            .filter_map(|(root, dir)| {
                virtual_path
                    .strip_prefix(root.as_str())
                    .and_then(|rest| rest.strip_prefix('/'))
                    .filter(|rest| !rest.is_empty())
                    .map(|rest| (root.len(), dir.join(rest)))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, path)| path)
            .ok_or_else(|| ComputeError::UnmappedVirtualPath(virtual_path.to_owned()))
    }
}

/// Description of a kernel before registration.
#[derive(Debug, Clone)]
pub struct KernelDesc {
    pub virtual_path: String,
    pub entry_point: String,
    pub min_feature_level: FeatureLevel,
    pub workgroup_size: [u32; 3],
    pub uniform_size: usize,
}

impl KernelDesc {
    /// Describes a compute kernel whose uniform block is `P`.
    pub fn new<P: Pod>(virtual_path: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            virtual_path: virtual_path.into(),
            entry_point: entry_point.into(),
            min_feature_level: FeatureLevel::Sm5,
            workgroup_size: [SCALE_THREADS_PER_GROUP, 1, 1],
            uniform_size: std::mem::size_of::<P>(),
        }
    }

    #[must_use]
    pub fn with_min_feature_level(mut self, level: FeatureLevel) -> Self {
        self.min_feature_level = level;
        self
    }

    #[must_use]
    pub fn with_workgroup_size(mut self, size: [u32; 3]) -> Self {
        self.workgroup_size = size;
        self
    }
}

#[derive(Debug)]
struct KernelInfo {
    id: usize,
    virtual_path: String,
    entry_point: String,
    supported: Vec<FeatureLevel>,
    workgroup_size: [u32; 3],
    uniform_size: usize,
    source_path: PathBuf,
}

/// A registered kernel. Cheap to clone; immutable.
#[derive(Debug, Clone)]
pub struct KernelBinding(Arc<KernelInfo>);

impl KernelBinding {
    /// Index in the registry, stable for the life of the process.
    #[must_use]
    pub fn id(&self) -> usize {
        self.0.id
    }

    #[must_use]
    pub fn virtual_path(&self) -> &str {
        &self.0.virtual_path
    }

    #[must_use]
    pub fn entry_point(&self) -> &str {
        &self.0.entry_point
    }

    /// Weakest feature level the kernel was compiled for.
    #[must_use]
    pub fn min_feature_level(&self) -> FeatureLevel {
        // Registration rejects kernels with no supported level.
        self.0.supported.first().copied().unwrap_or(FeatureLevel::Sm6)
    }

    #[must_use]
    pub fn supports(&self, level: FeatureLevel) -> bool {
        self.0.supported.contains(&level)
    }

    #[must_use]
    pub fn workgroup_size(&self) -> [u32; 3] {
        self.0.workgroup_size
    }

    #[must_use]
    pub fn uniform_size(&self) -> usize {
        self.0.uniform_size
    }

    /// Physical file the virtual path resolved to at registration.
    #[must_use]
    pub fn source_path(&self) -> &Path {
        &self.0.source_path
    }

    /// One-dimensional dispatch size covering `element_count` threads.
    #[must_use]
    pub fn group_count_for(&self, element_count: u32) -> [u32; 3] {
        [layout::group_count(element_count, self.0.workgroup_size[0]), 1, 1]
    }
}

pub struct KernelRegistryBuilder {
    targets: Vec<FeatureLevel>,
    directories: ShaderDirectoryMap,
    kernels: Vec<KernelBinding>,
}

impl KernelRegistryBuilder {
    /// Starts a registry for the given compiled target feature levels.
    #[must_use]
    pub fn new(targets: &[FeatureLevel]) -> Self {
        Self {
            targets: targets.to_vec(),
            directories: ShaderDirectoryMap::new(),
            kernels: Vec::new(),
        }
    }

    /// # Errors
    ///
    /// See [`ShaderDirectoryMap::map`].
    pub fn map_shader_directory(
        &mut self,
        virtual_root: &str,
        directory: impl Into<PathBuf>,
    ) -> Result<&mut Self, ComputeError> {
        self.directories.map(virtual_root, directory)?;
        Ok(self)
    }

    /// Registers a kernel compiled for every target at or above its minimum level.
    ///
    /// # Errors
    ///
    /// See [`KernelRegistryBuilder::register_with`].
    pub fn register(&mut self, desc: KernelDesc) -> Result<KernelBinding, ComputeError> {
        let min = desc.min_feature_level;
        self.register_with(desc, |level| level >= min)
    }

    /// Registers a kernel compiled for every target accepted by `should_compile`.
    ///
    /// # Errors
    ///
    /// Fails if the uniform block is not 16-byte aligned, the virtual path is
    /// unmapped, the kernel is already registered, or `should_compile` rejects
    /// every target.
    pub fn register_with<F>(&mut self, desc: KernelDesc, should_compile: F) -> Result<KernelBinding, ComputeError>
    where
        F: Fn(FeatureLevel) -> bool,
    {
        if desc.uniform_size == 0 || desc.uniform_size % layout::UNIFORM_ALIGNMENT != 0 {
            return Err(ComputeError::MisalignedParameters(desc.uniform_size));
        }
        if desc.workgroup_size.contains(&0) {
            return Err(ComputeError::ShapeMismatch("workgroup size must be non-zero"));
        }
        let source_path = self.directories.resolve(&desc.virtual_path)?;
        if self
            .kernels
            .iter()
            .any(|k| k.virtual_path() == desc.virtual_path && k.entry_point() == desc.entry_point)
        {
            return Err(ComputeError::DuplicateKernel(format!("{}:{}", desc.virtual_path, desc.entry_point)));
        }

        let mut supported: Vec<FeatureLevel> = self.targets.iter().copied().filter(|l| should_compile(*l)).collect();
        supported.sort_unstable();
        supported.dedup();
        if supported.is_empty() {
            tracing::warn!(
                "Kernel {}:{} compiles for none of {:?}; skipping.",
                desc.virtual_path,
                desc.entry_point,
                self.targets
            );
            return Err(ComputeError::NoSupportedTarget {
                virtual_path: desc.virtual_path,
                entry_point: desc.entry_point,
            });
        }

        let binding = KernelBinding(Arc::new(KernelInfo {
            id: self.kernels.len(),
            virtual_path: desc.virtual_path,
            entry_point: desc.entry_point,
            supported,
            workgroup_size: desc.workgroup_size,
            uniform_size: desc.uniform_size,
            source_path,
        }));
        tracing::debug!(
            "Registered kernel {}:{} for {:?}",
            binding.virtual_path(),
            binding.entry_point(),
            binding.0.supported
        );
        self.kernels.push(binding.clone());
        Ok(binding)
    }

    #[must_use]
    pub fn build(self) -> Arc<KernelRegistry> {
        let index = self
            .kernels
            .iter()
            .map(|k| ((k.virtual_path().to_owned(), k.entry_point().to_owned()), k.id()))
            .collect();
        Arc::new(KernelRegistry {
            targets: self.targets,
            directories: self.directories,
            kernels: self.kernels,
            index,
        })
    }
}

/// Frozen kernel table.
pub struct KernelRegistry {
    targets: Vec<FeatureLevel>,
    directories: ShaderDirectoryMap,
    kernels: Vec<KernelBinding>,
    index: HashMap<(String, String), usize>,
}

impl KernelRegistry {
    #[must_use]
    pub fn get(&self, virtual_path: &str, entry_point: &str) -> Option<&KernelBinding> {
        self.index
            .get(&(virtual_path.to_owned(), entry_point.to_owned()))
            .map(|&id| &self.kernels[id])
    }

    #[must_use]
    pub fn scale_kernel(&self) -> Option<&KernelBinding> {
        self.get(SCALE_KERNEL_PATH, SCALE_KERNEL_ENTRY)
    }

    pub fn kernels(&self) -> impl Iterator<Item = &KernelBinding> {
        self.kernels.iter()
    }

    #[must_use]
    pub fn targets(&self) -> &[FeatureLevel] {
        &self.targets
    }

    #[must_use]
    pub fn directories(&self) -> &ShaderDirectoryMap {
        &self.directories
    }
}

/// Shader directory bundled with the workspace.
#[must_use]
pub fn default_shader_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../shaders")
}

/// Process startup: maps [`SHADER_ROOT`] onto `shader_dir` and registers the
/// scale kernel for every feature level that meets SM5.
///
/// # Errors
///
/// Propagates registration failures.
pub fn startup(shader_dir: impl Into<PathBuf>) -> Result<Arc<KernelRegistry>, ComputeError> {
    let mut builder = KernelRegistryBuilder::new(&FeatureLevel::ALL);
    builder.map_shader_directory(SHADER_ROOT, shader_dir)?;
    builder.register(
        KernelDesc::new::<ScaleParameters>(SCALE_KERNEL_PATH, SCALE_KERNEL_ENTRY)
            .with_min_feature_level(FeatureLevel::Sm5),
    )?;
    let registry = builder.build();
    tracing::info!("Kernel registry ready with {} kernel(s).", registry.kernels.len());
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
    struct OddParams {
        value: f32,
        count: u32,
        extra: u32,
    }

    fn builder() -> KernelRegistryBuilder {
        let mut builder = KernelRegistryBuilder::new(&FeatureLevel::ALL);
        builder.map_shader_directory("/Shaders", "/opt/shaders").unwrap();
        builder
    }

    #[test]
    fn resolve_uses_longest_root() {
        let mut map = ShaderDirectoryMap::new();
        map.map("/Shaders", "/a").unwrap();
        map.map("/Shaders/Private", "/b").unwrap();
        assert_eq!(map.resolve("/Shaders/Public/X.wgsl").unwrap(), PathBuf::from("/a/Public/X.wgsl"));
        assert_eq!(map.resolve("/Shaders/Private/X.wgsl").unwrap(), PathBuf::from("/b/X.wgsl"));
    }

    #[test]
    fn resolve_requires_segment_boundary() {
        let mut map = ShaderDirectoryMap::new();
        map.map("/Shaders", "/a").unwrap();
        assert!(matches!(map.resolve("/ShadersExtra/X.wgsl"), Err(ComputeError::UnmappedVirtualPath(_))));
        assert!(matches!(map.resolve("/Shaders"), Err(ComputeError::UnmappedVirtualPath(_))));
    }

    #[test]
    fn invalid_roots_are_rejected() {
        let mut map = ShaderDirectoryMap::new();
        for root in ["Shaders", "/", "/Shaders/", ""] {
            assert!(matches!(map.map(root, "/a"), Err(ComputeError::InvalidVirtualPath(_))), "{root}");
        }
    }

    #[test]
    fn unmapped_kernel_is_rejected() {
        let mut builder = KernelRegistryBuilder::new(&FeatureLevel::ALL);
        let result = builder.register(KernelDesc::new::<ScaleParameters>("/Missing/K.wgsl", "MainCS"));
        assert!(matches!(result, Err(ComputeError::UnmappedVirtualPath(_))));
    }

    #[test]
    fn unsatisfiable_predicate_is_rejected() {
        let mut builder = KernelRegistryBuilder::new(&[FeatureLevel::Es31]);
        builder.map_shader_directory("/Shaders", "/opt").unwrap();
        let result = builder.register(KernelDesc::new::<ScaleParameters>("/Shaders/K.wgsl", "MainCS"));
        assert!(matches!(result, Err(ComputeError::NoSupportedTarget { .. })));

        let result = builder.register_with(KernelDesc::new::<ScaleParameters>("/Shaders/K.wgsl", "MainCS"), |_| false);
        assert!(matches!(result, Err(ComputeError::NoSupportedTarget { .. })));
    }

    #[test]
    fn predicate_selects_targets() {
        let mut builder = builder();
        let binding = builder
            .register_with(KernelDesc::new::<ScaleParameters>("/Shaders/K.wgsl", "MainCS"), |l| {
                l == FeatureLevel::Sm6
            })
            .unwrap();
        assert!(binding.supports(FeatureLevel::Sm6));
        assert!(!binding.supports(FeatureLevel::Sm5));
        assert_eq!(binding.min_feature_level(), FeatureLevel::Sm6);
    }

    #[test]
    fn misaligned_parameters_are_rejected() {
        let mut builder = builder();
        let result = builder.register(KernelDesc::new::<OddParams>("/Shaders/K.wgsl", "MainCS"));
        assert!(matches!(result, Err(ComputeError::MisalignedParameters(12))));
    }

    #[test]
    fn duplicate_kernel_is_rejected() {
        let mut builder = builder();
        builder.register(KernelDesc::new::<ScaleParameters>("/Shaders/K.wgsl", "MainCS")).unwrap();
        let again = builder.register(KernelDesc::new::<ScaleParameters>("/Shaders/K.wgsl", "MainCS"));
        assert!(matches!(again, Err(ComputeError::DuplicateKernel(_))));
        builder.register(KernelDesc::new::<ScaleParameters>("/Shaders/K.wgsl", "OtherCS")).unwrap();
    }

    #[test]
    fn startup_registers_scale_kernel() {
        let registry = startup("/opt/cloth").unwrap();
        let kernel = registry.scale_kernel().expect("scale kernel");
        assert_eq!(kernel.entry_point(), "MainCS");
        assert_eq!(kernel.source_path(), Path::new("/opt/cloth/Private/TestCompute.wgsl"));
        assert_eq!(kernel.uniform_size(), 16);
        assert_eq!(kernel.workgroup_size(), [64, 1, 1]);
        assert_eq!(kernel.min_feature_level(), FeatureLevel::Sm5);
        assert!(!kernel.supports(FeatureLevel::Es31));
        assert_eq!(kernel.group_count_for(256), [4, 1, 1]);
        assert_eq!(registry.kernels().count(), 1);
    }

    #[test]
    fn registry_is_shareable_across_threads() {
        let registry = startup("/opt/cloth").unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.scale_kernel().map(KernelBinding::id))
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), Some(0));
        }
    }
}
