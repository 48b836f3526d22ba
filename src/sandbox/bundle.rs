//! Sandbox bundler.
//!
//! Offline step, run once at worker construction: synthesizes a single
//! self-contained artifact from a workflows directory, generated activity
//! stubs and interceptor modules. The artifact is a deterministic JSON
//! string (workflow modules are WAT text, so nothing needs a binary
//! encoding); bundling identical inputs twice yields byte-identical
//! output, which snapshot caching relies on.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::config::ActivityDefaults;

pub const BUNDLE_FORMAT_VERSION: u32 = 1;

/// Workflow and interceptor modules are WebAssembly text files.
const MODULE_EXTENSION: &str = "wat";
/// Generated activity stubs live in the virtual overlay as descriptors.
const STUB_EXTENSION: &str = "stub.json";

/// Determinism-sensitive surfaces the sandbox overrides; recorded in the
/// entry descriptor so a snapshot knows what its runtime must install.
const DETERMINISM_OVERRIDES: &[&str] = &["now", "random", "weak-refs", "native-timers"];

/// One resolution failure reported by the bundler.
#[derive(Debug, Clone)]
pub struct BundleDiagnostic {
    pub module: String,
    pub message: String,
}

impl fmt::Display for BundleDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.module, self.message)
    }
}

fn format_diagnostics(diagnostics: &[BundleDiagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| format!("  {d}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("workflows path is not a directory: {0}")]
    WorkflowsPathMissing(PathBuf),
    #[error("no workflow modules (*.{MODULE_EXTENSION}) found under {0}")]
    NoWorkflows(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("bundling failed with {} diagnostic(s):\n{}", .0.len(), format_diagnostics(.0))]
    Diagnostics(Vec<BundleDiagnostic>),
    #[error("malformed bundle artifact: {0}")]
    MalformedArtifact(String),
}

/// Stub entry for one generated activity function: calling it inside the
/// sandbox forwards to `schedule_activity` with the stringified
/// `[module, function]` pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct StubFunction {
    pub forward_to: String,
    #[serde(rename = "type")]
    pub activity_type: String,
    pub kind: String,
    pub start_to_close_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct StubDescriptor {
    pub specifier: String,
    pub functions: BTreeMap<String, StubFunction>,
}

/// Synthesized entrypoint: the ordered lazy-link roster, the module
/// exporting the sandbox interface, and the determinism overrides the
/// runtime installs around it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct EntryDescriptor {
    pub roster: Vec<String>,
    pub interface: String,
    pub overrides: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct BundleManifest {
    pub version: u32,
    pub entry: EntryDescriptor,
    /// Module name to WAT source, in stable order.
    pub modules: BTreeMap<String, String>,
    /// Activity specifier to generated stub descriptor.
    pub stubs: BTreeMap<String, StubDescriptor>,
}

/// Inputs to one bundler run.
pub struct BundleOptions {
    pub workflows_path: PathBuf,
    /// Extra resolve roots for interceptor and library modules.
    pub dependency_roots: Vec<PathBuf>,
    /// Activity module specifier to exported function names.
    pub activity_stubs: BTreeMap<String, BTreeSet<String>>,
    /// Interceptor module specifiers, in registration order.
    pub interceptor_modules: Vec<String>,
    /// Name of the module exporting the sandbox interface.
    pub interface_module: String,
    pub activity_defaults: ActivityDefaults,
}

/// The built artifact plus its parsed form and content digest.
pub struct WorkflowBundle {
    artifact: String,
    digest: String,
    manifest: BundleManifest,
}

impl fmt::Debug for WorkflowBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowBundle")
            .field("digest", &self.digest)
            .field("modules", &self.manifest.modules.len())
            .field("stubs", &self.manifest.stubs.len())
            .finish()
    }
}

impl WorkflowBundle {
    /// The self-contained artifact string.
    pub fn artifact(&self) -> &str {
        &self.artifact
    }

    /// Hex sha256 of the artifact; the snapshot cache key.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub(crate) fn manifest(&self) -> &BundleManifest {
        &self.manifest
    }

    /// Reconstruct a bundle from a previously produced artifact.
    pub fn parse(artifact: impl Into<String>) -> Result<Self, BundleError> {
        let artifact = artifact.into();
        let manifest: BundleManifest = serde_json::from_str(&artifact)
            .map_err(|err| BundleError::MalformedArtifact(err.to_string()))?;
        if manifest.version != BUNDLE_FORMAT_VERSION {
            return Err(BundleError::MalformedArtifact(format!(
                "unsupported bundle version {}",
                manifest.version
            )));
        }
        let digest = hex_digest(&artifact);
        Ok(Self {
            artifact,
            digest,
            manifest,
        })
    }
}

fn hex_digest(artifact: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(artifact.as_bytes());
    let out = hasher.finalize();
    out.iter().map(|b| format!("{b:02x}")).collect()
}

/// In-memory filesystem overlaid on the real one. Generated files shadow
/// files on disk at the same path.
#[derive(Default)]
struct VirtualFs {
    overlay: BTreeMap<PathBuf, String>,
}

impl VirtualFs {
    fn write(&mut self, path: PathBuf, content: String) {
        self.overlay.insert(path, content);
    }

    fn read(&self, path: &Path) -> Result<Option<String>, std::io::Error> {
        if let Some(content) = self.overlay.get(path) {
            return Ok(Some(content.clone()));
        }
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Flatten a module specifier into a single path component.
fn sanitize_specifier(specifier: &str) -> String {
    specifier.replace(['/', '\\', ':'], "--")
}

/// Builds the bundle artifact. See the module docs for the algorithm.
pub struct SandboxBundler {
    options: BundleOptions,
}

impl SandboxBundler {
    pub fn new(options: BundleOptions) -> Self {
        Self { options }
    }

    pub fn build(&self) -> Result<WorkflowBundle, BundleError> {
        let workflows_path = &self.options.workflows_path;
        if !workflows_path.is_dir() {
            return Err(BundleError::WorkflowsPathMissing(workflows_path.clone()));
        }

        let mut vfs = VirtualFs::default();
        let stubs = self.generate_stubs(&mut vfs);
        let discovered = self.scan_workflows(workflows_path)?;
        if discovered.is_empty() {
            return Err(BundleError::NoWorkflows(workflows_path.clone()));
        }

        let roster = self.assemble_roster(&discovered);
        let entry = EntryDescriptor {
            roster: roster.clone(),
            interface: self.options.interface_module.clone(),
            overrides: DETERMINISM_OVERRIDES.iter().map(|s| s.to_string()).collect(),
        };

        let mut diagnostics = Vec::new();
        let mut modules = BTreeMap::new();
        for name in &roster {
            match self.resolve_module(&vfs, name) {
                Ok(Some(source)) => {
                    modules.insert(name.clone(), source);
                }
                Ok(None) => diagnostics.push(BundleDiagnostic {
                    module: name.clone(),
                    message: format!(
                        "cannot resolve module (searched workflows path and {} dependency root(s) \
                         for {name}.{MODULE_EXTENSION})",
                        self.options.dependency_roots.len()
                    ),
                }),
                Err(err) => diagnostics.push(BundleDiagnostic {
                    module: name.clone(),
                    message: err.to_string(),
                }),
            }
        }
        if !diagnostics.is_empty() {
            return Err(BundleError::Diagnostics(diagnostics));
        }

        let manifest = BundleManifest {
            version: BUNDLE_FORMAT_VERSION,
            entry,
            modules,
            stubs,
        };
        // BTreeMap ordering plus compact encoding keeps the artifact
        // byte-identical across runs with identical inputs.
        let artifact = serde_json::to_string(&manifest)
            .map_err(|err| BundleError::MalformedArtifact(err.to_string()))?;
        let digest = hex_digest(&artifact);
        debug!(
            modules = manifest.modules.len(),
            stubs = manifest.stubs.len(),
            %digest,
            "workflow bundle built"
        );
        Ok(WorkflowBundle {
            artifact,
            digest,
            manifest,
        })
    }

    /// Generate one stub descriptor per activity module specifier and
    /// write it into the overlay, shadowing any real file at that path.
    fn generate_stubs(&self, vfs: &mut VirtualFs) -> BTreeMap<String, StubDescriptor> {
        let defaults = &self.options.activity_defaults;
        let mut stubs = BTreeMap::new();
        for (specifier, functions) in &self.options.activity_stubs {
            let mut entries = BTreeMap::new();
            for function in functions {
                let activity_type =
                    serde_json::to_string(&(specifier, function)).expect("pair serializes");
                entries.insert(
                    function.clone(),
                    StubFunction {
                        forward_to: "schedule_activity".to_string(),
                        activity_type,
                        kind: "remote".to_string(),
                        start_to_close_timeout_ms: defaults.start_to_close_timeout.as_millis()
                            as u64,
                    },
                );
            }
            let descriptor = StubDescriptor {
                specifier: specifier.clone(),
                functions: entries,
            };
            let path = self.options.workflows_path.join(format!(
                "{}.{STUB_EXTENSION}",
                sanitize_specifier(specifier)
            ));
            let content =
                serde_json::to_string(&descriptor).expect("stub descriptor serializes");
            vfs.write(path, content);
            stubs.insert(specifier.clone(), descriptor);
        }
        stubs
    }

    /// Shallow scan of the workflows directory for WAT modules.
    fn scan_workflows(&self, path: &Path) -> Result<BTreeSet<String>, BundleError> {
        let mut found = BTreeSet::new();
        let entries = std::fs::read_dir(path).map_err(|source| BundleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| BundleError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let entry_path = entry.path();
            if !entry_path.is_file() {
                continue;
            }
            if entry_path.extension().and_then(|e| e.to_str()) != Some(MODULE_EXTENSION) {
                continue;
            }
            if let Some(stem) = entry_path.file_stem().and_then(|s| s.to_str()) {
                found.insert(stem.to_string());
            }
        }
        Ok(found)
    }

    /// Discovered workflows, then interceptors in registration order, then
    /// the interface module last so its imports can link against the rest.
    fn assemble_roster(&self, discovered: &BTreeSet<String>) -> Vec<String> {
        let interface = &self.options.interface_module;
        let mut roster: Vec<String> = discovered
            .iter()
            .filter(|name| *name != interface)
            .cloned()
            .collect();
        for interceptor in &self.options.interceptor_modules {
            if interceptor != interface && !roster.contains(interceptor) {
                roster.push(interceptor.clone());
            }
        }
        roster.push(interface.clone());
        roster
    }

    /// Resolve a roster name through the overlay-then-disk filesystem,
    /// trying the workflows path first and then each dependency root.
    fn resolve_module(
        &self,
        vfs: &VirtualFs,
        name: &str,
    ) -> Result<Option<String>, std::io::Error> {
        let file_name = format!("{name}.{MODULE_EXTENSION}");
        let mut candidates = Vec::with_capacity(1 + self.options.dependency_roots.len());
        candidates.push(self.options.workflows_path.join(&file_name));
        for root in &self.options.dependency_roots {
            candidates.push(root.join(&file_name));
        }
        for candidate in candidates {
            if let Some(source) = vfs.read(&candidate)? {
                return Ok(Some(source));
            }
        }
        Ok(None)
    }
}
