use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Result, RuntimeError};
use crate::process::{run_with_timeout, RunOutcome};
use crate::provider::ToolDeclaration;

pub const LIST_FUNCTIONS_FLAG: &str = "--list-functions";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One externally invocable function, as described by its executable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema", alias = "jsonSchema")]
    pub parameters: Value,
    /// The executable that provides this function.
    #[serde(skip)]
    pub executable: PathBuf,
}

fn empty_object_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl FunctionDescriptor {
    pub fn to_tool(&self) -> ToolDeclaration {
        ToolDeclaration {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedManifest {
    modified: SystemTime,
    descriptors: Vec<FunctionDescriptor>,
}

/// Discovers function executables and dispatches calls to them.
///
/// Executables are scanned directory by directory in configured order, and
/// by file name within a directory. When two executables declare the same
/// function name the first one scanned wins. Manifests are cached by path and
/// modification time.
#[derive(Debug)]
pub struct FunctionRegistry {
    dirs: Vec<PathBuf>,
    timeout: Duration,
    cache: HashMap<PathBuf, CachedManifest>,
    functions: BTreeMap<String, FunctionDescriptor>,
    /// Function names in precedence order.
    order: Vec<String>,
    manifest_queries: usize,
}

impl FunctionRegistry {
    pub fn new(dirs: Vec<PathBuf>, timeout: Duration) -> Self {
        Self {
            dirs,
            timeout,
            cache: HashMap::new(),
            functions: BTreeMap::new(),
            order: Vec::new(),
            manifest_queries: 0,
        }
    }

    /// A registry with no function directories.
    pub fn empty() -> Self {
        Self::new(Vec::new(), DEFAULT_TIMEOUT)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Rescan the directories, re-querying only executables that changed.
    pub fn refresh(&mut self) -> Result<()> {
        let mut seen: Vec<PathBuf> = Vec::new();
        let mut functions: BTreeMap<String, FunctionDescriptor> = BTreeMap::new();
        let mut order: Vec<String> = Vec::new();

        for path in self.candidates()? {
            let modified = std::fs::metadata(&path)?.modified()?;
            let cached = self
                .cache
                .get(&path)
                .filter(|c| c.modified == modified)
                .map(|c| c.descriptors.clone());
            let descriptors = match cached {
                Some(descriptors) => descriptors,
                None => {
                    let descriptors = match self.query_manifest(&path) {
                        Ok(d) => d,
                        Err(e) => {
                            warn!(executable = %path.display(), error = %e, "skipping function executable");
                            Vec::new()
                        }
                    };
                    self.cache.insert(
                        path.clone(),
                        CachedManifest {
                            modified,
                            descriptors: descriptors.clone(),
                        },
                    );
                    descriptors
                }
            };

            for descriptor in descriptors {
                if let Some(existing) = functions.get(&descriptor.name) {
                    debug!(
                        function = %descriptor.name,
                        kept = %existing.executable.display(),
                        shadowed = %descriptor.executable.display(),
                        "duplicate function name"
                    );
                    continue;
                }
                order.push(descriptor.name.clone());
                functions.insert(descriptor.name.clone(), descriptor);
            }
            seen.push(path);
        }

        self.cache.retain(|path, _| seen.contains(path));
        self.functions = functions;
        self.order = order;
        Ok(())
    }

    /// Executables in precedence order.
    fn candidates(&self) -> Result<Vec<PathBuf>> {
        let mut all = Vec::new();
        for dir in &self.dirs {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let mut in_dir: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| is_candidate(p))
                .collect();
            in_dir.sort();
            all.extend(in_dir);
        }
        Ok(all)
    }

    fn query_manifest(&mut self, path: &Path) -> Result<Vec<FunctionDescriptor>> {
        self.manifest_queries += 1;
        let display = path.display().to_string();
        let outcome = run_with_timeout(path, &[LIST_FUNCTIONS_FLAG], b"", self.timeout)?;
        let output = match outcome {
            RunOutcome::Finished(output) => output,
            RunOutcome::TimedOut => {
                return Err(RuntimeError::FunctionTimeout {
                    name: format!("{} {}", display, LIST_FUNCTIONS_FLAG),
                    seconds: self.timeout.as_secs_f64(),
                })
            }
        };
        if !output.status.success() {
            return Err(RuntimeError::FunctionExecution {
                name: display,
                message: output.stderr.trim().to_string(),
            });
        }
        let mut descriptors: Vec<FunctionDescriptor> = serde_json::from_str(output.stdout.trim())
            .map_err(|e| RuntimeError::FunctionExecution {
                name: display,
                message: format!("invalid function manifest: {}", e),
            })?;
        for descriptor in &mut descriptors {
            descriptor.executable = path.to_path_buf();
        }
        Ok(descriptors)
    }

    /// Number of manifest queries run so far.
    pub fn manifest_queries(&self) -> usize {
        self.manifest_queries
    }

    pub fn get(&self, name: &str) -> Option<&FunctionDescriptor> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Descriptors in precedence order.
    pub fn descriptors(&self) -> impl Iterator<Item = &FunctionDescriptor> {
        self.order.iter().filter_map(|name| self.functions.get(name))
    }

    pub fn tool_declarations(&self) -> Vec<ToolDeclaration> {
        self.descriptors().map(|d| d.to_tool()).collect()
    }

    /// Run `name` with `arguments` written to its stdin.
    ///
    /// Exit status 0 yields the trimmed stdout; anything else is an error
    /// carrying the trimmed stderr.
    pub fn invoke(&self, name: &str, arguments: &Value) -> Result<String> {
        let descriptor = self
            .get(name)
            .ok_or_else(|| RuntimeError::FunctionNotFound(name.to_string()))?;
        validate_arguments(descriptor, arguments)?;

        info!(function = name, executable = %descriptor.executable.display(), "invoking function");
        let input = serde_json::to_vec(arguments)?;
        let outcome = run_with_timeout(&descriptor.executable, &[name], &input, self.timeout)
            .map_err(|e| RuntimeError::FunctionExecution {
                name: name.to_string(),
                message: format!("failed to start {}: {}", descriptor.executable.display(), e),
            })?;

        match outcome {
            RunOutcome::TimedOut => Err(RuntimeError::FunctionTimeout {
                name: name.to_string(),
                seconds: self.timeout.as_secs_f64(),
            }),
            RunOutcome::Finished(output) if output.status.success() => {
                Ok(output.stdout.trim().to_string())
            }
            RunOutcome::Finished(output) => {
                let stderr = output.stderr.trim();
                let message = if stderr.is_empty() {
                    format!("exited with {}", output.status)
                } else {
                    stderr.to_string()
                };
                Err(RuntimeError::FunctionExecution {
                    name: name.to_string(),
                    message,
                })
            }
        }
    }
}

fn validate_arguments(descriptor: &FunctionDescriptor, arguments: &Value) -> Result<()> {
    let validator = jsonschema::validator_for(&descriptor.parameters).map_err(|e| {
        RuntimeError::FunctionExecution {
            name: descriptor.name.clone(),
            message: format!("invalid parameter schema: {}", e),
        }
    })?;
    let errors: Vec<String> = validator
        .iter_errors(arguments)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(RuntimeError::FunctionExecution {
            name: descriptor.name.clone(),
            message: format!("invalid arguments: {}", errors.join("; ")),
        })
    }
}

fn is_candidate(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') || name.ends_with(".json") || name.ends_with(".backup") {
        return false;
    }
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    metadata.is_file() && is_executable(&metadata)
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, file: &str, body: &str) -> PathBuf {
        let path = dir.join(file);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn provider_script(manifest: &str, call: &str) -> String {
        format!(
            "if [ \"$1\" = \"--list-functions\" ]; then\n  echo '{}'\n  exit 0\nfi\n{}",
            manifest, call
        )
    }

    #[test]
    fn discovery_and_invoke() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "tools",
            &provider_script(
                r#"[{"name": "echo_args", "description": "Echo stdin", "parameters": {"type": "object"}}]"#,
                "cat",
            ),
        );
        let mut registry = FunctionRegistry::new(vec![dir.path().to_path_buf()], Duration::from_secs(5));
        registry.refresh().unwrap();

        let descriptor = registry.get("echo_args").unwrap();
        assert_eq!(descriptor.description, "Echo stdin");
        assert_eq!(descriptor.executable, dir.path().join("tools"));
        let out = registry.invoke("echo_args", &json!({"x": 1})).unwrap();
        assert_eq!(out, "{\"x\":1}");
    }

    #[test]
    fn non_executables_and_json_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        write_script(dir.path(), "functions.json", "echo '[]'");
        let mut registry = FunctionRegistry::new(vec![dir.path().to_path_buf()], Duration::from_secs(5));
        registry.refresh().unwrap();
        assert_eq!(registry.descriptors().count(), 0);
        assert_eq!(registry.manifest_queries(), 0);
    }

    #[test]
    fn nonzero_exit_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "failing",
            &provider_script(r#"[{"name": "fail"}]"#, "echo 'bad input' >&2\nexit 2"),
        );
        let mut registry = FunctionRegistry::new(vec![dir.path().to_path_buf()], Duration::from_secs(5));
        registry.refresh().unwrap();
        let err = registry.invoke("fail", &json!({})).unwrap_err();
        match err {
            RuntimeError::FunctionExecution { name, message } => {
                assert_eq!(name, "fail");
                assert_eq!(message, "bad input");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn schema_violation_is_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "typed",
            &provider_script(
                r#"[{"name": "typed", "jsonSchema": {"type": "object", "required": ["city"]}}]"#,
                "echo ok",
            ),
        );
        let mut registry = FunctionRegistry::new(vec![dir.path().to_path_buf()], Duration::from_secs(5));
        registry.refresh().unwrap();
        let err = registry.invoke("typed", &json!({})).unwrap_err();
        assert!(err.to_string().contains("invalid arguments"));
        assert_eq!(registry.invoke("typed", &json!({"city": "Oslo"})).unwrap(), "ok");
    }

    #[test]
    fn manifest_cache_keyed_by_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(
            dir.path(),
            "tools",
            &provider_script(r#"[{"name": "one"}]"#, "echo 1"),
        );
        let mut registry = FunctionRegistry::new(vec![dir.path().to_path_buf()], Duration::from_secs(5));
        registry.refresh().unwrap();
        registry.refresh().unwrap();
        assert_eq!(registry.manifest_queries(), 1);

        write_script(dir.path(), "tools", &provider_script(r#"[{"name": "two"}]"#, "echo 2"));
        let later = SystemTime::now() + Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(later)
            .unwrap();
        registry.refresh().unwrap();
        assert_eq!(registry.manifest_queries(), 2);
        assert!(registry.contains("two"));
        assert!(!registry.contains("one"));
    }

    #[test]
    fn broken_manifest_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "broken", "echo 'not json'");
        let mut registry = FunctionRegistry::new(vec![dir.path().to_path_buf()], Duration::from_secs(5));
        registry.refresh().unwrap();
        assert_eq!(registry.descriptors().count(), 0);
    }

    #[test]
    fn unknown_function_is_not_found() {
        let registry = FunctionRegistry::empty();
        assert!(matches!(
            registry.invoke("ghost", &json!({})),
            Err(RuntimeError::FunctionNotFound(_))
        ));
    }
}
