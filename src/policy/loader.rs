use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::policy::condition::parse_condition;
use crate::policy::document::parse_kdl_document;
use crate::policy::errors::LoadError;
use crate::policy::types::*;
use crate::policy::CompiledPolicy;

/// Name of the data documents picked up from bundles.
pub const DATA_FILE: &str = "data.json";

/// Resolve a policy reference into a compiled policy. Every module is read,
/// parsed and compiled here so configuration mistakes surface at startup.
pub fn load(reference: &PolicyReference) -> Result<CompiledPolicy, LoadError> {
    let policy = match reference {
        PolicyReference::Inline(source) => {
            let module = parse_kdl_document(source, "<inline>")?;
            compile_modules(vec![module], empty_data())?
        }
        PolicyReference::File(path) => {
            let module = read_module(path)?;
            compile_modules(vec![module], empty_data())?
        }
        PolicyReference::Bundle(dir) => load_bundle(dir)?,
    };

    tracing::info!(
        kind = reference.kind(),
        modules = policy.module_count,
        packages = policy.packages.len(),
        rules = policy.rule_count(),
        "Loaded policy"
    );

    Ok(policy)
}

/// Load every `.kdl` module and `data.json` document below `dir` into one
/// compiled policy. Any unreadable or malformed member fails the whole load.
pub fn load_bundle(dir: &Path) -> Result<CompiledPolicy, LoadError> {
    if !dir.is_dir() {
        return Err(LoadError::BundleNotFound(dir.display().to_string()));
    }

    let mut files = Vec::new();
    collect_files(dir, &mut files, &mut HashSet::new())?;
    files.sort();

    let mut modules = Vec::new();
    let mut data = empty_data();

    for path in files {
        if path.extension().map(|ext| ext == "kdl").unwrap_or(false) {
            modules.push(read_module(&path)?);
        } else if path.file_name().map(|n| n == DATA_FILE).unwrap_or(false) {
            let prefix = data_prefix(dir, &path);
            let doc = read_data(&path)?;
            merge_data(&mut data, &prefix, doc, &path.display().to_string())?;
        }
    }

    if modules.is_empty() {
        return Err(LoadError::EmptyBundle(dir.display().to_string()));
    }

    compile_modules(modules, data)
}

/// Merge and compile parsed modules into a single `CompiledPolicy`.
/// Modules sharing a package contribute bodies to the same rules.
pub fn compile_modules(
    modules: Vec<ParsedModule>,
    data: Value,
) -> Result<CompiledPolicy, LoadError> {
    let module_count = modules.len();
    let mut packages: HashMap<String, HashMap<String, CompiledRule>> = HashMap::new();

    for module in modules {
        let rules = packages.entry(module.package.clone()).or_default();

        for rule in module.rules {
            let body = rule
                .conditions
                .iter()
                .map(|cond| {
                    parse_condition(cond).map_err(|source| LoadError::Condition {
                        origin: module.origin.clone(),
                        rule: rule.name.clone(),
                        source,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            rules.entry(rule.name).or_default().bodies.push(body);
        }

        for name in module.defaults {
            let compiled = rules.entry(name.clone()).or_default();
            if compiled.default.is_some() {
                return Err(LoadError::DuplicateDefault {
                    package: module.package.clone(),
                    rule: name,
                });
            }
            compiled.default = Some(false);
        }
    }

    Ok(CompiledPolicy {
        packages,
        data,
        module_count,
    })
}

fn empty_data() -> Value {
    Value::Object(Map::new())
}

fn read_module(path: &Path) -> Result<ParsedModule, LoadError> {
    let contents = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_kdl_document(&contents, &path.display().to_string())
}

fn read_data(path: &Path) -> Result<Value, LoadError> {
    let contents = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let doc: Map<String, Value> =
        serde_json::from_str(&contents).map_err(|source| LoadError::InvalidData {
            path: path.display().to_string(),
            source,
        })?;
    Ok(Value::Object(doc))
}

/// Recursively collect files, following symlinks. Each directory is visited
/// once by canonical path, so symlink cycles terminate.
fn collect_files(
    dir: &Path,
    out: &mut Vec<PathBuf>,
    visited: &mut HashSet<PathBuf>,
) -> Result<(), LoadError> {
    let canonical = dir.canonicalize().map_err(read_error(dir))?;
    if !visited.insert(canonical) {
        return Ok(());
    }

    for entry in std::fs::read_dir(dir).map_err(read_error(dir))? {
        let path = entry.map_err(read_error(dir))?.path();
        // A dangling link fails here instead of being skipped.
        let meta = std::fs::metadata(&path).map_err(read_error(&path))?;
        if meta.is_dir() {
            collect_files(&path, out, visited)?;
        } else if meta.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

fn read_error(path: &Path) -> impl FnOnce(std::io::Error) -> LoadError {
    let path = path.display().to_string();
    move |source| LoadError::Read { path, source }
}

/// `bundle/a/b/data.json` is mounted at `data.a.b`.
fn data_prefix(root: &Path, data_file: &Path) -> Vec<String> {
    data_file
        .parent()
        .and_then(|parent| parent.strip_prefix(root).ok())
        .map(|rel| {
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

fn merge_data(
    data: &mut Value,
    prefix: &[String],
    doc: Value,
    origin: &str,
) -> Result<(), LoadError> {
    let conflict = |key: &str| LoadError::DataConflict {
        path: origin.to_string(),
        key: key.to_string(),
    };

    let mut target = data;
    for (depth, seg) in prefix.iter().enumerate() {
        let Value::Object(map) = target else {
            return Err(conflict(&prefix[..depth].join(".")));
        };
        target = map
            .entry(seg.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !target.is_object() {
        return Err(conflict(&prefix.join(".")));
    }

    deep_merge(target, doc, &mut prefix.to_vec()).map_err(|key| conflict(&key))
}

/// Merge `incoming` into `target`; on a non-object collision returns the
/// dotted key where it happened.
fn deep_merge(target: &mut Value, incoming: Value, path: &mut Vec<String>) -> Result<(), String> {
    let (Value::Object(dst), Value::Object(src)) = (target, incoming) else {
        return Err(path.join("."));
    };
    for (key, value) in src {
        path.push(key.clone());
        match dst.get_mut(&key) {
            None => {
                dst.insert(key, value);
            }
            Some(existing) if existing.is_object() && value.is_object() => {
                deep_merge(existing, value, path)?;
            }
            Some(_) => return Err(path.join(".")),
        }
        path.pop();
    }
    Ok(())
}
