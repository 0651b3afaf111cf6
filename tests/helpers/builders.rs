use std::fs;
use std::path::{Path, PathBuf};

use portcullis::gate::config::GateConfig;
use portcullis::gate::enforcer::PolicyGate;
use portcullis::gate::input::IdentityStrategy;
use portcullis::policy::types::PolicyReference;
use tempfile::TempDir;

/// Admits GET only.
pub const GET_ONLY: &str = r#"
package "system.authz"
rule "allow" {
    condition "input.method == \"GET\""
}
"#;

/// Builder for gate configurations used in tests
pub struct GateBuilder {
    config: GateConfig,
}

impl GateBuilder {
    pub fn inline(source: &str) -> Self {
        Self {
            config: GateConfig::new(PolicyReference::Inline(source.to_string())),
        }
    }

    pub fn reference(reference: PolicyReference) -> Self {
        Self {
            config: GateConfig::new(reference),
        }
    }

    pub fn with_identity(mut self, identity: IdentityStrategy) -> Self {
        self.config.identity = identity;
        self
    }

    pub fn with_query(mut self, query: &str) -> Self {
        self.config.query = query.to_string();
        self
    }

    pub fn config(self) -> GateConfig {
        self.config
    }

    pub fn provision(self) -> PolicyGate {
        PolicyGate::provision(&self.config).expect("Failed to provision gate")
    }
}

/// Builder for on-disk policy bundles
pub struct BundleBuilder {
    dir: TempDir,
}

impl BundleBuilder {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn file(self, relative: &str, contents: &str) -> Self {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create bundle dir");
        }
        fs::write(&path, contents).expect("Failed to write bundle file");
        self
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn reference(&self) -> PolicyReference {
        PolicyReference::Bundle(PathBuf::from(self.dir.path()))
    }
}
