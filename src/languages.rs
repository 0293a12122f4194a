//! Language configuration for compilation and execution

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::compiler::CompilerBackend;

/// How a compiled program is launched inside the sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Runtime {
    /// Native executable run directly in a chroot jail
    Native,
    /// Bytecode run by a language VM under a security policy
    Managed,
}

/// Configuration for a supported programming language
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageConfig {
    pub name: String,
    /// Source file extension that selects this language (e.g., "cpp")
    pub extension: String,
    /// Name the source is copied to before compiling (e.g., "main.cpp")
    pub source_file: String,
    pub compiler: CompilerBackend,
    pub flags: Vec<String>,
    pub runtime: Runtime,
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    extension: String,
    source_file: String,
    compiler: CompilerBackend,
    #[serde(default)]
    flags: Vec<String>,
    runtime: Runtime,
}

/// Languages keyed by source extension
#[derive(Debug, Clone)]
pub struct LanguageTable {
    by_extension: HashMap<String, LanguageConfig>,
}

impl LanguageTable {
    /// The table shipped in `files/languages.toml`
    pub fn builtin() -> anyhow::Result<Self> {
        Self::from_toml(include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml")))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let raw_configs: HashMap<String, RawLanguageConfig> =
            toml::from_str(content).context("Invalid language table")?;

        let mut by_extension = HashMap::new();
        for (name, raw) in raw_configs {
            let config = LanguageConfig {
                name: name.to_lowercase(),
                extension: raw.extension.trim_start_matches('.').to_string(),
                source_file: raw.source_file,
                compiler: raw.compiler,
                flags: raw.flags,
                runtime: raw.runtime,
            };
            if let Some(previous) = by_extension.insert(config.extension.clone(), config) {
                anyhow::bail!(
                    "Extension .{} is claimed by more than one language ({})",
                    previous.extension,
                    previous.name
                );
            }
        }

        Ok(Self { by_extension })
    }

    /// Language implied by a source file's extension
    pub fn for_source(&self, source: &Path) -> Option<&LanguageConfig> {
        let extension = source.extension()?.to_str()?;
        self.by_extension.get(extension)
    }

    /// Language by name
    pub fn get(&self, name: &str) -> Option<&LanguageConfig> {
        let name = name.to_lowercase();
        self.by_extension.values().find(|config| config.name == name)
    }

    /// All supported language names
    pub fn supported_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_extension.values().map(|c| c.name.clone()).collect();
        names.sort();
        names
    }
}
