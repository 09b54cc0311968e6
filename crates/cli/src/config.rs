//! Configuration file loading
//!
//! Accepts YAML or JSON with the same keys as the command line. CLI
//! arguments always override config file values.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::validate::parse_spec;
use ptp_lib::InstanceTypeSpec;

/// One instance type entry: either `"c7i.large"` / `"c7i.large:2"` or
/// `{ type: c7i.large, quantity: 2 }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SpecEntry {
    Text(String),
    Detailed {
        #[serde(rename = "type")]
        instance_type: String,
        #[serde(default = "default_quantity")]
        quantity: u32,
    },
}

fn default_quantity() -> u32 {
    1
}

/// Raw config file contents. Every field is optional; the merge with CLI
/// arguments decides what is actually required.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub instance_types: Option<Vec<SpecEntry>>,
    pub subnet_id: Option<String>,
    pub key_name: Option<String>,
    pub private_key_path: Option<PathBuf>,
    pub region: Option<String>,
    pub profile: Option<String>,
    pub ami_id: Option<String>,
    pub security_group_id: Option<String>,
    pub placement_group: Option<String>,
    pub ssh_username: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)
                .with_context(|| format!("invalid JSON in {}", path.display()))?,
            _ => serde_yaml::from_str(&text)
                .with_context(|| format!("invalid YAML in {}", path.display()))?,
        };
        Ok(config)
    }

    /// Resolve the instance type entries into validated specs.
    pub fn specs(&self) -> Result<Option<Vec<InstanceTypeSpec>>> {
        let Some(entries) = &self.instance_types else {
            return Ok(None);
        };

        let mut specs = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                SpecEntry::Text(text) => specs.push(parse_spec(text)?),
                SpecEntry::Detailed {
                    instance_type,
                    quantity,
                } => specs.push(parse_spec(&format!("{instance_type}:{quantity}"))?),
            }
        }
        Ok(Some(specs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(extension: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(&format!(".{extension}"))
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_yaml() {
        let file = write_temp(
            "yaml",
            "instance_types:\n  - c7i.large\n  - type: m7i.xlarge\n    quantity: 2\nsubnet_id: subnet-12345678\nkey_name: my-key\n",
        );
        let config = FileConfig::load(file.path()).unwrap();
        let specs = config.specs().unwrap().unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0], InstanceTypeSpec::new("c7i.large", 1));
        assert_eq!(specs[1], InstanceTypeSpec::new("m7i.xlarge", 2));
        assert_eq!(config.subnet_id.as_deref(), Some("subnet-12345678"));
    }

    #[test]
    fn test_load_json() {
        let file = write_temp(
            "json",
            r#"{"instance_types": ["c7gn.large:2"], "region": "us-east-1"}"#,
        );
        let config = FileConfig::load(file.path()).unwrap();
        let specs = config.specs().unwrap().unwrap();
        assert_eq!(specs[0], InstanceTypeSpec::new("c7gn.large", 2));
        assert_eq!(config.region.as_deref(), Some("us-east-1"));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let file = write_temp("yaml", "subnet: subnet-12345678\n");
        assert!(FileConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_invalid_spec_in_config() {
        let file = write_temp("yaml", "instance_types:\n  - not-a-type\n");
        let config = FileConfig::load(file.path()).unwrap();
        assert!(config.specs().is_err());
    }
}
