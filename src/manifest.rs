//! Build manifest (`qnxtainer.yml`).
//!
//! ```yaml
//! name: demo:v1          # optional, generated when absent
//! tag: v2                # optional, overrides the tag embedded in name
//! build: make release    # required, run with `sh -c` in the build workspace
//! cmd: ./bin/app --serve # required, last line of the generated run.sh
//! env:                   # optional
//!   DATA_DIR: /data
//!   WORKERS: 4
//! mounts:                # optional, "source:destination"
//!   - ../shared/config.json:config.json
//! ```

use crate::constants::{GENERATED_NAME_PREFIX, MANIFEST_FILE};
use crate::error::{Error, Result};
use crate::image::ImageReference;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Parsed build manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    /// Image name, optionally with an embedded `:tag`.
    #[serde(default)]
    pub name: Option<String>,
    /// Explicit tag; takes precedence over a tag embedded in `name`.
    #[serde(default)]
    pub tag: Option<String>,
    /// Build command line.
    #[serde(deserialize_with = "deserialize_scalar")]
    pub build: String,
    /// Run command line.
    #[serde(deserialize_with = "deserialize_scalar")]
    pub cmd: String,
    /// Environment for the run command. Scalar values are stringified.
    #[serde(default, deserialize_with = "deserialize_env")]
    pub env: BTreeMap<String, String>,
    /// Ordered `source:destination` pairs copied into the workspace.
    #[serde(default)]
    pub mounts: Vec<String>,
}

/// One parsed `source:destination` mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Source path as written (resolved against the context directory).
    pub source: PathBuf,
    /// Destination relative to the workspace root.
    pub destination: PathBuf,
}

impl Manifest {
    /// Loads `qnxtainer.yml` from a build context directory.
    pub fn load(context_dir: &Path) -> Result<Self> {
        let path = context_dir.join(MANIFEST_FILE);
        let text = fs::read_to_string(&path).map_err(|e| Error::InvalidManifest {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Self::parse(&text, &path)
    }

    /// Parses and validates manifest text. `path` is used in error messages.
    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let manifest: Manifest = serde_yaml::from_str(text).map_err(|e| Error::InvalidManifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        manifest.validate(path)?;
        Ok(manifest)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let invalid = |reason: String| Error::InvalidManifest {
            path: path.to_path_buf(),
            reason,
        };

        if self.build.trim().is_empty() {
            return Err(invalid("'build' must not be empty".to_string()));
        }
        if self.cmd.trim().is_empty() {
            return Err(invalid("'cmd' must not be empty".to_string()));
        }
        if let Some(key) = self.env.keys().find(|k| !is_shell_identifier(k)) {
            return Err(invalid(format!("env key '{}' is not a valid variable name", key)));
        }
        for raw in &self.mounts {
            parse_mount(raw).map_err(invalid)?;
        }
        Ok(())
    }

    /// Returns the image name, generating a readable one when absent.
    pub fn name_or_generated(&self) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => generate_name(),
        }
    }

    /// Resolves the image reference this manifest builds.
    ///
    /// The `tag` field wins over a tag embedded in `name`; with neither the
    /// tag is `latest`.
    pub fn reference(&self) -> Result<ImageReference> {
        ImageReference::parse(&self.name_or_generated(), self.tag.as_deref())
    }

    /// Returns the parsed mounts in declaration order.
    pub fn parsed_mounts(&self) -> Vec<Mount> {
        // validate() already rejected malformed entries
        self.mounts.iter().filter_map(|m| parse_mount(m).ok()).collect()
    }

    /// Renders the `.env` file: `KEY=VALUE` per line, keys sorted.
    pub fn env_file(&self) -> String {
        self.env
            .iter()
            .map(|(k, v)| format!("{}={}\n", k, v))
            .collect()
    }
}

/// Parses a `source:destination` mount entry.
fn parse_mount(raw: &str) -> std::result::Result<Mount, String> {
    let (source, destination) = raw
        .split_once(':')
        .ok_or_else(|| format!("mount '{}' is not of the form source:destination", raw))?;

    if source.is_empty() || destination.is_empty() {
        return Err(format!("mount '{}' has an empty source or destination", raw));
    }

    let destination = PathBuf::from(destination);
    if destination
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(format!(
            "mount destination '{}' must be a relative path inside the image",
            destination.display()
        ));
    }

    Ok(Mount {
        source: PathBuf::from(source),
        destination,
    })
}

fn is_shell_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn scalar_to_string(value: serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Null => Some(String::new()),
        _ => None,
    }
}

/// Accepts `build: true` as well as `build: "true"`.
fn deserialize_scalar<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    let value = serde_yaml::Value::deserialize(deserializer)?;
    scalar_to_string(value).ok_or_else(|| D::Error::custom("expected a command line string"))
}

/// Accepts string, number and boolean values; rejects nested structures.
fn deserialize_env<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    let raw: Option<BTreeMap<String, serde_yaml::Value>> = Option::deserialize(deserializer)?;
    let mut env = BTreeMap::new();
    for (key, value) in raw.unwrap_or_default() {
        let value = scalar_to_string(value)
            .ok_or_else(|| D::Error::custom(format!("env value for '{}' must be a scalar", key)))?;
        env.insert(key, value);
    }
    Ok(env)
}

// =============================================================================
// Generated Names
// =============================================================================

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "dusty", "eager", "frosty", "gentle", "hollow", "idle", "jolly",
    "keen", "lucky", "mellow", "nimble", "quiet", "rapid", "sunny", "tidy", "vivid", "witty",
];

const NOUNS: &[&str] = &[
    "anchor", "badger", "canyon", "dune", "ember", "falcon", "glacier", "harbor", "island",
    "juniper", "kestrel", "lagoon", "meadow", "nebula", "orchard", "pebble", "quarry", "river",
    "summit", "tundra",
];

/// Generates `qnxtainer-<adjective>-<noun>`.
pub fn generate_name() -> String {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    let adjective = ADJECTIVES[bytes[0] as usize % ADJECTIVES.len()];
    let noun = NOUNS[bytes[1] as usize % NOUNS.len()];
    format!("{}-{}-{}", GENERATED_NAME_PREFIX, adjective, noun)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Manifest> {
        Manifest::parse(text, Path::new("qnxtainer.yml"))
    }

    #[test]
    fn test_parse_full_manifest() {
        let manifest = parse(
            r#"
name: demo:v1
build: make
cmd: ./app
env:
  FOO: bar
  WORKERS: 4
  DEBUG: true
mounts:
  - ../shared:config
"#,
        )
        .unwrap();

        assert_eq!(manifest.name.as_deref(), Some("demo:v1"));
        assert_eq!(manifest.env["WORKERS"], "4");
        assert_eq!(manifest.env["DEBUG"], "true");
        assert_eq!(
            manifest.parsed_mounts(),
            vec![Mount {
                source: PathBuf::from("../shared"),
                destination: PathBuf::from("config"),
            }]
        );
    }

    #[test]
    fn test_tag_field_overrides_embedded_tag() {
        let manifest = parse("name: demo:v1\ntag: v2\nbuild: make\ncmd: ./app\n").unwrap();
        assert_eq!(manifest.reference().unwrap().alias(), "demo:v2");

        let manifest = parse("name: demo:v1\nbuild: make\ncmd: ./app\n").unwrap();
        assert_eq!(manifest.reference().unwrap().alias(), "demo:v1");
    }

    #[test]
    fn test_missing_required_fields() {
        assert!(parse("cmd: ./app\n").is_err());
        assert!(parse("build: make\n").is_err());
        assert!(parse("build: ''\ncmd: ./app\n").is_err());
    }

    #[test]
    fn test_unquoted_boolean_command() {
        let manifest = parse("build: true\ncmd: echo hi\n").unwrap();
        assert_eq!(manifest.build, "true");
    }

    #[test]
    fn test_env_file_sorted() {
        let manifest = parse("build: 'true'\ncmd: x\nenv:\n  B: 2\n  A: 1\n").unwrap();
        assert_eq!(manifest.env_file(), "A=1\nB=2\n");
    }

    #[test]
    fn test_rejects_bad_env_key() {
        assert!(parse("build: 'true'\ncmd: x\nenv:\n  '1BAD': x\n").is_err());
        assert!(parse("build: 'true'\ncmd: x\nenv:\n  'A-B': x\n").is_err());
    }

    #[test]
    fn test_rejects_escaping_mount() {
        assert!(parse("build: 'true'\ncmd: x\nmounts: ['a:../b']\n").is_err());
        assert!(parse("build: 'true'\ncmd: x\nmounts: ['a:/etc/b']\n").is_err());
        assert!(parse("build: 'true'\ncmd: x\nmounts: ['nodest']\n").is_err());
    }

    #[test]
    fn test_generated_name() {
        let name = generate_name();
        assert!(name.starts_with("qnxtainer-"));
        assert_eq!(name.split('-').count(), 3);
    }
}
