//! client configuration
//!
//! INI-style files under `<etc>/config.d/` (sorted) plus a per-user file.
//! `[repository <name>]` and `[bindmounts <name>]` sections are never
//! merged across files: the first file to define one wins. values
//! interpolate `${HOME}` and `${USER}`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::path::{AbsolutePath, RelativePath};

const REPOSITORY_PREFIX: &str = "repository ";
const BINDMOUNTS_PREFIX: &str = "bindmounts ";
const LOCAL_CONFIG_FILE: &str = "config.ini";
const CONFIG_DOT_D: &str = "config.d";
const DEFAULT_HOOKS_DIR: &str = "hooks";

/// merged key/value sections from all configuration files
#[derive(Clone, Debug, Default)]
pub struct ConfigData {
    sections: BTreeMap<String, BTreeMap<String, String>>,
    variables: BTreeMap<String, String>,
}

impl ConfigData {
    pub fn new() -> Self {
        let mut variables = BTreeMap::new();
        variables.insert(
            "HOME".to_string(),
            std::env::var("HOME").unwrap_or_else(|_| "/".to_string()),
        );
        variables.insert(
            "USER".to_string(),
            std::env::var("USER").unwrap_or_default(),
        );
        Self {
            sections: BTreeMap::new(),
            variables,
        }
    }

    /// load the global files: `<etc>/config.d/*` sorted, then the user
    /// file; earlier files win their repository and bindmount sections
    pub fn load(etc_dir: &Path, user_config: &Path) -> Result<ConfigData> {
        let mut files = Vec::new();
        let config_d = etc_dir.join(CONFIG_DOT_D);
        if config_d.is_dir() {
            for entry in fs::read_dir(&config_d).map_err(|source| Error::Io {
                path: config_d.clone(),
                source,
            })? {
                let entry = entry.map_err(|source| Error::Io {
                    path: config_d.clone(),
                    source,
                })?;
                files.push(entry.path());
            }
        }
        files.sort();
        files.push(user_config.to_path_buf());

        let mut data = ConfigData::new();
        for file in &files {
            let contents = match fs::read_to_string(file) {
                Ok(contents) => contents,
                // unreadable files are skipped, like any other absent layer
                Err(_) => continue,
            };
            data.merge_ini(&contents);
        }
        Ok(data)
    }

    /// merge one file's sections into this data
    ///
    /// repository and bindmount sections that already exist are skipped
    /// wholesale; other sections merge key by key.
    pub fn merge_ini(&mut self, contents: &str) {
        for (name, keys) in parse_ini(contents, &self.variables) {
            let protected = name.starts_with(REPOSITORY_PREFIX)
                || name.starts_with(BINDMOUNTS_PREFIX);
            if protected && self.sections.contains_key(&name) {
                continue;
            }
            self.sections.entry(name).or_default().extend(keys);
        }
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }

    pub fn section(&self, name: &str) -> Option<&BTreeMap<String, String>> {
        self.sections.get(name)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|keys| keys.get(key))
            .map(String::as_str)
    }
}

/// minimal INI reader: `[section]` headers and `key = value` lines, with
/// `${VAR}` interpolation; blank lines and `#`/`;` comments are skipped
fn parse_ini(
    contents: &str,
    variables: &BTreeMap<String, String>,
) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    let mut current: Option<String> = None;

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            current = Some(name.trim().to_string());
            sections.entry(name.trim().to_string()).or_default();
            continue;
        }
        if let (Some(section), Some((key, value))) = (&current, line.split_once('=')) {
            sections
                .get_mut(section)
                .expect("section inserted above")
                .insert(
                    key.trim().to_string(),
                    interpolate(value.trim(), variables),
                );
        }
    }
    sections
}

fn interpolate(value: &str, variables: &BTreeMap<String, String>) -> String {
    let mut result = value.to_string();
    for (name, replacement) in variables {
        result = result.replace(&format!("${{{}}}", name), replacement);
    }
    result
}

/// a bind mount declared for a repository
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindMount {
    /// source directory inside the client's bind-mounts scratch space
    pub client_path: PathBuf,
    /// target inside the mount
    pub mount_path: AbsolutePath,
}

/// per-client configuration resolved against the merged config data
#[derive(Clone, Debug)]
pub struct ClientConfig {
    mount_path: AbsolutePath,
    client_dir: PathBuf,
    repo_type: String,
    repo_source: String,
    hooks_path: PathBuf,
    bind_mounts: Vec<BindMount>,
}

impl ClientConfig {
    /// resolve the client's repository from its local config file plus the
    /// merged global data
    pub fn load_from_client_directory(
        mount_path: AbsolutePath,
        client_dir: &Path,
        config: &ConfigData,
        etc_dir: &Path,
    ) -> Result<ClientConfig> {
        let local_path = client_dir.join(LOCAL_CONFIG_FILE);
        let contents = fs::read_to_string(&local_path).map_err(|source| Error::Io {
            path: local_path,
            source,
        })?;
        let local = parse_ini(&contents, &BTreeMap::new());
        let repo_name = local
            .get("repository")
            .and_then(|keys| keys.get("name"))
            .cloned()
            .ok_or_else(|| {
                Error::InvalidArgument("client config names no repository".to_string())
            })?;

        let repo_section = format!("{}{}", REPOSITORY_PREFIX, repo_name);
        let repo = config.section(&repo_section).ok_or_else(|| {
            Error::NotFound(format!("no repository data for {}", repo_name))
        })?;
        let repo_type = repo
            .get("type")
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("{} has no type", repo_section)))?;
        let repo_source = repo
            .get("path")
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("{} has no path", repo_section)))?;
        let hooks_path = repo
            .get("hooks")
            .map(PathBuf::from)
            .unwrap_or_else(|| etc_dir.join(DEFAULT_HOOKS_DIR));

        let mut bind_mounts = Vec::new();
        let bind_section = format!("{}{}", BINDMOUNTS_PREFIX, repo_name);
        if let Some(mounts) = config.section(&bind_section) {
            let scratch = client_dir.join("bind-mounts");
            for (name, target) in mounts {
                let target = RelativePath::new(target.clone())?;
                bind_mounts.push(BindMount {
                    client_path: scratch.join(name),
                    mount_path: mount_path.join(&target),
                });
            }
        }

        Ok(ClientConfig {
            mount_path,
            client_dir: client_dir.to_path_buf(),
            repo_type,
            repo_source,
            hooks_path,
            bind_mounts,
        })
    }

    pub fn mount_path(&self) -> &AbsolutePath {
        &self.mount_path
    }

    pub fn client_dir(&self) -> &Path {
        &self.client_dir
    }

    pub fn repo_type(&self) -> &str {
        &self.repo_type
    }

    pub fn repo_source(&self) -> &str {
        &self.repo_source
    }

    pub fn hooks_path(&self) -> &Path {
        &self.hooks_path
    }

    pub fn bind_mounts(&self) -> &[BindMount] {
        &self.bind_mounts
    }
}
