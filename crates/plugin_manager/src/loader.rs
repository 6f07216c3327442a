use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::debug;

use crate::{LoadErrorReporter, PluginError, PluginRecord, ScriptLoader};

/// Sources of scripts that loaded, keyed by URL.
#[derive(Debug, Clone, Default)]
pub struct ScriptRegistry {
    sources: Rc<RefCell<BTreeMap<String, String>>>,
}

impl ScriptRegistry {
    pub fn insert(&self, url: &str, source: String) {
        self.sources.borrow_mut().insert(url.to_owned(), source);
    }

    pub fn source(&self, url: &str) -> Option<String> {
        self.sources.borrow().get(url).cloned()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.sources.borrow().contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.sources.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.borrow().is_empty()
    }

    pub fn urls(&self) -> Vec<String> {
        self.sources.borrow().keys().cloned().collect()
    }
}

/// Resolves script URLs against a directory on disk.
#[derive(Debug)]
pub struct FsScriptLoader {
    root: PathBuf,
    registry: ScriptRegistry,
}

impl FsScriptLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            registry: ScriptRegistry::default(),
        }
    }

    pub fn registry(&self) -> ScriptRegistry {
        self.registry.clone()
    }
}

impl ScriptLoader for FsScriptLoader {
    fn load_script(&mut self, url: &str, errors: &LoadErrorReporter) {
        let path = self.root.join(url);
        match fs::read_to_string(&path) {
            Ok(source) => {
                debug!(target: "plugin", url, bytes = source.len(), "script loaded");
                self.registry.insert(url, source);
            }
            Err(error) => {
                debug!(target: "plugin", url, path = %path.display(), %error, "script read failed");
                errors.report(url);
            }
        }
    }
}

/// Read and parse a plugin list file.
pub fn load_plugin_list(path: &Path) -> Result<Vec<PluginRecord>, PluginError> {
    let source = fs::read_to_string(path).map_err(|source| PluginError::Io {
        path: path.display().to_string(),
        source,
    })?;
    PluginRecord::parse_list(&source)
}
