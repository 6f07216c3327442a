//! Plugin list setup, per-plugin parameters and deferred load-error reporting.

mod loader;

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smol_str::SmolStr;
use tracing::{debug, error, info};

pub use loader::{FsScriptLoader, ScriptRegistry, load_plugin_list};

pub const DEFAULT_PLUGIN_PATH: &str = "js/plugins";

pub type PluginParameters = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRecord {
    pub name: SmolStr,
    #[serde(rename = "status")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub parameters: PluginParameters,
}

impl PluginRecord {
    pub fn new(name: impl Into<SmolStr>, enabled: bool) -> Self {
        Self {
            name: name.into(),
            enabled,
            description: String::new(),
            parameters: PluginParameters::new(),
        }
    }

    pub fn with_parameter(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_owned(), value.into());
        self
    }

    /// Parse a plugin list. Accepts a bare JSON array or the
    /// `var $plugins = [...];` script form.
    pub fn parse_list(source: &str) -> Result<Vec<PluginRecord>, PluginError> {
        let array = list_literal(source).ok_or(PluginError::MissingList)?;
        serde_json::from_str(array).map_err(PluginError::Parse)
    }
}

/// The array assigned to `$plugins`, or the whole source when it is a bare array.
fn list_literal(source: &str) -> Option<&str> {
    let assigned = source
        .match_indices("$plugins")
        .find_map(|(at, name)| source[at + name.len()..].trim_start().strip_prefix('='));
    let rest = assigned.unwrap_or(source).trim_start();
    if !rest.starts_with('[') {
        return None;
    }
    closing_bracket(rest).map(|end| &rest[..=end])
}

/// Index of the `]` closing the array `text` starts with. Brackets inside
/// JSON strings do not count.
fn closing_bracket(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (index, byte) in text.bytes().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(index);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Failed to load: {url}")]
    FailedToLoad { url: String },
    #[error("plugin list does not contain a JSON array")]
    MissingList,
    #[error("malformed plugin list: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("read plugin file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Thread-safe sink for script URLs that failed to load.
#[derive(Debug, Clone, Default)]
pub struct LoadErrorReporter {
    queue: Arc<SegQueue<String>>,
}

impl LoadErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, url: &str) {
        error!(target: "plugin", url, "script failed to load");
        self.queue.push(url.to_owned());
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn take_one(&self) -> Option<String> {
        self.queue.pop()
    }
}

/// Issues script loads. Failures, immediate or later, go to `errors`.
pub trait ScriptLoader {
    fn load_script(&mut self, url: &str, errors: &LoadErrorReporter);
}

pub struct PluginManager {
    base_path: String,
    loader: Box<dyn ScriptLoader>,
    scripts: Vec<SmolStr>,
    parameters: HashMap<String, PluginParameters>,
    errors: LoadErrorReporter,
    empty: PluginParameters,
}

impl PluginManager {
    pub fn new(base_path: impl Into<String>, loader: Box<dyn ScriptLoader>) -> Self {
        Self {
            base_path: base_path.into(),
            loader,
            scripts: Vec::new(),
            parameters: HashMap::new(),
            errors: LoadErrorReporter::new(),
            empty: PluginParameters::new(),
        }
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn error_reporter(&self) -> LoadErrorReporter {
        self.errors.clone()
    }

    /// Load every enabled plugin not loaded before, in list order.
    /// Returns how many loads were issued.
    pub fn setup(&mut self, records: &[PluginRecord]) -> usize {
        let mut issued = 0;
        for record in records {
            if !record.enabled {
                debug!(target: "plugin", name = %record.name, "skipping disabled plugin");
                continue;
            }
            if self.is_loaded(&record.name) {
                debug!(target: "plugin", name = %record.name, "plugin already loaded");
                continue;
            }
            self.set_parameters(&record.name, record.parameters.clone());
            let url = self.script_url(&record.name);
            info!(target: "plugin", name = %record.name, %url, "loading plugin");
            self.loader.load_script(&url, &self.errors);
            self.scripts.push(record.name.clone());
            issued += 1;
        }
        issued
    }

    pub fn script_url(&self, name: &str) -> String {
        let base = self.base_path.trim_end_matches('/');
        if base.is_empty() {
            format!("{name}.js")
        } else {
            format!("{base}/{name}.js")
        }
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.scripts.iter().any(|script| script == name)
    }

    pub fn loaded_scripts(&self) -> &[SmolStr] {
        &self.scripts
    }

    /// Parameters by plugin name, ignoring case. Empty when never configured.
    pub fn parameters(&self, name: &str) -> &PluginParameters {
        self.parameters
            .get(&name.to_lowercase())
            .unwrap_or(&self.empty)
    }

    pub fn set_parameters(&mut self, name: &str, parameters: PluginParameters) {
        self.parameters.insert(name.to_lowercase(), parameters);
    }

    /// Surface at most one queued load failure.
    pub fn check_errors(&self) -> Result<(), PluginError> {
        match self.errors.take_one() {
            Some(url) => Err(PluginError::FailedToLoad { url }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::thread;

    use serde_json::json;

    use super::*;

    #[derive(Clone, Default)]
    struct RecordingLoader {
        urls: Rc<RefCell<Vec<String>>>,
        failing: Vec<&'static str>,
    }

    impl ScriptLoader for RecordingLoader {
        fn load_script(&mut self, url: &str, errors: &LoadErrorReporter) {
            self.urls.borrow_mut().push(url.to_owned());
            if self.failing.iter().any(|failing| url.ends_with(failing)) {
                errors.report(url);
            }
        }
    }

    fn manager_with(loader: RecordingLoader) -> PluginManager {
        PluginManager::new(DEFAULT_PLUGIN_PATH, Box::new(loader))
    }

    #[test]
    fn setup_loads_enabled_plugins_once_in_order() {
        let loader = RecordingLoader::default();
        let urls = loader.urls.clone();
        let mut manager = manager_with(loader);

        let records = vec![
            PluginRecord::new("Community_Basic", true),
            PluginRecord::new("Disabled", false),
            PluginRecord::new("MadeWithMv", true),
            PluginRecord::new("Community_Basic", true),
        ];
        assert_eq!(manager.setup(&records), 2);
        assert_eq!(manager.setup(&records), 0);

        assert_eq!(
            *urls.borrow(),
            vec!["js/plugins/Community_Basic.js", "js/plugins/MadeWithMv.js"]
        );
        assert_eq!(manager.loaded_scripts(), ["Community_Basic", "MadeWithMv"]);
    }

    #[test]
    fn repeated_setup_loads_once_and_keeps_parameters() {
        let loader = RecordingLoader::default();
        let urls = loader.urls.clone();
        let mut manager = manager_with(loader);
        let records = [PluginRecord::new("Foo", true).with_parameter("a", 1)];

        assert_eq!(manager.setup(&records), 1);
        assert_eq!(Value::Object(manager.parameters("foo").clone()), json!({ "a": 1 }));
        assert_eq!(manager.setup(&records), 0);
        assert_eq!(Value::Object(manager.parameters("foo").clone()), json!({ "a": 1 }));
        assert_eq!(*urls.borrow(), vec!["js/plugins/Foo.js"]);
    }

    #[test]
    fn parameters_are_case_insensitive_and_default_empty() {
        let mut manager = manager_with(RecordingLoader::default());
        manager.setup(&[PluginRecord::new("Community_Basic", true).with_parameter("screenWidth", "816")]);

        assert_eq!(
            manager.parameters("community_basic").get("screenWidth"),
            Some(&json!("816"))
        );
        assert_eq!(manager.parameters("COMMUNITY_BASIC").len(), 1);
        assert!(manager.parameters("Unknown").is_empty());
    }

    #[test]
    fn check_errors_surfaces_one_url_per_call() {
        let loader = RecordingLoader {
            failing: vec!["A.js", "B.js"],
            ..RecordingLoader::default()
        };
        let mut manager = manager_with(loader);
        manager.setup(&[
            PluginRecord::new("A", true),
            PluginRecord::new("B", true),
            PluginRecord::new("C", true),
        ]);

        let first = manager.check_errors().err().map(|error| error.to_string());
        assert_eq!(first.as_deref(), Some("Failed to load: js/plugins/A.js"));
        let second = manager.check_errors().err().map(|error| error.to_string());
        assert_eq!(second.as_deref(), Some("Failed to load: js/plugins/B.js"));
        assert!(manager.check_errors().is_ok());
    }

    #[test]
    fn reporter_accepts_failures_from_other_threads() {
        let manager = manager_with(RecordingLoader::default());
        let reporter = manager.error_reporter();
        thread::spawn(move || reporter.report("js/plugins/Late.js"))
            .join()
            .unwrap_or_else(|_| panic!("reporter thread panicked"));
        assert!(matches!(
            manager.check_errors(),
            Err(PluginError::FailedToLoad { url }) if url == "js/plugins/Late.js"
        ));
    }

    #[test]
    fn parse_list_reads_script_form() {
        let source = r#"// Generated by the editor.
var $plugins =
[
{"name":"Community_Basic","status":true,"description":"Basic plugin","parameters":{"cacheLimit":"20"}},
{"name":"MadeWithMv","status":false,"description":"","parameters":{}}
];
"#;
        let records = PluginRecord::parse_list(source)
            .unwrap_or_else(|error| panic!("parse plugin list: {error}"));
        assert_eq!(records.len(), 2);
        assert!(records[0].enabled);
        assert_eq!(records[0].parameters.get("cacheLimit"), Some(&json!("20")));
        assert!(!records[1].enabled);

        assert!(matches!(
            PluginRecord::parse_list("var $plugins = null;"),
            Err(PluginError::MissingList)
        ));
    }

    #[test]
    fn parse_list_starts_at_the_assignment() {
        let source = r#"// Plugins [v1.2] for the $plugins list. Edit with care [!]
var $plugins =
[
{"name":"Bracketed","status":true,"description":"keeps [tags] and \"]\"","parameters":{"tags":"[a]"}}
];
// trailing note ]
"#;
        let records = PluginRecord::parse_list(source)
            .unwrap_or_else(|error| panic!("parse plugin list: {error}"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "Bracketed");
        assert_eq!(records[0].description, "keeps [tags] and \"]\"");
        assert_eq!(records[0].parameters.get("tags"), Some(&json!("[a]")));

        let bare = PluginRecord::parse_list(r#"  [{"name":"A","status":false}]  "#)
            .unwrap_or_else(|error| panic!("parse bare list: {error}"));
        assert_eq!(bare, vec![PluginRecord::new("A", false)]);
    }

    #[test]
    fn script_url_tolerates_trailing_slash() {
        let manager = PluginManager::new("js/plugins/", Box::new(RecordingLoader::default()));
        assert_eq!(manager.script_url("X"), "js/plugins/X.js");
    }
}
