//! Handler registry and selection for the parser module.
//!
//! Selection order: explicit handler argument, registered path override,
//! shebang, extension, then the default handler. An unhealthy or disabled
//! choice falls back to the default handler when that one is usable;
//! otherwise the original descriptor is returned with an `unhealthy:`
//! marker so the caller can surface the failure.

use std::path::Path;
use std::sync::Mutex;

use rustc_hash::FxHashMap;

use crate::core::config::ParserSettings;
use crate::core::error::RagmillError;
use crate::core::health::HealthStatus;
use crate::core::paths::normalize_path;

/// Result returned by handler dependency probes.
#[derive(Debug, Clone)]
pub struct HandlerProbeResult {
    pub status: HealthStatus,
    pub summary: Option<String>,
    pub warnings: Vec<String>,
}

impl HandlerProbeResult {
    pub fn ok() -> Self {
        Self {
            status: HealthStatus::Ok,
            summary: None,
            warnings: Vec::new(),
        }
    }

    pub fn error(summary: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Error,
            summary: Some(summary.into()),
            warnings: Vec::new(),
        }
    }
}

/// Zero-arg dependency probe attached to a handler descriptor.
pub type HandlerProbe = fn() -> HandlerProbeResult;

/// Descriptor describing a parser handler implementation.
#[derive(Debug, Clone)]
pub struct ParserHandlerDescriptor {
    pub name: String,
    pub version: String,
    pub display_name: String,
    pub extensions: Vec<String>,
    pub shebangs: Vec<String>,
    pub probe: Option<HandlerProbe>,
}

impl ParserHandlerDescriptor {
    pub fn new(
        name: &str,
        version: &str,
        display_name: &str,
        extensions: &[&str],
        shebangs: &[&str],
    ) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            display_name: display_name.to_string(),
            extensions: extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
            shebangs: shebangs
                .iter()
                .map(|sh| normalize_shebang(sh))
                .filter(|sh| !sh.is_empty())
                .collect(),
            probe: None,
        }
    }

    pub fn with_probe(mut self, probe: HandlerProbe) -> Self {
        self.probe = Some(probe);
        self
    }
}

/// Snapshot of handler enablement and dependency health.
#[derive(Debug, Clone)]
pub struct HandlerAvailability {
    pub name: String,
    pub enabled: bool,
    pub status: HealthStatus,
    pub summary: Option<String>,
    pub warnings: Vec<String>,
}

/// Decision returned when selecting a handler for a path.
#[derive(Debug, Clone)]
pub struct HandlerSelection {
    pub handler: ParserHandlerDescriptor,
    pub resolved_via: String,
    pub fallback: bool,
    pub probe: HandlerProbeResult,
}

/// Registry mapping files to parser handlers.
pub struct HandlerRegistry {
    settings: ParserSettings,
    descriptors: FxHashMap<String, ParserHandlerDescriptor>,
    default_handler: String,
    extensions: FxHashMap<String, String>,
    shebangs: FxHashMap<String, String>,
    path_overrides: Mutex<FxHashMap<String, String>>,
    probe_cache: Mutex<FxHashMap<String, HandlerProbeResult>>,
}

impl HandlerRegistry {
    pub fn new(
        descriptors: Vec<ParserHandlerDescriptor>,
        settings: ParserSettings,
        default_handler: &str,
    ) -> Result<Self, RagmillError> {
        let mut by_name = FxHashMap::default();
        let mut extensions = FxHashMap::default();
        let mut shebangs = FxHashMap::default();
        for descriptor in &descriptors {
            for extension in &descriptor.extensions {
                extensions.insert(extension.clone(), descriptor.name.clone());
            }
            for shebang in &descriptor.shebangs {
                shebangs.insert(shebang.clone(), descriptor.name.clone());
            }
            by_name.insert(descriptor.name.clone(), descriptor.clone());
        }
        if !by_name.contains_key(default_handler) {
            return Err(RagmillError::ParserError(format!(
                "Default handler {default_handler:?} not registered"
            )));
        }

        Ok(Self {
            settings,
            descriptors: by_name,
            default_handler: default_handler.to_string(),
            extensions,
            shebangs,
            path_overrides: Mutex::new(FxHashMap::default()),
            probe_cache: Mutex::new(FxHashMap::default()),
        })
    }

    pub fn descriptor(&self, name: &str) -> Option<&ParserHandlerDescriptor> {
        self.descriptors.get(name)
    }

    /// All registered `(name, version)` pairs.
    pub fn handler_versions(&self) -> std::collections::BTreeMap<String, String> {
        self.descriptors
            .values()
            .map(|descriptor| (descriptor.name.clone(), descriptor.version.clone()))
            .collect()
    }

    /// Register an explicit handler override for `path`.
    pub fn register_path_override(&self, path: &Path, handler: &str) -> Result<(), RagmillError> {
        if !self.descriptors.contains_key(handler) {
            return Err(RagmillError::ParserError(format!(
                "Unknown handler {handler:?} for override"
            )));
        }
        self.path_overrides.lock().unwrap().insert(
            normalize_path(path).to_string_lossy().to_string(),
            handler.to_string(),
        );
        Ok(())
    }

    pub fn remove_path_override(&self, path: &Path) {
        self.path_overrides
            .lock()
            .unwrap()
            .remove(&normalize_path(path).to_string_lossy().to_string());
    }

    /// Force-refresh a probe cache entry.
    pub fn refresh_probe(&self, handler: &str) -> HandlerProbeResult {
        self.probe_cache.lock().unwrap().remove(handler);
        self.probe(handler)
    }

    /// Availability snapshots for all handlers, sorted by name.
    pub fn availability(&self) -> Vec<HandlerAvailability> {
        let mut names: Vec<&String> = self.descriptors.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let enabled = self.settings.handler_enabled(name);
                let probe = self.probe(name);
                HandlerAvailability {
                    name: name.clone(),
                    enabled,
                    status: if enabled {
                        probe.status
                    } else {
                        HealthStatus::Unknown
                    },
                    summary: probe.summary,
                    warnings: probe.warnings,
                }
            })
            .collect()
    }

    /// Select the most appropriate handler for `path`.
    pub fn resolve(
        &self,
        path: &Path,
        explicit: Option<&str>,
        shebang: Option<&str>,
    ) -> Result<HandlerSelection, RagmillError> {
        let mut candidate: Option<(String, String)> = None;

        if let Some(explicit) = explicit.map(str::trim).filter(|value| !value.is_empty()) {
            if !self.descriptors.contains_key(explicit) {
                return Err(RagmillError::ParserError(format!(
                    "Unknown handler {explicit:?}"
                )));
            }
            candidate = Some((explicit.to_string(), "explicit".to_string()));
        }

        if candidate.is_none() {
            let key = normalize_path(path).to_string_lossy().to_string();
            if let Some(handler) = self.path_overrides.lock().unwrap().get(&key) {
                candidate = Some((handler.clone(), "override".to_string()));
            }
        }

        if candidate.is_none() {
            if let Some(shebang) = shebang {
                let normalized = normalize_shebang(shebang);
                if !normalized.is_empty() {
                    if let Some(handler) = self.shebangs.get(&normalized) {
                        candidate = Some((handler.clone(), format!("shebang:{normalized}")));
                    }
                }
            }
        }

        if candidate.is_none() {
            if let Some(extension) = infer_extension(path) {
                if let Some(handler) = self.extensions.get(&extension) {
                    candidate = Some((handler.clone(), format!("extension:{extension}")));
                }
            }
        }

        let (name, resolved_via) =
            candidate.unwrap_or_else(|| (self.default_handler.clone(), "default".to_string()));
        Ok(self.finalize_selection(&name, resolved_via))
    }

    fn finalize_selection(&self, handler_name: &str, resolved_via: String) -> HandlerSelection {
        let descriptor = self.descriptors[handler_name].clone();
        let probe = self.probe(handler_name);
        let enabled = self.settings.handler_enabled(handler_name);

        if enabled && probe.status == HealthStatus::Ok {
            return HandlerSelection {
                handler: descriptor,
                resolved_via,
                fallback: false,
                probe,
            };
        }

        let fallback_reason = if enabled { "dependency" } else { "disabled" };

        if handler_name != self.default_handler {
            let default_probe = self.probe(&self.default_handler);
            if self.settings.handler_enabled(&self.default_handler)
                && default_probe.status == HealthStatus::Ok
            {
                return HandlerSelection {
                    handler: self.descriptors[&self.default_handler].clone(),
                    resolved_via: format!("fallback:{fallback_reason}"),
                    fallback: true,
                    probe: default_probe,
                };
            }
        }

        HandlerSelection {
            handler: descriptor,
            resolved_via: format!("unhealthy:{fallback_reason}"),
            fallback: false,
            probe,
        }
    }

    fn probe(&self, handler: &str) -> HandlerProbeResult {
        if let Some(cached) = self.probe_cache.lock().unwrap().get(handler) {
            return cached.clone();
        }
        let result = match self.descriptors.get(handler).and_then(|d| d.probe) {
            Some(probe) => probe(),
            None => HandlerProbeResult::ok(),
        };
        self.probe_cache
            .lock()
            .unwrap()
            .insert(handler.to_string(), result.clone());
        result
    }
}

/// Normalize a shebang declaration for lookup: strip `#!`, split on
/// whitespace, unwrap `env`, basename, lowercase.
pub fn normalize_shebang(text: &str) -> String {
    let mut payload = text.trim();
    if let Some(rest) = payload.strip_prefix("#!") {
        payload = rest.trim();
    }
    if payload.is_empty() {
        return String::new();
    }
    let parts: Vec<&str> = payload.split_whitespace().collect();
    let Some(first) = parts.first() else {
        return String::new();
    };
    let command = if first.ends_with("env") && parts.len() > 1 {
        parts[1]
    } else {
        first
    };
    Path::new(command)
        .file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Effective extension: `file.PY` yields `py`; `.hidden.ext` yields `ext`;
/// extensionless files yield nothing.
pub fn infer_extension(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_string_lossy().to_string();
    if let Some(extension) = path.extension() {
        return Some(extension.to_string_lossy().to_lowercase());
    }
    if let Some(hidden) = name.strip_prefix('.') {
        if let Some((_, extension)) = hidden.rsplit_once('.') {
            if !extension.is_empty() {
                return Some(extension.to_lowercase());
            }
        }
    }
    None
}

/// Baseline descriptors for the built-in handlers.
pub fn default_descriptors() -> Vec<ParserHandlerDescriptor> {
    vec![
        ParserHandlerDescriptor::new(
            "text",
            "1.0.0",
            "Plain Text",
            &["txt", "log", "ini", "toml", "cfg"],
            &[],
        ),
        ParserHandlerDescriptor::new(
            "markdown",
            "1.0.0",
            "Markdown",
            &["md", "markdown", "mdown", "mkdn", "mkd"],
            &[],
        ),
        ParserHandlerDescriptor::new(
            "python",
            "1.0.0",
            "Python",
            &["py", "pyw", "pyi"],
            &["python", "python3", "python2"],
        ),
        ParserHandlerDescriptor::new(
            "javascript",
            "1.0.0",
            "JavaScript",
            &["js", "cjs", "mjs", "jsx"],
            &["node"],
        ),
        ParserHandlerDescriptor::new(
            "typescript",
            "1.0.0",
            "TypeScript",
            &["ts", "tsx", "cts", "mts"],
            &[],
        ),
        ParserHandlerDescriptor::new("html", "1.0.0", "HTML", &["html", "htm"], &[]),
        ParserHandlerDescriptor::new("css", "1.0.0", "CSS", &["css", "scss", "less"], &[]),
    ]
}

/// Registry with the baseline descriptors, defaulting to plain text.
pub fn build_default_registry(settings: ParserSettings) -> Result<HandlerRegistry, RagmillError> {
    HandlerRegistry::new(default_descriptors(), settings, "text")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_shebang_unwraps_env() {
        assert_eq!(normalize_shebang("#!/usr/bin/env python3"), "python3");
        assert_eq!(normalize_shebang("#!/usr/bin/python"), "python");
        assert_eq!(normalize_shebang("#!"), "");
    }

    #[test]
    fn test_infer_extension_handles_hidden_files() {
        assert_eq!(
            infer_extension(Path::new("src/app.PY")),
            Some("py".to_string())
        );
        assert_eq!(
            infer_extension(Path::new(".hidden.toml")),
            Some("toml".to_string())
        );
        assert_eq!(infer_extension(Path::new("Makefile")), None);
    }

    #[test]
    fn test_resolution_ladder() {
        let registry = build_default_registry(ParserSettings::default()).unwrap();

        let by_extension = registry
            .resolve(Path::new("demo/sample.py"), None, None)
            .unwrap();
        assert_eq!(by_extension.handler.name, "python");
        assert_eq!(by_extension.resolved_via, "extension:py");

        let by_shebang = registry
            .resolve(Path::new("demo/script"), None, Some("#!/usr/bin/env node"))
            .unwrap();
        assert_eq!(by_shebang.handler.name, "javascript");
        assert_eq!(by_shebang.resolved_via, "shebang:node");

        let default = registry
            .resolve(Path::new("demo/README"), None, None)
            .unwrap();
        assert_eq!(default.handler.name, "text");
        assert_eq!(default.resolved_via, "default");

        assert!(registry
            .resolve(Path::new("demo/sample.py"), Some("nope"), None)
            .is_err());
    }

    #[test]
    fn test_disabled_handler_falls_back_to_default() {
        let mut settings = ParserSettings::default();
        settings.handlers.insert(
            "python".to_string(),
            crate::core::config::ParserHandlerSettings {
                enabled: false,
                max_tokens: None,
            },
        );
        let registry = build_default_registry(settings).unwrap();
        let selection = registry
            .resolve(Path::new("demo/sample.py"), None, None)
            .unwrap();
        assert_eq!(selection.handler.name, "text");
        assert!(selection.fallback);
        assert_eq!(selection.resolved_via, "fallback:disabled");
    }

    fn failing_probe() -> HandlerProbeResult {
        HandlerProbeResult::error("missing dependency")
    }

    #[test]
    fn test_unhealthy_probe_falls_back_then_marks_unhealthy() {
        let mut descriptors = default_descriptors();
        for descriptor in descriptors.iter_mut() {
            if descriptor.name == "markdown" {
                descriptor.probe = Some(failing_probe);
            }
        }
        let registry =
            HandlerRegistry::new(descriptors, ParserSettings::default(), "text").unwrap();
        let selection = registry
            .resolve(Path::new("notes.md"), None, None)
            .unwrap();
        assert_eq!(selection.handler.name, "text");
        assert!(selection.fallback);
        assert_eq!(selection.resolved_via, "fallback:dependency");
    }
}
