//! Flat configuration loading.
//!
//! Builds the string map that becomes the root [`Context`]. Later layers
//! override earlier ones:
//!
//! ```text
//! key defaults < application.properties < application-<profile>.properties
//!              < environment (raw and lower.dotted) < explicit overrides
//! ```
//!
//! `${key}` and `${key:default}` placeholders are then resolved against the
//! merged map. Unresolvable placeholders and cycles are errors, except in
//! environment variables outside the recognised keys: those stay literal.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::context::Context;
use crate::types::{Error, Result, CONFIG_KEYS, KEY_PROFILE};

pub const BASE_FILE: &str = "application.properties";
pub const MASK: &str = "****";

const SECRET_MARKERS: &[&str] = &["secret", "password", "token", "credential"];

type Layer = BTreeMap<String, String>;

/// Layered loader for the root configuration map.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    dir: Option<PathBuf>,
    profile: Option<String>,
    env: Option<Vec<(String, String)>>,
    skip_env: bool,
    overrides: Vec<(String, String)>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory holding the property files; none means no files are read.
    pub fn config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Profile to load; otherwise taken from `runtime.profile`.
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    /// Use these variables instead of the process environment.
    pub fn env_vars<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    pub fn without_env(mut self) -> Self {
        self.skip_env = true;
        self
    }

    /// Highest-precedence entry.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    /// Parse `key=value` overrides as given on a command line.
    pub fn overrides<'a>(mut self, args: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        for arg in args {
            let (key, value) = arg
                .split_once('=')
                .ok_or_else(|| Error::config(format!("override '{arg}' is not key=value")))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::config(format!("override '{arg}' has an empty key")));
            }
            self.overrides.push((key.to_string(), value.to_string()));
        }
        Ok(self)
    }

    pub fn load(&self) -> Result<BTreeMap<String, String>> {
        let defaults: Layer = CONFIG_KEYS
            .iter()
            .filter(|k| !k.default.is_empty())
            .map(|k| (k.key.to_string(), k.default.to_string()))
            .collect();
        let base = self.read_file(BASE_FILE)?;
        let env = self.env_layer();
        let overrides: Layer = self.overrides.iter().cloned().collect();

        let profile = self
            .profile
            .clone()
            .or_else(|| overrides.get(KEY_PROFILE).cloned())
            .or_else(|| env.get(KEY_PROFILE).cloned())
            .or_else(|| base.get(KEY_PROFILE).cloned())
            .filter(|p| !p.trim().is_empty());
        let profiled = match &profile {
            Some(p) => self.read_file(&format!("application-{}.properties", p.trim()))?,
            None => Layer::new(),
        };

        let literal: BTreeSet<String> = env
            .keys()
            .filter(|k| !overrides.contains_key(*k))
            .filter(|k| !CONFIG_KEYS.iter().any(|c| c.key == k.as_str()))
            .cloned()
            .collect();

        let mut merged = Layer::new();
        for layer in [defaults, base, profiled, env, overrides] {
            merged.extend(layer);
        }
        if let Some(p) = profile {
            merged.insert(KEY_PROFILE.to_string(), p);
        }

        tracing::debug!(entries = merged.len(), "config_loaded");
        resolve_with(&merged, &literal)
    }

    /// Load and wrap the result as a root context.
    pub fn load_context(&self) -> Result<Context> {
        Ok(Context::new(self.load()?))
    }

    fn read_file(&self, name: &str) -> Result<Layer> {
        let Some(dir) = &self.dir else {
            return Ok(Layer::new());
        };
        read_properties(&dir.join(name))
    }

    fn env_layer(&self) -> Layer {
        if self.skip_env {
            return Layer::new();
        }
        let vars: Vec<(String, String)> = match &self.env {
            Some(vars) => vars.clone(),
            None => std::env::vars().collect(),
        };
        let mut layer = Layer::new();
        for (name, value) in vars {
            let dotted = normalize_env_name(&name);
            if dotted != name {
                layer.insert(dotted, value.clone());
            }
            layer.insert(name, value);
        }
        layer
    }
}

/// `RUNTIME_LOG_LEVEL` → `runtime.log.level`.
pub fn normalize_env_name(name: &str) -> String {
    name.to_ascii_lowercase().replace('_', ".")
}

/// Read a properties file; a missing file is an empty layer.
pub fn read_properties(path: &Path) -> Result<BTreeMap<String, String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            tracing::debug!(path = %path.display(), "config_file_read");
            Ok(parse_properties(&text))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e.into()),
    }
}

/// Parse `key=value` / `key: value` lines. `#` and `!` start comments.
pub fn parse_properties(text: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let split = line.find(['=', ':']);
        let (key, value) = match split {
            Some(i) => (&line[..i], &line[i + 1..]),
            None => (line, ""),
        };
        let key = key.trim();
        if !key.is_empty() {
            out.insert(key.to_string(), value.trim().to_string());
        }
    }
    out
}

/// Expand `${key}` / `${key:default}` in every value.
pub fn resolve_placeholders(map: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
    resolve_with(map, &BTreeSet::new())
}

/// Values of `literal` keys that fail to resolve are kept as written.
fn resolve_with(
    map: &BTreeMap<String, String>,
    literal: &BTreeSet<String>,
) -> Result<BTreeMap<String, String>> {
    let mut resolver = Resolver {
        map,
        literal,
        done: BTreeMap::new(),
        stack: Vec::new(),
    };
    for key in map.keys() {
        resolver.key(key)?;
    }
    Ok(resolver.done)
}

struct Resolver<'a> {
    map: &'a BTreeMap<String, String>,
    literal: &'a BTreeSet<String>,
    done: BTreeMap<String, String>,
    stack: Vec<String>,
}

impl Resolver<'_> {
    fn key(&mut self, key: &str) -> Result<String> {
        if let Some(v) = self.done.get(key) {
            return Ok(v.clone());
        }
        if self.stack.iter().any(|k| k == key) {
            let mut chain = self.stack.join(" -> ");
            chain.push_str(" -> ");
            chain.push_str(key);
            return Err(Error::config(format!("placeholder cycle: {chain}")));
        }
        let Some(raw) = self.map.get(key) else {
            return Err(Error::config(format!("unresolved placeholder ${{{key}}}")));
        };

        self.stack.push(key.to_string());
        let value = self.expand(raw);
        self.stack.pop();
        let value = match value {
            Ok(v) => v,
            Err(err) if self.literal.contains(key) => {
                tracing::debug!(key, error = %err, "config_value_kept_literal");
                raw.clone()
            }
            Err(err) => return Err(err),
        };
        self.done.insert(key.to_string(), value.clone());
        Ok(value)
    }

    fn expand(&mut self, text: &str) -> Result<String> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let body_start = start + 2;
            let end = matching_brace(&rest[body_start..])
                .map(|i| body_start + i)
                .ok_or_else(|| Error::config(format!("unterminated placeholder in '{text}'")))?;
            let body = &rest[body_start..end];

            let (name, default) = match body.split_once(':') {
                Some((name, default)) => (name.trim(), Some(default)),
                None => (body.trim(), None),
            };
            let value = if self.map.contains_key(name) {
                self.key(name)?
            } else if let Some(default) = default {
                self.expand(default)?
            } else {
                return Err(Error::config(format!("unresolved placeholder ${{{name}}}")));
            };
            out.push_str(&value);
            rest = &rest[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

/// Index of the `}` closing a placeholder body, honouring nested `${`.
fn matching_brace(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'$' if bytes.get(i + 1) == Some(&b'{') => {
                depth += 1;
                i += 2;
                continue;
            }
            b'}' if depth == 0 => return Some(i),
            b'}' => depth -= 1,
            _ => {}
        }
        i += 1;
    }
    None
}

/// True for keys whose values must never be printed.
pub fn is_secret_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SECRET_MARKERS.iter().any(|m| lower.contains(m))
        || CONFIG_KEYS.iter().any(|k| k.secret && k.key == key)
}

/// Copy of `map` with secret values replaced by [`MASK`].
pub fn mask_secrets(map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    map.iter()
        .map(|(k, v)| {
            let value = if is_secret_key(k) { MASK.to_string() } else { v.clone() };
            (k.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_properties() {
        let parsed = parse_properties(
            "# comment\n! also\n\napp.name = demo\napp.port: 8080\nflag\n  spaced.key=a=b  \n",
        );
        assert_eq!(
            parsed,
            map(&[
                ("app.name", "demo"),
                ("app.port", "8080"),
                ("flag", ""),
                ("spaced.key", "a=b"),
            ])
        );
    }

    #[test]
    fn test_layer_precedence() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("application.properties"),
            "a=base\nb=base\nc=base\nruntime.profile=dev\n",
        )
        .unwrap();
        fs::write(dir.path().join("application-dev.properties"), "b=dev\nc=dev\n").unwrap();

        let loaded = ConfigLoader::new()
            .config_dir(dir.path())
            .env_vars([("C", "env"), ("D_E", "env")])
            .set("d.e", "override")
            .load()
            .unwrap();

        assert_eq!(loaded["a"], "base");
        assert_eq!(loaded["b"], "dev");
        assert_eq!(loaded["c"], "env");
        assert_eq!(loaded["C"], "env");
        assert_eq!(loaded["d.e"], "override");
        assert_eq!(loaded["runtime.profile"], "dev");
        // Key defaults fill the gaps.
        assert_eq!(loaded["runtime.shutdown.timeout"], "10s");
    }

    #[test]
    fn test_explicit_profile_wins() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("application.properties"), "runtime.profile=dev\n").unwrap();
        fs::write(dir.path().join("application-dev.properties"), "x=dev\n").unwrap();
        fs::write(dir.path().join("application-prod.properties"), "x=prod\n").unwrap();

        let loaded = ConfigLoader::new()
            .config_dir(dir.path())
            .without_env()
            .profile("prod")
            .load()
            .unwrap();
        assert_eq!(loaded["x"], "prod");
        assert_eq!(loaded["runtime.profile"], "prod");
    }

    #[test]
    fn test_missing_directory_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = ConfigLoader::new()
            .config_dir(dir.path().join("absent"))
            .without_env()
            .load()
            .unwrap();
        assert_eq!(loaded["runtime.log.level"], "info");
    }

    #[test]
    fn test_placeholders_resolve_recursively() {
        let resolved = resolve_placeholders(&map(&[
            ("host", "example.org"),
            ("port", "${http.port:8080}"),
            ("url", "http://${host}:${port}/${path:${host}}"),
        ]))
        .unwrap();
        assert_eq!(resolved["port"], "8080");
        assert_eq!(resolved["url"], "http://example.org:8080/example.org");
    }

    #[test]
    fn test_unresolved_and_cyclic_placeholders_fail() {
        let err = resolve_placeholders(&map(&[("a", "${missing}")])).unwrap_err();
        assert!(err.to_string().contains("unresolved placeholder ${missing}"));

        let err = resolve_placeholders(&map(&[("a", "${b}"), ("b", "${a}")])).unwrap_err();
        assert!(err.to_string().contains("cycle"));

        let err = resolve_placeholders(&map(&[("a", "${b")])).unwrap_err();
        assert!(err.to_string().contains("unterminated"));
    }

    #[test]
    fn test_unresolvable_env_values_stay_literal() {
        let loaded = ConfigLoader::new()
            .env_vars([("SOME_TOOL_TEMPLATE", "${HOME_UNSET}/x"), ("APP_HOME", "/srv")])
            .set("app.dir", "${APP_HOME}/data")
            .load()
            .unwrap();
        assert_eq!(loaded["SOME_TOOL_TEMPLATE"], "${HOME_UNSET}/x");
        assert_eq!(loaded["some.tool.template"], "${HOME_UNSET}/x");
        assert_eq!(loaded["app.dir"], "/srv/data");

        // Recognised keys stay strict even when they come from the environment.
        let err = ConfigLoader::new()
            .env_vars([("RUNTIME_LOG_LEVEL", "${UNSET_LEVEL}")])
            .load()
            .unwrap_err();
        assert!(err.to_string().contains("unresolved placeholder ${UNSET_LEVEL}"));
    }

    #[test]
    fn test_overrides_parse() {
        let loader = ConfigLoader::new()
            .without_env()
            .overrides(["a=1", "b=x=y"])
            .unwrap();
        let loaded = loader.load().unwrap();
        assert_eq!(loaded["a"], "1");
        assert_eq!(loaded["b"], "x=y");
        assert!(ConfigLoader::new().overrides(["novalue"]).is_err());
        assert!(ConfigLoader::new().overrides(["=v"]).is_err());
    }

    #[test]
    fn test_mask_secrets() {
        let masked = mask_secrets(&map(&[
            ("db.password", "hunter2"),
            ("api.TOKEN", "abc"),
            ("client.secret.id", "s"),
            ("aws.credentials", "c"),
            ("app.name", "demo"),
        ]));
        assert_eq!(masked["db.password"], MASK);
        assert_eq!(masked["api.TOKEN"], MASK);
        assert_eq!(masked["client.secret.id"], MASK);
        assert_eq!(masked["aws.credentials"], MASK);
        assert_eq!(masked["app.name"], "demo");
    }

    #[test]
    fn test_load_context() {
        let ctx = ConfigLoader::new()
            .without_env()
            .set("app.name", "demo")
            .load_context()
            .unwrap();
        assert_eq!(ctx.get("app.name"), Some("demo"));
        assert_eq!(ctx.get("runtime.shutdown.parallel"), Some("false"));
    }
}
