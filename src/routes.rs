//! Route table: JSON specification and compiled per-host routers
//!
//! The route file declares, per virtual host, which method+path patterns
//! the proxy accepts and how to rebuild the backend URL from the matched
//! parameters. The JSON is parsed once at startup and compiled into an
//! immutable two-level dispatch: host, then method, then a radix-tree
//! path router.
//!
//! Path patterns use `/`-separated segments where `:name` matches one
//! segment and `*name` swallows the remainder of the path (slashes
//! included). Parameters bind in the order they appear in the pattern,
//! and templates refer to them by that ordinal.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use http::Method;
use serde::Deserialize;
use tracing::debug;

/// Errors raised while loading or compiling the route table.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// The route file could not be read.
    #[error("error while opening route file '{path}': {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The route file is not valid JSON for the expected shape.
    #[error("error while decoding route JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A host block has an empty host name.
    #[error("route entry with empty Host")]
    EmptyHost,

    /// A method+path map is missing its method.
    #[error("route for host '{0}' has an empty Method")]
    EmptyMethod(String),

    /// The method is not a valid HTTP method token.
    #[error("route for host '{host}' has invalid method '{method}'")]
    BadMethod {
        /// Host block the route belongs to.
        host: String,
        /// Offending method string.
        method: String,
    },

    /// A method+path map is missing its path pattern.
    #[error("route for host '{0}' has an empty Path")]
    EmptyPath(String),

    /// Patterns must be absolute.
    #[error("path pattern '{0}' must start with '/'")]
    RelativePattern(String),

    /// A catch-all segment is only allowed at the end of a pattern.
    #[error("catch-all segment must be last in pattern '{0}'")]
    CatchAllNotLast(String),

    /// A parameter segment has no name.
    #[error("unnamed parameter in pattern '{0}'")]
    UnnamedParameter(String),

    /// Two routes registered the same or conflicting patterns.
    #[error("conflicting route '{method} {pattern}' for host '{host}': {reason}")]
    Conflict {
        /// Host block the route belongs to.
        host: String,
        /// Method of the conflicting registration.
        method: String,
        /// Pattern of the conflicting registration.
        pattern: String,
        /// Router-level reason.
        reason: String,
    },
}

/// One element of a target template: a literal chunk or a 0-based
/// reference into the matched parameter list.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum TemplateElement {
    /// Literal text appended verbatim (modulo leading-slash stripping).
    Literal(String),
    /// Ordinal reference to the n-th captured parameter.
    Param(u64),
}

/// `MethodPathMaps` entry: one inbound method+path pattern and the
/// template that rebuilds its backend URL.
#[derive(Debug, Clone, Deserialize)]
pub struct MethodPathMap {
    /// HTTP method the route answers.
    #[serde(rename = "Method")]
    pub method: String,
    /// Path pattern in `:name` / `*name` grammar.
    #[serde(rename = "Path")]
    pub path: String,
    /// Target template.
    #[serde(rename = "Route")]
    pub route: Vec<TemplateElement>,
}

/// All routes of one virtual host.
#[derive(Debug, Clone, Deserialize)]
pub struct HostBlock {
    /// Host name as presented in the Host header (port excluded).
    #[serde(rename = "Host")]
    pub host: String,
    /// Ordered method+path maps.
    #[serde(rename = "MethodPathMaps")]
    pub method_path_maps: Vec<MethodPathMap>,
}

/// Top-level route specification document.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteSpec {
    /// Host blocks in declaration order.
    #[serde(rename = "Routes")]
    pub routes: Vec<HostBlock>,
}

impl RouteSpec {
    /// Read and parse a route file.
    pub fn load(path: &Path) -> Result<Self, RouteError> {
        let raw = fs::read(path).map_err(|source| RouteError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// One parameter declared by a pattern, in order of appearance.
#[derive(Debug, Clone)]
struct ParamSlot {
    name: String,
    catch_all: bool,
}

/// A compiled route: the template plus the parameter layout its pattern
/// produces.
#[derive(Debug, Clone)]
pub struct CompiledRoute {
    /// Template elements in substitution order.
    pub template: Arc<Vec<TemplateElement>>,
    params: Arc<Vec<ParamSlot>>,
}

/// Per-host dispatch: method, then path.
#[derive(Debug, Default)]
pub struct HostRouter {
    methods: HashMap<Method, matchit::Router<CompiledRoute>>,
}

impl HostRouter {
    /// Match a method+path against this host's routes, yielding the route
    /// and the ordered `(name, value)` bindings.
    pub fn find(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let router = self.methods.get(method)?;
        let matched = router.at(path).ok()?;
        let route = matched.value.clone();
        let mut bindings = Vec::with_capacity(route.params.len());
        for slot in route.params.iter() {
            let value = matched.params.get(&slot.name)?;
            // The engine strips the leading slash off catch-all captures;
            // restore it so bindings carry the remainder as-is.
            let value = if slot.catch_all {
                format!("/{value}")
            } else {
                value.to_string()
            };
            bindings.push((slot.name.clone(), value));
        }
        Some(RouteMatch { route, bindings })
    }
}

/// A successful route match.
#[derive(Debug)]
pub struct RouteMatch {
    /// The compiled route that matched.
    pub route: CompiledRoute,
    /// Captured parameters in pattern order.
    pub bindings: Vec<(String, String)>,
}

/// The compiled route table for every configured host.
#[derive(Debug, Default)]
pub struct RouterTable {
    hosts: HashMap<String, HostRouter>,
}

impl RouterTable {
    /// Compile a parsed specification into the dispatch table.
    ///
    /// All validation lives here: empty fields, bad methods, malformed
    /// patterns and duplicate registrations are fatal.
    pub fn compile(spec: &RouteSpec) -> Result<Self, RouteError> {
        let mut table = RouterTable::default();
        for block in &spec.routes {
            if block.host.is_empty() {
                return Err(RouteError::EmptyHost);
            }
            let host_router = table.hosts.entry(block.host.clone()).or_default();
            for map in &block.method_path_maps {
                if map.method.is_empty() {
                    return Err(RouteError::EmptyMethod(block.host.clone()));
                }
                let method = Method::from_bytes(map.method.as_bytes()).map_err(|_| {
                    RouteError::BadMethod {
                        host: block.host.clone(),
                        method: map.method.clone(),
                    }
                })?;
                if map.path.is_empty() {
                    return Err(RouteError::EmptyPath(block.host.clone()));
                }

                let (engine_pattern, params) = translate_pattern(&map.path)?;
                let route = CompiledRoute {
                    template: Arc::new(map.route.clone()),
                    params: Arc::new(params),
                };
                host_router
                    .methods
                    .entry(method)
                    .or_default()
                    .insert(&engine_pattern, route)
                    .map_err(|e| RouteError::Conflict {
                        host: block.host.clone(),
                        method: map.method.clone(),
                        pattern: map.path.clone(),
                        reason: e.to_string(),
                    })?;
                debug!(
                    host = %block.host,
                    method = %map.method,
                    pattern = %map.path,
                    "route registered"
                );
            }
        }
        Ok(table)
    }

    /// Look up the router for a host, with any `:port` suffix on the
    /// header value stripped first.
    pub fn host(&self, host_header: &str) -> Option<&HostRouter> {
        self.hosts.get(strip_port(host_header))
    }

    /// Number of configured hosts.
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }
}

/// Drop a `:port` suffix from a Host header value.
pub fn strip_port(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

/// Translate the `:name` / `*name` grammar into the engine's brace
/// syntax, collecting parameter slots in order of appearance.
fn translate_pattern(pattern: &str) -> Result<(String, Vec<ParamSlot>), RouteError> {
    if !pattern.starts_with('/') {
        return Err(RouteError::RelativePattern(pattern.to_string()));
    }

    let segments: Vec<&str> = pattern.split('/').collect();
    let mut engine = String::with_capacity(pattern.len());
    let mut params = Vec::new();

    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            engine.push('/');
        }
        if let Some(name) = segment.strip_prefix(':') {
            if name.is_empty() {
                return Err(RouteError::UnnamedParameter(pattern.to_string()));
            }
            engine.push('{');
            engine.push_str(name);
            engine.push('}');
            params.push(ParamSlot {
                name: name.to_string(),
                catch_all: false,
            });
        } else if let Some(name) = segment.strip_prefix('*') {
            if name.is_empty() {
                return Err(RouteError::UnnamedParameter(pattern.to_string()));
            }
            if i != segments.len() - 1 {
                return Err(RouteError::CatchAllNotLast(pattern.to_string()));
            }
            engine.push_str("{*");
            engine.push_str(name);
            engine.push('}');
            params.push(ParamSlot {
                name: name.to_string(),
                catch_all: true,
            });
        } else {
            // Literal segment; braces are meaningful to the engine and
            // must be escaped by doubling.
            engine.push_str(&segment.replace('{', "{{").replace('}', "}}"));
        }
    }

    Ok((engine, params))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_from_json(json: &str) -> RouteSpec {
        serde_json::from_str(json).unwrap()
    }

    const SAMPLE: &str = r#"{
        "Routes": [
            {
                "Host": "example.com",
                "MethodPathMaps": [
                    { "Method": "GET", "Path": "/hello/:name", "Route": ["http://backend/greet/", 0] },
                    { "Method": "POST", "Path": "/wild/:domain/*end", "Route": ["https://www.", 0, ".com/", 1] }
                ]
            },
            {
                "Host": "other.test",
                "MethodPathMaps": [
                    { "Method": "GET", "Path": "/static", "Route": ["http://static.internal/"] }
                ]
            }
        ]
    }"#;

    #[test]
    fn spec_parses_strings_and_ordinals() {
        let spec = spec_from_json(SAMPLE);
        assert_eq!(spec.routes.len(), 2);
        let maps = &spec.routes[0].method_path_maps;
        assert_eq!(
            maps[0].route,
            vec![
                TemplateElement::Literal("http://backend/greet/".into()),
                TemplateElement::Param(0)
            ]
        );
    }

    #[test]
    fn negative_ordinals_are_rejected() {
        let json = r#"{"Routes":[{"Host":"h","MethodPathMaps":[
            {"Method":"GET","Path":"/a","Route":[-1]}]}]}"#;
        assert!(serde_json::from_str::<RouteSpec>(json).is_err());
    }

    #[test]
    fn named_parameter_binds_one_segment() {
        let table = RouterTable::compile(&spec_from_json(SAMPLE)).unwrap();
        let host = table.host("example.com").unwrap();
        let m = host.find(&Method::GET, "/hello/world").unwrap();
        assert_eq!(m.bindings, vec![("name".to_string(), "world".to_string())]);
        assert!(host.find(&Method::GET, "/hello/a/b").is_none());
    }

    #[test]
    fn catch_all_binds_remainder_with_leading_slash() {
        let table = RouterTable::compile(&spec_from_json(SAMPLE)).unwrap();
        let host = table.host("example.com").unwrap();
        let m = host.find(&Method::POST, "/wild/foo/bar/baz").unwrap();
        assert_eq!(
            m.bindings,
            vec![
                ("domain".to_string(), "foo".to_string()),
                ("end".to_string(), "/bar/baz".to_string()),
            ]
        );
    }

    #[test]
    fn unmatched_method_is_a_miss() {
        let table = RouterTable::compile(&spec_from_json(SAMPLE)).unwrap();
        let host = table.host("example.com").unwrap();
        assert!(host.find(&Method::DELETE, "/hello/world").is_none());
    }

    #[test]
    fn host_lookup_strips_port() {
        let table = RouterTable::compile(&spec_from_json(SAMPLE)).unwrap();
        assert!(table.host("example.com:8443").is_some());
        assert!(table.host("example.com").is_some());
        assert!(table.host("nope.invalid").is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let json = r#"{"Routes":[{"Host":"h","MethodPathMaps":[
            {"Method":"GET","Path":"/a/:x","Route":["t"]},
            {"Method":"GET","Path":"/a/:y","Route":["t"]}]}]}"#;
        let err = RouterTable::compile(&spec_from_json(json)).unwrap_err();
        assert!(matches!(err, RouteError::Conflict { .. }));
    }

    #[test]
    fn empty_fields_are_rejected() {
        let empty_host = r#"{"Routes":[{"Host":"","MethodPathMaps":[]}]}"#;
        assert!(matches!(
            RouterTable::compile(&spec_from_json(empty_host)).unwrap_err(),
            RouteError::EmptyHost
        ));

        let empty_path = r#"{"Routes":[{"Host":"h","MethodPathMaps":[
            {"Method":"GET","Path":"","Route":[]}]}]}"#;
        assert!(matches!(
            RouterTable::compile(&spec_from_json(empty_path)).unwrap_err(),
            RouteError::EmptyPath(_)
        ));

        let empty_method = r#"{"Routes":[{"Host":"h","MethodPathMaps":[
            {"Method":"","Path":"/a","Route":[]}]}]}"#;
        assert!(matches!(
            RouterTable::compile(&spec_from_json(empty_method)).unwrap_err(),
            RouteError::EmptyMethod(_)
        ));
    }

    #[test]
    fn catch_all_must_be_last() {
        let json = r#"{"Routes":[{"Host":"h","MethodPathMaps":[
            {"Method":"GET","Path":"/a/*rest/b","Route":[]}]}]}"#;
        assert!(matches!(
            RouterTable::compile(&spec_from_json(json)).unwrap_err(),
            RouteError::CatchAllNotLast(_)
        ));
    }

    #[test]
    fn methods_are_validated() {
        let json = r#"{"Routes":[{"Host":"h","MethodPathMaps":[
            {"Method":"GE T","Path":"/a","Route":[]}]}]}"#;
        assert!(matches!(
            RouterTable::compile(&spec_from_json(json)).unwrap_err(),
            RouteError::BadMethod { .. }
        ));
    }
}
