//! Routing snapshot: service -> ordered compiled patterns.
//!
//! Writers replace one service's list atomically (copy-on-write Arc swap
//! under a short write lock); readers scan entries in insertion order.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use registry_client::Registry;
use tracing::{debug, info};

use crate::error::Result;
use crate::pattern::{strip_method_tag, RoutePattern};

/// One service's compiled routes.
struct ServiceRoutes {
    name: String,
    /// External entries are proxied over plain HTTP to `name` as a base URL.
    external: bool,
    routes: Arc<Vec<RoutePattern>>,
}

/// Result of matching a request path.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub service: String,
    /// Literal pattern that matched; `None` when fallback attribution fired.
    pub pattern: Option<String>,
    pub captures: HashMap<String, String>,
    /// URL to forward (fallback attribution may strip the service segment).
    pub forwarded_url: String,
    pub external: bool,
}

/// The current routing snapshot plus the set of known service names.
#[derive(Default)]
pub struct RouteTable {
    entries: RwLock<Vec<ServiceRoutes>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace (or insert) one service's route list atomically. Patterns are
    /// compiled outside the lock; method tags are stripped before storage.
    pub fn update_service(&self, name: &str, patterns: &[String], external: bool) -> Result<()> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let (_, path) = strip_method_tag(raw);
            // Duplicate patterns collapse to the first occurrence.
            if compiled
                .iter()
                .any(|p: &RoutePattern| p.literal() == path)
            {
                continue;
            }
            compiled.push(RoutePattern::compile(path)?);
        }
        let routes = Arc::new(compiled);

        let mut entries = self.entries.write().unwrap();
        match entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => entry.routes = routes,
            None => entries.push(ServiceRoutes {
                name: name.to_string(),
                external,
                routes,
            }),
        }
        Ok(())
    }

    /// Fetch routes from the registry and replace the table's lists, for all
    /// services or a single one.
    pub async fn refresh(&self, registry: &dyn Registry, service: Option<&str>) -> Result<()> {
        let all = registry.get_all_routes().await?;
        match service {
            Some(name) => {
                if let Some(patterns) = all.get(name) {
                    self.update_service(name, patterns, false)?;
                    info!("refreshed routes for {}", name);
                } else {
                    debug!("refresh requested for unknown service {}", name);
                }
            }
            None => {
                for (name, patterns) in &all {
                    self.update_service(name, patterns, false)?;
                }
                info!("refreshed routes for {} services", all.len());
            }
        }
        Ok(())
    }

    /// First matching `(service, captures, pattern)` across services in
    /// insertion order.
    pub fn lookup(&self, path: &str) -> Option<RouteMatch> {
        let entries = self.entries.read().unwrap();
        for entry in entries.iter() {
            for pattern in entry.routes.iter() {
                if let Some(captures) = pattern.matches(path) {
                    return Some(RouteMatch {
                        service: entry.name.clone(),
                        pattern: Some(pattern.literal().to_string()),
                        captures,
                        forwarded_url: path.to_string(),
                        external: entry.external,
                    });
                }
            }
        }
        None
    }

    /// `lookup` plus the two-stage fallback for untracked asset URLs:
    /// referer attribution (URL unchanged), then first-segment attribution
    /// (segment stripped from the forwarded URL).
    pub fn resolve(&self, url: &str, referer: Option<&str>) -> Option<RouteMatch> {
        if let Some(found) = self.lookup(url) {
            return Some(found);
        }

        let known = self.known_services();
        if let Some(referer) = referer {
            for service in &known {
                if referer.contains(&format!("/{service}")) {
                    return Some(RouteMatch {
                        service: service.clone(),
                        pattern: None,
                        captures: HashMap::new(),
                        forwarded_url: url.to_string(),
                        external: false,
                    });
                }
            }
        }

        let (path, query) = match url.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (url, None),
        };
        let first_segment = path.strip_prefix('/')?.split('/').next()?;
        if !first_segment.is_empty() && known.iter().any(|s| s == first_segment) {
            let remainder = &path[1 + first_segment.len()..];
            let forwarded_url = match query {
                Some(q) => format!("{remainder}?{q}"),
                None => remainder.to_string(),
            };
            return Some(RouteMatch {
                service: first_segment.to_string(),
                pattern: None,
                captures: HashMap::new(),
                forwarded_url,
                external: false,
            });
        }
        None
    }

    /// Known (non-external) service names, in insertion order.
    pub fn known_services(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .filter(|e| !e.external)
            .map(|e| e.name.clone())
            .collect()
    }

    /// Literal pattern strings per service, for the admin listing.
    pub fn snapshot(&self) -> Vec<(String, Vec<String>)> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .map(|e| {
                (
                    e.name.clone(),
                    e.routes.iter().map(|p| p.literal().to_string()).collect(),
                )
            })
            .collect()
    }
}
