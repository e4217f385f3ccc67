//! Route lookup.
//!
//! # Responsibilities
//! - Store compiled routes
//! - Look up the matching route for a request
//! - Return the matched route or an explicit no-match
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(n) scan over routes sorted most specific first
//! - Host-bound routes win over host-less ones of equal specificity

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::{header, request::Parts};

use crate::config::{ProxyDirective, RouteConfig};
use crate::routing::matcher::{HostMatcher, PathPattern};

#[derive(Debug)]
pub struct Route {
    pub name: String,
    host: Option<HostMatcher>,
    path: PathPattern,
    pub directive: Arc<ProxyDirective>,
}

impl Route {
    pub fn path_prefix(&self) -> &str {
        self.path.as_str()
    }
}

/// A matched route plus the parameters its path captured.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub route: &'a Route,
    pub params: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(configs: &[RouteConfig]) -> Self {
        let mut routes: Vec<Route> = configs
            .iter()
            .map(|config| Route {
                name: config.name.clone(),
                host: config.host.as_deref().map(HostMatcher::new),
                path: PathPattern::new(config.path_prefix.clone()),
                directive: Arc::new(config.proxy.clone()),
            })
            .collect();

        // Stable sort keeps config order among equals.
        routes.sort_by(|a, b| {
            b.path
                .specificity()
                .cmp(&a.path.specificity())
                .then_with(|| b.host.is_some().cmp(&a.host.is_some()))
        });
        Self { routes }
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn match_path(&self, host: Option<&str>, path: &str) -> Option<RouteMatch<'_>> {
        self.routes.iter().find_map(|route| {
            if let Some(matcher) = &route.host {
                if !matcher.matches(host) {
                    return None;
                }
            }
            route.path.matches(path).map(|params| RouteMatch { route, params })
        })
    }

    pub fn match_request(&self, parts: &Parts) -> Option<RouteMatch<'_>> {
        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| parts.uri.host());
        self.match_path(host, parts.uri.path())
    }
}
