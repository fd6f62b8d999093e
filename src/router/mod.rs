use crate::errors::GatewayError;


/// How the mount-relative path is turned into the upstream path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathRewrite {
    /// Forward the path with the route prefix removed.
    Relative,
    /// Prefix the mount-relative path.
    Prepend(String),
    /// Prefix the mount-relative path unless it already sits under the prefix.
    EnsurePrefix(String),
    /// Forward the full inbound path, route prefix included.
    Original,
}

impl PathRewrite {
    pub fn apply(&self, original: &str, relative: &str) -> String {
        match self {
            Self::Relative => relative.to_string(),
            Self::Prepend(prefix) => format!("{}{}", prefix, relative),
            Self::EnsurePrefix(prefix) if has_segment_prefix(relative, prefix) => relative.to_string(),
            Self::EnsurePrefix(prefix) => format!("{}{}", prefix, relative),
            Self::Original => original.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Route {
    pub prefix: String,
    /// Label used in logs and error bodies.
    pub service: &'static str,
    pub upstream: String,
    pub rewrite: PathRewrite,
    pub forward_cookies: bool,
    pub relay_set_cookie: bool,
    pub preserve_host: bool,
}

impl Route {
    pub fn new(prefix: &str, service: &'static str, upstream: impl Into<String>, rewrite: PathRewrite) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            service,
            upstream: upstream.into().trim_end_matches('/').to_string(),
            rewrite,
            forward_cookies: false,
            relay_set_cookie: false,
            preserve_host: false,
        }
    }

    pub fn forward_cookies(mut self, enabled: bool) -> Self {
        self.forward_cookies = enabled;
        self
    }

    pub fn relay_set_cookie(mut self, enabled: bool) -> Self {
        self.relay_set_cookie = enabled;
        self
    }

    pub fn preserve_host(mut self, enabled: bool) -> Self {
        self.preserve_host = enabled;
        self
    }

    /// Returns the mount-relative path when `path` falls under this route.
    pub fn matches<'a>(&self, path: &'a str) -> Option<&'a str> {
        if !has_segment_prefix(path, &self.prefix) {
            return None;
        }
        let rest = &path[self.prefix.len()..];
        Some(if rest.is_empty() { "/" } else { rest })
    }

    /// Upstream URL for an inbound path and optional raw query string.
    pub fn target_url(&self, original: &str, relative: &str, query: Option<&str>) -> String {
        let mut url = format!("{}{}", self.upstream, self.rewrite.apply(original, relative));
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}

/// Ordered, first-match-wins route table.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Fails when a route can never be reached because an earlier prefix
    /// already covers it.
    pub fn new(routes: Vec<Route>) -> Result<Self, GatewayError> {
        for (i, later) in routes.iter().enumerate() {
            if let Some(earlier) = routes[..i].iter().find(|r| has_segment_prefix(&later.prefix, &r.prefix)) {
                return Err(GatewayError::Config(format!(
                    "route {} is shadowed by earlier route {}",
                    later.prefix, earlier.prefix
                )));
            }
        }
        Ok(Self { routes })
    }

    /// Selects the route for `path`, along with the mount-relative path.
    pub fn route_for<'a>(&self, path: &'a str) -> Option<(&Route, &'a str)> {
        self.routes
            .iter()
            .find_map(|route| route.matches(path).map(|relative| (route, relative)))
    }

    /// Selects the route for `path` and returns it with the rewritten path.
    pub fn resolve(&self, path: &str) -> Option<(&Route, String)> {
        self.route_for(path)
            .map(|(route, relative)| (route, route.rewrite.apply(path, relative)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn has_segment_prefix(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    path.strip_prefix(prefix)
        .map(|rest| rest.is_empty() || rest.starts_with('/'))
        .unwrap_or(false)
}
