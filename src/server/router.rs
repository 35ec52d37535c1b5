//! Virtual hosts and location matching
//!
//! The config tree is flattened once at startup: every location becomes a
//! `Route` that carries its inherited settings and the patterns of all its
//! ancestors. Matching a request is then a single pass over a flat list.

use crate::config::{allow_header, Config, LocationBlock, LocationPattern, Method, MethodSet,
                    Redirect, ServerBlock};

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Everything needed to answer a request, resolved for one location
#[derive(Debug, Clone)]
pub struct Route {
    /// `None` for the implicit route built from server-level settings
    pub pattern: Option<LocationPattern>,
    /// Patterns of enclosing locations, all of which must match too
    constraints: Vec<LocationPattern>,
    depth: usize,

    pub methods: MethodSet,
    pub root: Option<PathBuf>,
    pub index: Vec<String>,
    pub autoindex: bool,
    pub redirect: Option<Redirect>,
    pub upload_store: Option<PathBuf>,
    pub client_max_body_size: u64,
    pub cgi_handlers: BTreeMap<String, Option<PathBuf>>,
    pub error_pages: BTreeMap<u16, String>,
}

impl Route {
    fn implicit(server: &ServerBlock) -> Route {
        Route {
            pattern: None,
            constraints: Vec::new(),
            depth: 0,
            methods: server.methods.clone(),
            root: server.root.clone(),
            index: server.index.clone(),
            autoindex: server.autoindex,
            redirect: None,
            upload_store: None,
            client_max_body_size: server.client_max_body_size,
            cgi_handlers: BTreeMap::new(),
            error_pages: server.error_pages.clone(),
        }
    }

    /// `location` inside `self`; `return` and `upload_store` don't inherit
    fn nested(&self, location: &LocationBlock, depth: usize) -> Route {
        let mut constraints = self.constraints.clone();
        if let Some(ref pattern) = self.pattern {
            constraints.push(pattern.clone());
        }

        let mut cgi_handlers = self.cgi_handlers.clone();
        cgi_handlers.extend(location.cgi_handlers.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut error_pages = self.error_pages.clone();
        error_pages.extend(location.error_pages.iter().map(|(k, v)| (*k, v.clone())));

        Route {
            pattern: Some(location.pattern.clone()),
            constraints: constraints,
            depth: depth,
            methods: location.methods.clone().unwrap_or_else(|| self.methods.clone()),
            root: location.root.clone().or_else(|| self.root.clone()),
            index: location.index.clone().unwrap_or_else(|| self.index.clone()),
            autoindex: location.autoindex.unwrap_or(self.autoindex),
            redirect: location.redirect.clone(),
            upload_store: location.upload_store.clone(),
            client_max_body_size: location.client_max_body_size
                .unwrap_or(self.client_max_body_size),
            cgi_handlers: cgi_handlers,
            error_pages: error_pages,
        }
    }

    pub fn allows(&self, method: Method) -> bool {
        self.methods.contains(&method)
    }

    /// Value for the `Allow` header
    pub fn allow(&self) -> String {
        allow_header(&self.methods)
    }

    /// How well this route matches `path`, if at all. Bigger is better.
    fn rank(&self, path: &str) -> Option<(u8, usize, usize)> {
        if !self.constraints.iter().all(|c| matches(c, path)) {
            return None;
        }

        match self.pattern {
            Some(ref p) if !matches(p, path) => None,
            Some(LocationPattern::Exact(_)) => Some((3, self.depth, 0)),
            Some(LocationPattern::Extension { .. }) => Some((2, self.depth, 0)),
            Some(LocationPattern::Prefix(ref prefix)) => Some((1, prefix.len(), self.depth)),
            None => Some((0, 0, 0)),
        }
    }
}

fn matches(pattern: &LocationPattern, path: &str) -> bool {
    match *pattern {
        LocationPattern::Exact(ref exact) => path == exact,
        LocationPattern::Prefix(ref prefix) => prefix_matches(prefix, path),
        LocationPattern::Extension { ref ext, case_insensitive } => {
            let name = path.rsplit('/').next().unwrap_or("");
            match name.rfind('.') {
                Some(dot) if case_insensitive => name[dot + 1..].eq_ignore_ascii_case(ext),
                Some(dot) => &name[dot + 1..] == ext,
                None => false,
            }
        },
    }
}

/// Prefixes match on segment boundaries: `/static` takes `/static` and
/// `/static/x` but not `/staticfoo`.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    if !path.starts_with(prefix) {
        return false;
    }
    prefix.ends_with('/') || path.len() == prefix.len()
        || path.as_bytes()[prefix.len()] == b'/'
}

/// One server block, flattened
#[derive(Debug)]
pub struct VirtualHost {
    names: Vec<String>,
    default: bool,
    routes: Vec<Route>,
    fallback: Route,
}

impl VirtualHost {
    fn new(server: &ServerBlock) -> VirtualHost {
        let fallback = Route::implicit(server);
        let mut routes = Vec::new();
        for location in &server.locations {
            flatten(&fallback, location, 1, &mut routes);
        }

        VirtualHost {
            names: server.server_names.clone(),
            default: server.is_default(),
            routes: routes,
            fallback: fallback,
        }
    }

    /// The best route for a normalized request path.
    ///
    /// Ties go to whichever location was declared first.
    pub fn route(&self, path: &str) -> &Route {
        let mut best: Option<(&Route, (u8, usize, usize))> = None;

        for route in &self.routes {
            if let Some(rank) = route.rank(path) {
                match best {
                    Some((_, best_rank)) if best_rank >= rank => (),
                    _ => best = Some((route, rank)),
                }
            }
        }

        best.map(|(r, _)| r).unwrap_or(&self.fallback)
    }

    /// The server-level settings, for requests that don't name a path
    pub fn fallback(&self) -> &Route {
        &self.fallback
    }
}

fn flatten(parent: &Route, location: &LocationBlock, depth: usize, routes: &mut Vec<Route>) {
    let route = parent.nested(location, depth);
    for child in &location.children {
        flatten(&route, child, depth + 1, routes);
    }
    routes.push(route);
}

/// All virtual hosts, grouped by the `listen` address they were declared on
///
/// `127.0.0.1:8080` and `127.0.0.2:8080` are separate groups. A wildcard and a
/// specific host on the same port can't both be bound, so that case never
/// reaches the table.
///
/// Built once from the config and shared read-only between workers.
#[derive(Debug)]
pub struct RoutingTable {
    listeners: Vec<Listener>,
}

#[derive(Debug)]
struct Listener {
    addr: String,
    port: u16,
    hosts: Vec<VirtualHost>,
}

impl Listener {
    fn is(&self, addr: &str, port: u16) -> bool {
        self.port == port && self.addr == addr
    }
}

impl RoutingTable {
    pub fn new(config: &Config) -> RoutingTable {
        let mut listeners: Vec<Listener> = Vec::new();
        for server in &config.servers {
            let vhost = VirtualHost::new(server);
            match listeners.iter_mut().find(|l| l.is(&server.host, server.port)) {
                Some(listener) => listener.hosts.push(vhost),
                None => listeners.push(Listener {
                    addr: server.host.clone(),
                    port: server.port,
                    hosts: vec![vhost],
                }),
            }
        }

        RoutingTable { listeners: listeners }
    }

    /// Picks a server block among those on `addr:port`: exact name, then
    /// `default_server`, then the first one declared.
    pub fn virtual_host(&self, addr: &str, port: u16, host: Option<&str>) -> Option<&VirtualHost> {
        let hosts = &self.listeners.iter().find(|l| l.is(addr, port))?.hosts;

        if let Some(host) = host {
            if let Some(named) = hosts.iter().find(|v| v.names.iter().any(|n| n == host)) {
                return Some(named);
            }
        }

        hosts.iter().find(|v| v.default).or_else(|| hosts.first())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::parser::parse_str;

    fn table(source: &str) -> RoutingTable {
        RoutingTable::new(&parse_str(source).unwrap())
    }

    fn location_of<'a>(host: &'a VirtualHost, path: &str) -> String {
        match host.route(path).pattern {
            Some(ref p) => p.to_string(),
            None => String::from("<server>"),
        }
    }

    const LOCATIONS: &str = r#"
        server {
            listen 8080;
            root /srv/www;
            client_max_body_size 2m;
            error_page 404 /404.html;

            location / { }
            location = /exact { }
            location /static {
                autoindex on;
                error_page 403 /403.html;
                location /static/deep {
                    methods GET;
                }
                location ~ \.py$ {
                    cgi_handler .py /usr/bin/python3;
                }
            }
            location /static/img/ { }
            location ~* \.PHP$ { }
            location /upload {
                upload_store /tmp/up;
                client_max_body_size 50k;
                location /upload/nested { }
            }
            location /old {
                return 301 /new;
            }
        }
    "#;

    #[test]
    fn exact_beats_everything() {
        let t = table(LOCATIONS);
        let host = t.virtual_host("0.0.0.0", 8080, None).unwrap();
        assert_eq!(location_of(host, "/exact"), "= /exact");
        assert_eq!(location_of(host, "/exact/more"), "/");
    }

    #[test]
    fn longest_prefix_on_segment_boundaries() {
        let t = table(LOCATIONS);
        let host = t.virtual_host("0.0.0.0", 8080, None).unwrap();
        assert_eq!(location_of(host, "/static"), "/static");
        assert_eq!(location_of(host, "/static/x.css"), "/static");
        assert_eq!(location_of(host, "/staticfoo"), "/");
        assert_eq!(location_of(host, "/static/deep/a"), "/static/deep");
        assert_eq!(location_of(host, "/static/img/a.png"), "/static/img/");
        assert_eq!(location_of(host, "/static/img"), "/static");
    }

    #[test]
    fn extensions_apply_within_their_parent() {
        let t = table(LOCATIONS);
        let host = t.virtual_host("0.0.0.0", 8080, None).unwrap();
        assert_eq!(location_of(host, "/static/deep/run.py"), "~ \\.py$");
        assert_eq!(location_of(host, "/other/run.py"), "/");
        assert_eq!(location_of(host, "/x/index.pHp"), "~* \\.PHP$");
    }

    #[test]
    fn nested_locations_inherit() {
        let t = table(LOCATIONS);
        let host = t.virtual_host("0.0.0.0", 8080, None).unwrap();

        let deep = host.route("/static/deep/file");
        assert!(deep.autoindex);
        assert_eq!(deep.allow(), "GET");
        assert_eq!(deep.root, Some(PathBuf::from("/srv/www")));
        assert_eq!(deep.error_pages.get(&403).map(|s| s.as_str()), Some("/403.html"));
        assert_eq!(deep.error_pages.get(&404).map(|s| s.as_str()), Some("/404.html"));

        let script = host.route("/static/run.py");
        assert!(script.cgi_handlers.contains_key(".py"));
        assert!(script.autoindex);

        let nested = host.route("/upload/nested/x");
        assert_eq!(nested.client_max_body_size, 50 * 1024);
        assert_eq!(nested.upload_store, None);
        assert_eq!(host.route("/upload/x").upload_store, Some(PathBuf::from("/tmp/up")));
    }

    #[test]
    fn server_settings_fill_in() {
        let t = table(LOCATIONS);
        let host = t.virtual_host("0.0.0.0", 8080, None).unwrap();
        let root = host.route("/anything");
        assert_eq!(root.client_max_body_size, 2 << 20);
        assert_eq!(root.allow(), "GET, HEAD, POST, DELETE");
        assert_eq!(host.route("/old").redirect.as_ref().map(|r| r.code), Some(301));
    }

    #[test]
    fn implicit_route_without_locations() {
        let t = table("server { listen 8080; root /srv; }");
        let host = t.virtual_host("0.0.0.0", 8080, None).unwrap();
        assert_eq!(location_of(host, "/x"), "<server>");
    }

    const VHOSTS: &str = r#"
        server { listen 8080; server_name first.test; root /a; }
        server { listen 8080 default_server; server_name fallback.test; root /b; }
        server { listen 8080; server_name third.test; root /c; }
        server { listen 9090; server_name only.test; root /d; }
    "#;

    fn root_for(t: &RoutingTable, port: u16, host: Option<&str>) -> Option<PathBuf> {
        t.virtual_host("0.0.0.0", port, host).and_then(|v| v.fallback().root.clone())
    }

    #[test]
    fn virtual_host_selection() {
        let t = table(VHOSTS);
        assert_eq!(root_for(&t, 8080, Some("third.test")), Some(PathBuf::from("/c")));
        assert_eq!(root_for(&t, 8080, Some("unknown.test")), Some(PathBuf::from("/b")));
        assert_eq!(root_for(&t, 8080, None), Some(PathBuf::from("/b")));
        assert_eq!(root_for(&t, 9090, Some("nope")), Some(PathBuf::from("/d")));
        assert_eq!(root_for(&t, 7070, None), None);
    }

    #[test]
    fn listen_hosts_are_kept_apart() {
        let t = table("server { listen 127.0.0.1:8080; server_name a.test; root /a; }\n\
                       server { listen 127.0.0.2:8080; server_name b.test; root /b; }");
        let root = |addr: &str, host: Option<&str>| {
            t.virtual_host(addr, 8080, host).and_then(|v| v.fallback().root.clone())
        };

        assert_eq!(root("127.0.0.1", Some("b.test")), Some(PathBuf::from("/a")));
        assert_eq!(root("127.0.0.2", Some("a.test")), Some(PathBuf::from("/b")));
        assert_eq!(root("0.0.0.0", None), None);
    }
}
