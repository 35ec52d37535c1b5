use super::*;
use super::lexer::{tokenize, Token, TokenKind};

use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Braces may not nest deeper than this, whatever the directives are
const MAX_BRACE_DEPTH: usize = 16;

/// `server` plus at most three levels of `location`
const MAX_LOCATION_DEPTH: usize = 4;

pub fn parse_file<P: AsRef<Path>>(conf: P) -> Result<Config, Error> {
    let mut source = String::new();
    {
        let mut f = File::open(conf)?;
        f.read_to_string(&mut source)?;
    }

    parse_str(&source)
}

/// Parses and validates config text.
///
/// CLI overrides are applied by the caller to the returned `limits`.
pub fn parse_str(source: &str) -> Result<Config, Error> {
    let tokens = tokenize(source).map_err(Error::Syntax)?;
    if tokens.is_empty() {
        return Err(Error::Validation(ErrorMessage {
            desc: String::from("configuration file is empty"),
            line: 1,
            column: 1,
        }));
    }

    let tree = TreeBuilder { tokens: tokens, pos: 0 }.block(0, None)?;
    config_from_tree(tree)
}

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Syntax(ErrorMessage),
    Validation(ErrorMessage),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Io(ref e) => write!(f, "{}", e),
            Error::Syntax(ref m) => write!(f, "syntax error at line {} column {}: {}",
                                           m.line, m.column, m.desc),
            Error::Validation(ref m) => write!(f, "error at line {} column {}: {}",
                                               m.line, m.column, m.desc),
        }
    }
}

/// An owned, rendered diagnostic with its source position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub desc: String,
    pub line: usize,
    pub column: usize,
}

/// A directive before any meaning is attached to it
#[derive(Debug)]
struct Directive {
    name: String,
    args: Vec<String>,
    block: Option<Vec<Directive>>,
    line: usize,
    column: usize,
}

impl Directive {
    fn invalid(&self, desc: String) -> Error {
        Error::Validation(ErrorMessage {
            desc: desc,
            line: self.line,
            column: self.column,
        })
    }

    fn single_arg(&self) -> Result<&str, Error> {
        match self.args.len() {
            0 => Err(self.requires_value()),
            1 if self.args[0].is_empty() => Err(self.requires_value()),
            1 => Ok(self.args[0].as_str()),
            _ => Err(self.invalid(format!("'{}' directive takes exactly one argument",
                                          self.name))),
        }
    }

    fn requires_value(&self) -> Error {
        self.invalid(format!("{} directive requires a value", self.name))
    }
}

struct TreeBuilder {
    tokens: Vec<Token>,
    pos: usize,
}

fn syntax(token: &Token, desc: String) -> Error {
    Error::Syntax(ErrorMessage {
        desc: desc,
        line: token.line,
        column: token.column,
    })
}

impl TreeBuilder {
    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    /// Reads directives until the closing brace of the block opened by
    /// `opener`, or until end of input at top level.
    fn block(&mut self, depth: usize, opener: Option<&Token>) -> Result<Vec<Directive>, Error> {
        let mut directives = Vec::new();

        loop {
            let token = match self.next() {
                Some(t) => t,
                None => match opener {
                    Some(open) => return Err(syntax(open, String::from(
                        "unclosed block (missing '}')"))),
                    None => return Ok(directives),
                },
            };

            let name = match token.kind {
                TokenKind::Word(ref name) => name.clone(),
                TokenKind::CloseBrace if opener.is_some() => return Ok(directives),
                TokenKind::CloseBrace => return Err(syntax(&token, String::from("unexpected '}'"))),
                TokenKind::OpenBrace => return Err(syntax(&token, String::from("unexpected '{'"))),
                TokenKind::Semicolon => return Err(syntax(&token, String::from("unexpected ';'"))),
            };

            directives.push(self.directive(name, &token, depth)?);
        }
    }

    fn directive(&mut self, name: String, start: &Token, depth: usize) -> Result<Directive, Error> {
        let mut args = Vec::new();
        let mut last_line = start.line;
        let missing_semicolon = || syntax(start, format!(
            "missing semicolon after '{}' directive", name));

        loop {
            let token = match self.next() {
                Some(t) => t,
                None => return Err(missing_semicolon()),
            };

            match token.kind {
                TokenKind::Word(ref arg) => {
                    if token.line > last_line {
                        return Err(missing_semicolon());
                    }
                    last_line = token.line;
                    args.push(arg.clone());
                },
                TokenKind::Semicolon => {
                    return Ok(Directive {
                        name: name.clone(),
                        args: args,
                        block: None,
                        line: start.line,
                        column: start.column,
                    });
                },
                TokenKind::OpenBrace => {
                    if depth + 1 >= MAX_BRACE_DEPTH {
                        return Err(syntax(&token, format!(
                            "blocks nested beyond maximum depth of {}", MAX_BRACE_DEPTH)));
                    }
                    let block = self.block(depth + 1, Some(&token))?;
                    return Ok(Directive {
                        name: name.clone(),
                        args: args,
                        block: Some(block),
                        line: start.line,
                        column: start.column,
                    });
                },
                TokenKind::CloseBrace => return Err(missing_semicolon()),
            }
        }
    }
}

/// Directives that mean something somewhere, used to tell a misplaced
/// directive from a misspelled one
const KNOWN_DIRECTIVES: &[&str] = &[
    "server", "listen", "server_name", "root", "index", "autoindex",
    "client_max_body_size", "error_page", "location", "methods", "return",
    "upload_store", "cgi_handler", "default",
];

fn unknown_or_misplaced(directive: &Directive, context: &str) -> Error {
    if KNOWN_DIRECTIVES.contains(&directive.name.as_str()) {
        directive.invalid(format!("'{}' directive is not allowed in {} context",
                                  directive.name, context))
    }
    else if directive.block.is_some() {
        directive.invalid(format!("unexpected block directive '{}': block not permitted here",
                                  directive.name))
    }
    else {
        directive.invalid(format!("unknown directive '{}'", directive.name))
    }
}

fn config_from_tree(tree: Vec<Directive>) -> Result<Config, Error> {
    let mut servers = Vec::new();

    for directive in &tree {
        match (directive.name.as_str(), &directive.block) {
            ("server", &Some(ref body)) => {
                if !directive.args.is_empty() {
                    return Err(directive.invalid(String::from(
                        "'server' directive takes no arguments")));
                }
                servers.push(server_from_block(directive, body)?);
            },
            ("server", &None) => return Err(directive.invalid(String::from(
                "'server' directive requires a block"))),
            (name, _) if KNOWN_DIRECTIVES.contains(&name) => {
                return Err(directive.invalid(format!(
                    "'{}' directive is not allowed outside server context", name)));
            },
            _ => return Err(unknown_or_misplaced(directive, "main")),
        }
    }

    if servers.is_empty() {
        return Err(Error::Validation(ErrorMessage {
            desc: String::from("no server block defined"),
            line: 1,
            column: 1,
        }));
    }

    check_virtual_hosts(&servers)?;

    Ok(Config {
        servers: servers,
        limits: Limits::default(),
    })
}

/// Names are unique per `listen` address, and each address has at most one
/// default
fn check_virtual_hosts(servers: &[ServerBlock]) -> Result<(), Error> {
    let mut names = HashSet::new();
    let mut defaults = HashSet::new();

    for server in servers {
        let at = |desc| Error::Validation(ErrorMessage {
            desc: desc,
            line: server.line,
            column: 1,
        });

        for name in &server.server_names {
            if !names.insert((&server.host, server.port, name.as_str())) {
                return Err(at(format!("duplicate server_name '{}' on {}:{}",
                                      name, server.host, server.port)));
            }
        }

        if server.is_default() && !defaults.insert((&server.host, server.port)) {
            return Err(at(format!("default server for {}:{} already defined",
                                  server.host, server.port)));
        }
    }

    Ok(())
}

/// Tracks single-valued directives so a repeat is an error
struct Seen<'a>(HashSet<&'a str>);

impl<'a> Seen<'a> {
    fn once(&mut self, directive: &'a Directive) -> Result<(), Error> {
        if !self.0.insert(&directive.name) {
            return Err(directive.invalid(format!("duplicate '{}' directive", directive.name)));
        }
        Ok(())
    }
}

fn server_from_block(directive: &Directive, body: &[Directive]) -> Result<ServerBlock, Error> {
    let mut server = ServerBlock::default();
    server.line = directive.line;
    let mut seen = Seen(HashSet::new());

    for child in body {
        if child.block.is_some() && child.name != "location" {
            if child.name == "server" {
                return Err(child.invalid(String::from(
                    "'server' directive is not allowed in server context")));
            }
            return Err(child.invalid(format!(
                "unexpected block directive '{}': block not permitted here", child.name)));
        }

        match child.name.as_str() {
            "listen" => {
                seen.once(child)?;
                parse_listen(child, &mut server)?;
            },
            // Shorthand for `listen ... default_server`
            "default" => {
                seen.once(child)?;
                if !child.args.is_empty() {
                    return Err(child.invalid(String::from(
                        "'default' directive takes no arguments")));
                }
                server.default_server = true;
            },
            "server_name" => {
                seen.once(child)?;
                if child.args.is_empty() || child.args.iter().any(|a| a.is_empty()) {
                    return Err(child.requires_value());
                }
                server.server_names = child.args.iter().map(|a| a.to_ascii_lowercase()).collect();
            },
            "root" => {
                seen.once(child)?;
                server.root = Some(PathBuf::from(child.single_arg()?));
            },
            "index" => {
                seen.once(child)?;
                server.index = parse_index(child)?;
            },
            "autoindex" => {
                seen.once(child)?;
                server.autoindex = parse_autoindex(child)?;
            },
            "client_max_body_size" => {
                seen.once(child)?;
                server.client_max_body_size = parse_body_size(child)?;
            },
            "error_page" => parse_error_page(child, &mut server.error_pages)?,
            "methods" => {
                seen.once(child)?;
                server.methods = parse_methods(child)?;
            },
            "location" => {
                let location = location_from_block(child, 2, &server.locations)?;
                server.locations.push(location);
            },
            _ => return Err(unknown_or_misplaced(child, "server")),
        }
    }

    if server.root.is_none() && (server.locations.is_empty() ||
                                 server.locations.iter().any(|l| needs_root(l, false))) {
        return Err(directive.invalid(String::from(
            "missing root directive in server block")));
    }

    Ok(server)
}

/// Whether some location in this subtree could serve files but has no root
fn needs_root(location: &LocationBlock, inherited: bool) -> bool {
    let has_root = inherited || location.root.is_some();
    if !has_root && location.redirect.is_none() {
        return true;
    }
    location.children.iter().any(|c| needs_root(c, has_root))
}

fn parse_listen(directive: &Directive, server: &mut ServerBlock) -> Result<(), Error> {
    let address = match directive.args.len() {
        0 => return Err(directive.requires_value()),
        1 => &directive.args[0],
        2 if directive.args[1] == "default_server" => {
            server.default_server = true;
            &directive.args[0]
        },
        2 => return Err(directive.invalid(format!(
            "invalid parameter '{}' in listen directive", directive.args[1]))),
        _ => return Err(directive.invalid(String::from(
            "listen directive takes an address and an optional default_server"))),
    };

    let port_text = match address.rfind(':') {
        Some(i) => {
            let host = &address[..i];
            if host.is_empty() {
                return Err(directive.invalid(format!("invalid listen host in '{}'", address)));
            }
            server.host = String::from(host);
            &address[i + 1..]
        },
        None => &address[..],
    };

    if port_text.is_empty() || !port_text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(directive.invalid(format!(
            "invalid port '{}': not a valid number", port_text)));
    }

    match port_text.parse::<u32>() {
        Ok(p) if p >= 1 && p <= 65535 => {
            server.port = p as u16;
            Ok(())
        },
        _ => Err(directive.invalid(format!(
            "invalid port '{}': must be between 1 and 65535", port_text))),
    }
}

fn parse_index(directive: &Directive) -> Result<Vec<String>, Error> {
    if directive.args.is_empty() || directive.args.iter().any(|a| a.is_empty()) {
        return Err(directive.requires_value());
    }
    Ok(directive.args.clone())
}

fn parse_autoindex(directive: &Directive) -> Result<bool, Error> {
    match directive.single_arg()? {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(directive.invalid(format!(
            "invalid autoindex value '{}': expected 'on' or 'off'", other))),
    }
}

fn parse_body_size(directive: &Directive) -> Result<u64, Error> {
    let text = directive.single_arg()?;
    match parse_size(text) {
        Some(n) if n > MAX_BODY_SIZE_CEILING => Err(directive.invalid(format!(
            "client_max_body_size '{}' exceeds limit of 1g", text))),
        Some(n) => Ok(n),
        None => Err(directive.invalid(format!(
            "invalid client_max_body_size '{}': expected a number with optional k, m or g suffix",
            text))),
    }
}

fn parse_status_code(text: &str) -> Option<u16> {
    if text.len() != 3 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse::<u16>().ok().and_then(|c| if c >= 100 && c <= 599 { Some(c) } else { None })
}

fn parse_error_page(directive: &Directive, pages: &mut BTreeMap<u16, String>) -> Result<(), Error> {
    if directive.args.len() < 2 {
        return Err(directive.invalid(String::from(
            "error_page directive requires at least one status code and a path")));
    }

    let (path, codes) = match directive.args.split_last() {
        Some(split) => split,
        None => return Err(directive.requires_value()),
    };

    if path.is_empty() || path.bytes().all(|b| b.is_ascii_digit()) {
        return Err(directive.invalid(String::from("error_page directive is missing a path")));
    }

    for code in codes {
        match parse_status_code(code) {
            Some(c) => { pages.insert(c, path.clone()); },
            None => return Err(directive.invalid(format!(
                "invalid status code '{}' in error_page", code))),
        }
    }

    Ok(())
}

fn parse_methods(directive: &Directive) -> Result<MethodSet, Error> {
    if directive.args.is_empty() {
        return Err(directive.invalid(String::from(
            "methods directive is empty: at least one method is required")));
    }

    let mut methods = MethodSet::new();
    for arg in &directive.args {
        match arg.parse::<Method>() {
            Ok(m) => { methods.insert(m); },
            Err(()) => return Err(directive.invalid(format!(
                "unknown method '{}' in methods directive", arg))),
        }
    }

    Ok(methods)
}

fn parse_return(directive: &Directive) -> Result<Redirect, Error> {
    let (code_text, target) = match directive.args.len() {
        0 => return Err(directive.requires_value()),
        1 => (&directive.args[0], None),
        2 => (&directive.args[0], Some(directive.args[1].clone())),
        _ => return Err(directive.invalid(String::from(
            "return directive takes a status code and an optional target"))),
    };

    let code = match parse_status_code(code_text) {
        Some(c) if c >= 200 => c,
        Some(c) => return Err(directive.invalid(format!(
            "return {} is an interim status; use 200 to 599", c))),
        None => return Err(directive.invalid(format!(
            "invalid status code '{}' in return", code_text))),
    };

    let redirect = Redirect { code: code, target: target };
    if redirect.is_redirect() && redirect.target.as_ref().map_or(true, |t| t.is_empty()) {
        return Err(directive.invalid(format!("return {} requires a target URL", code)));
    }

    Ok(redirect)
}

fn parse_cgi_handler(directive: &Directive, handlers: &mut BTreeMap<String, Option<PathBuf>>)
                     -> Result<(), Error>
{
    let (ext, interpreter) = match directive.args.len() {
        0 => return Err(directive.requires_value()),
        1 => (&directive.args[0], None),
        2 if directive.args[1].is_empty() => (&directive.args[0], None),
        2 => (&directive.args[0], Some(PathBuf::from(&directive.args[1]))),
        _ => return Err(directive.invalid(String::from(
            "cgi_handler directive takes an extension and an optional interpreter"))),
    };

    if !ext.starts_with('.') || ext.len() < 2 {
        return Err(directive.invalid(format!(
            "invalid cgi_handler extension '{}': extension must start with '.' (missing dot)",
            ext)));
    }

    handlers.insert(ext.clone(), interpreter);
    Ok(())
}

fn location_pattern(directive: &Directive) -> Result<LocationPattern, Error> {
    let (modifier, path) = match directive.args.len() {
        0 => return Err(directive.requires_value()),
        1 => (None, &directive.args[0]),
        2 => (Some(directive.args[0].as_str()), &directive.args[1]),
        _ => return Err(directive.invalid(String::from(
            "location directive takes an optional modifier and a path"))),
    };

    match modifier {
        None | Some("=") => {
            if !path.starts_with('/') {
                return Err(directive.invalid(format!(
                    "location path '{}' must start with '/'", path)));
            }
            if modifier.is_some() {
                Ok(LocationPattern::Exact(path.clone()))
            }
            else {
                Ok(LocationPattern::Prefix(path.clone()))
            }
        },
        Some(m @ "~") | Some(m @ "~*") => {
            let ext = path.strip_prefix("\\.").and_then(|p| p.strip_suffix('$'));
            match ext {
                Some(ext) if !ext.is_empty() &&
                    ext.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') => {
                    Ok(LocationPattern::Extension {
                        ext: String::from(ext),
                        case_insensitive: m == "~*",
                    })
                },
                _ => Err(directive.invalid(format!(
                    "unsupported location regex '{}': only '\\.ext$' patterns are supported",
                    path))),
            }
        },
        Some(m) => Err(directive.invalid(format!("unsupported location modifier '{}'", m))),
    }
}

fn location_from_block(directive: &Directive, depth: usize, siblings: &[LocationBlock])
                       -> Result<LocationBlock, Error>
{
    if depth > MAX_LOCATION_DEPTH {
        return Err(directive.invalid(format!(
            "location nested beyond maximum depth of {} levels", MAX_LOCATION_DEPTH)));
    }

    let body = match directive.block {
        Some(ref body) => body,
        None => return Err(directive.invalid(String::from(
            "location directive requires a block"))),
    };

    let pattern = location_pattern(directive)?;
    if siblings.iter().any(|s| s.pattern == pattern) {
        return Err(directive.invalid(format!("duplicate location '{}'", pattern)));
    }

    let mut location = LocationBlock::new(pattern, directive.line);
    let mut seen = Seen(HashSet::new());

    for child in body {
        if child.block.is_some() && child.name != "location" {
            return Err(child.invalid(format!(
                "unexpected block directive '{}': block not permitted here", child.name)));
        }

        match child.name.as_str() {
            "root" => {
                seen.once(child)?;
                location.root = Some(PathBuf::from(child.single_arg()?));
            },
            "index" => {
                seen.once(child)?;
                location.index = Some(parse_index(child)?);
            },
            "autoindex" => {
                seen.once(child)?;
                location.autoindex = Some(parse_autoindex(child)?);
            },
            "client_max_body_size" => {
                seen.once(child)?;
                location.client_max_body_size = Some(parse_body_size(child)?);
            },
            "error_page" => parse_error_page(child, &mut location.error_pages)?,
            "methods" => {
                seen.once(child)?;
                location.methods = Some(parse_methods(child)?);
            },
            "return" => {
                seen.once(child)?;
                location.redirect = Some(parse_return(child)?);
            },
            "upload_store" => {
                seen.once(child)?;
                location.upload_store = Some(PathBuf::from(child.single_arg()?));
            },
            "cgi_handler" => parse_cgi_handler(child, &mut location.cgi_handlers)?,
            "location" => {
                if let LocationPattern::Exact(_) = location.pattern {
                    return Err(child.invalid(String::from(
                        "nested location not allowed inside exact match location")));
                }
                let nested = location_from_block(child, depth + 1, &location.children)?;
                location.children.push(nested);
            },
            _ => return Err(unknown_or_misplaced(child, "location")),
        }
    }

    if location.redirect.is_some() {
        let conflicting = [("root", location.root.is_some()),
                           ("index", location.index.is_some()),
                           ("autoindex", location.autoindex.is_some()),
                           ("upload_store", location.upload_store.is_some())];
        for &(name, present) in &conflicting {
            if present {
                return Err(directive.invalid(format!(
                    "conflicting directives: 'return' cannot be used together with '{}'",
                    name)));
            }
        }
    }

    Ok(location)
}
