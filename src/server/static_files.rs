//! Handlers for static file service

use crate::errors::{Error, Result};
use crate::filesystem::{contained_canonical, html_escape, join_under, percent_encode_path};
use crate::server::request::{Request, Target};
use crate::server::response::{Body, Response};
use crate::server::router::Route;
use crate::server::Handler;

use httpdate::fmt_http_date;

use std::fs::{self, canonicalize, File};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

/// A handler for static files
pub struct Statics;

/// Filesystem failures as the client should see them
fn file_error(e: io::Error) -> Error {
    match e.kind() {
        ErrorKind::PermissionDenied => Error::PermissionDenied,
        ErrorKind::NotFound => Error::NotFound,
        _ => {
            debug!("Treating filesystem error as not found: {}", e);
            Error::NotFound
        },
    }
}

/// The canonical root and the canonical file for `path`, which must exist
/// and stay under that root.
fn resolve(route: &Route, path: &str) -> Result<(PathBuf, PathBuf)> {
    let root = route.root.as_ref().ok_or(Error::NotFound)?;
    let root = canonicalize(root).map_err(|e| {
        warn!("Document root {:?} is unusable: {}", root, e);
        Error::NotFound
    })?;

    let file = match contained_canonical(&root, &join_under(&root, path)) {
        Ok(file) => file,
        Err(Error::Io(e)) => return Err(file_error(e)),
        Err(e) => return Err(e),
    };
    Ok((root, file))
}

fn serve_file(path: &Path) -> Result<Response> {
    let file = File::open(path).map_err(file_error)?;
    let meta = file.metadata().map_err(file_error)?;
    if !meta.is_file() {
        return Err(Error::PermissionDenied);
    }

    let media = mime_guess::from_path(path).first_or_octet_stream();

    let mut res = Response::new(200);
    res.headers_mut().append("Content-Type", media.as_ref());
    if let Ok(modified) = meta.modified() {
        res.headers_mut().append("Last-Modified", fmt_http_date(modified));
    }
    res.set_body(Body::File(file, meta.len()));
    Ok(res)
}

/// `301` to the same path with a trailing slash, query kept
fn add_trailing_slash(target: &Target) -> Response {
    let mut location = percent_encode_path(&target.path);
    location.push('/');
    if let Some(ref query) = target.query {
        location.push('?');
        location.push_str(query);
    }
    Response::redirect(301, &location)
}

fn listing(dir: &Path, request_path: &str) -> Result<Response> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(file_error)? {
        let entry = entry.map_err(file_error)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        entries.push((name, entry.path().is_dir()));
    }
    entries.sort();

    let title = html_escape(request_path);
    let mut body = format!("<!doctype html><html><head><title>Index of {0}</title></head>\
                            <body><h1>Index of {0}</h1><ul><li><a href=\"../\">../</a></li>",
                           title);
    for (name, is_dir) in entries {
        let slash = if is_dir { "/" } else { "" };
        body.push_str(&format!("<li><a href=\"{}{}\">{}{}</a></li>",
                               percent_encode_path(&name), slash, html_escape(&name), slash));
    }
    body.push_str("</ul></body></html>");

    Ok(Response::html(200, body))
}

impl Statics {
    pub fn new() -> Statics {
        Statics
    }

    /// Removes the regular file `req` names
    pub fn delete(&self, req: &Request, route: &Route) -> Result<Response> {
        let (_, path) = resolve(route, &req.target.path)?;
        let meta = fs::metadata(&path).map_err(file_error)?;
        if meta.is_dir() {
            return Err(Error::PermissionDenied);
        }

        fs::remove_file(&path).map_err(file_error)?;
        info!("Deleted {:?}", path);
        Ok(Response::new(204))
    }
}

impl Handler for Statics {
    fn handle(&self, req: &Request, route: &Route) -> Result<Response> {
        let (root, path) = resolve(route, &req.target.path)?;
        let meta = fs::metadata(&path).map_err(file_error)?;

        if !meta.is_dir() {
            return serve_file(&path);
        }

        if !req.target.path.ends_with('/') {
            return Ok(add_trailing_slash(&req.target));
        }

        for index in &route.index {
            match contained_canonical(&root, &path.join(index)) {
                Ok(ref candidate) if candidate.is_file() => return serve_file(candidate),
                Err(Error::PathTraversal) => return Err(Error::PathTraversal),
                _ => continue,
            }
        }

        if route.autoindex {
            listing(&path, &req.target.path)
        }
        else {
            Err(Error::NotFound)
        }
    }
}
