// Copyright 2020 Joyent, Inc.

//! Hierarchical endpoint tree.
//!
//! Parents own their children; a child only keeps a weak link back to its
//! parent, used to compute its URL. Requests are always resolved by walking
//! down from the node `dispatch` is called on, normally the root.

use std::collections::{BTreeMap, HashMap};
use std::sync::{
    Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};

use crate::error::Error;
use crate::protocol::{Method, Request, Response};

/// Segments kept back for built-in behaviour.
pub const RESERVED_SEGMENTS: [&str; 4] = ["public", "private", "doc", "docs"];

/// The remainder of a handler chain.
pub trait Next {
    fn call(&self, req: &mut Request, resp: &mut Response) -> Result<(), Error>;
}

/// A request handler. Handlers run in registration order; each one decides
/// whether the rest of the chain runs by calling `next`.
pub trait Handler: Send + Sync + 'static {
    fn handle(
        &self,
        req: &mut Request,
        resp: &mut Response,
        next: &dyn Next,
    ) -> Result<(), Error>;
}

impl<F> Handler for F
where
    F: Fn(&mut Request, &mut Response, &dyn Next) -> Result<(), Error>
        + Send
        + Sync
        + 'static,
{
    fn handle(
        &self,
        req: &mut Request,
        resp: &mut Response,
        next: &dyn Next,
    ) -> Result<(), Error> {
        self(req, resp, next)
    }
}

struct Chain<'a> {
    handlers: &'a [Arc<dyn Handler>],
}

impl Next for Chain<'_> {
    fn call(&self, req: &mut Request, resp: &mut Response) -> Result<(), Error> {
        match self.handlers.split_first() {
            Some((head, rest)) => head.handle(req, resp, &Chain { handlers: rest }),
            None => Ok(()),
        }
    }
}

struct Links {
    depth: usize,
    parent: Option<Weak<Node>>,
    children: BTreeMap<String, Endpoint>,
}

struct Node {
    segment: String,
    root: bool,
    links: RwLock<Links>,
    handlers: RwLock<HashMap<Method, Vec<Arc<dyn Handler>>>>,
}

#[derive(Clone)]
pub struct Endpoint {
    node: Arc<Node>,
}

/// Outcome of resolving a path: the terminal endpoint plus the values
/// captured by parametric segments, in path order.
pub struct Route {
    pub endpoint: Endpoint,
    pub params: Vec<(String, String)>,
}

pub fn new_root_endpoint() -> Endpoint {
    Endpoint::root()
}

pub fn new_endpoint(segment: &str) -> Result<Endpoint, Error> {
    Endpoint::new(segment)
}

static ATTACH: Mutex<()> = Mutex::new(());

fn invalid(segment: &str, reason: &'static str) -> Error {
    Error::InvalidSegment {
        segment: segment.to_string(),
        reason,
    }
}

impl Endpoint {
    fn with_node(segment: String, root: bool) -> Endpoint {
        Endpoint {
            node: Arc::new(Node {
                segment,
                root,
                links: RwLock::new(Links {
                    depth: 0,
                    parent: None,
                    children: BTreeMap::new(),
                }),
                handlers: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn root() -> Endpoint {
        Endpoint::with_node(String::new(), true)
    }

    /// A detached endpoint. The segment is trimmed; it may not be empty,
    /// contain `/` or name a reserved segment.
    pub fn new(segment: &str) -> Result<Endpoint, Error> {
        if segment.contains('/') {
            return Err(invalid(segment, "segments may not contain '/'"));
        }
        let trimmed = segment.trim();
        if trimmed.is_empty() {
            return Err(invalid(segment, "segments may not be empty"));
        }
        if RESERVED_SEGMENTS.contains(&trimmed) {
            return Err(invalid(segment, "segment is reserved"));
        }
        Ok(Endpoint::with_node(trimmed.to_string(), false))
    }

    fn links(&self) -> RwLockReadGuard<Links> {
        self.node.links.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn links_mut(&self) -> RwLockWriteGuard<Links> {
        self.node.links.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn segment(&self) -> &str {
        &self.node.segment
    }

    pub fn is_root(&self) -> bool {
        self.node.root
    }

    pub fn depth(&self) -> usize {
        self.links().depth
    }

    pub fn parent(&self) -> Option<Endpoint> {
        self.links()
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|node| Endpoint { node })
    }

    pub fn child(&self, segment: &str) -> Option<Endpoint> {
        self.links().children.get(segment).cloned()
    }

    pub fn children(&self) -> Vec<Endpoint> {
        self.links().children.values().cloned().collect()
    }

    pub fn url(&self) -> String {
        let mut segments = Vec::new();
        let mut current = Some(self.clone());
        while let Some(endpoint) = current {
            if !endpoint.is_root() {
                segments.push(endpoint.segment().to_string());
            }
            current = endpoint.parent();
        }
        segments.reverse();
        format!("/{}", segments.join("/"))
    }

    fn has_ancestor(&self, other: &Endpoint) -> bool {
        let mut current = self.parent();
        while let Some(endpoint) = current {
            if Arc::ptr_eq(&endpoint.node, &other.node) {
                return true;
            }
            current = endpoint.parent();
        }
        false
    }

    /// Attaches `child` beneath this endpoint and returns it. A child can
    /// only ever have one parent.
    pub fn sub(&self, child: &Endpoint) -> Result<Endpoint, Error> {
        // One attachment at a time across every tree, so the ancestry walk
        // and the link it guards cannot interleave with another attach.
        let _attaching = ATTACH.lock().unwrap_or_else(PoisonError::into_inner);
        if child.is_root() {
            return Err(invalid("", "the root endpoint cannot be attached"));
        }
        if Arc::ptr_eq(&self.node, &child.node) || self.has_ancestor(child) {
            return Err(Error::CyclicAttach(child.url()));
        }

        let depth = {
            let mut parent_links = self.links_mut();
            let mut child_links = child.links_mut();
            if child_links.parent.is_some() {
                return Err(Error::AlreadyAttached(child.segment().to_string()));
            }
            if parent_links.children.contains_key(child.segment()) {
                return Err(Error::DuplicateSegment {
                    parent: self.segment().to_string(),
                    segment: child.segment().to_string(),
                });
            }
            child_links.parent = Some(Arc::downgrade(&self.node));
            parent_links
                .children
                .insert(child.segment().to_string(), child.clone());
            parent_links.depth + 1
        };

        child.set_depth(depth);
        Ok(child.clone())
    }

    fn set_depth(&self, depth: usize) {
        let children = {
            let mut links = self.links_mut();
            links.depth = depth;
            links.children.values().cloned().collect::<Vec<_>>()
        };
        for child in children {
            child.set_depth(depth + 1);
        }
    }

    /// Appends a handler to the chain for `method`.
    pub fn on(&self, method: Method, handler: Arc<dyn Handler>) -> &Self {
        self.node
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(method)
            .or_default()
            .push(handler);
        self
    }

    pub fn head<F>(&self, handler: F) -> &Self
    where
        F: Fn(&mut Request, &mut Response, &dyn Next) -> Result<(), Error>
            + Send
            + Sync
            + 'static,
    {
        self.on(Method::Head, Arc::new(handler))
    }

    pub fn get<F>(&self, handler: F) -> &Self
    where
        F: Fn(&mut Request, &mut Response, &dyn Next) -> Result<(), Error>
            + Send
            + Sync
            + 'static,
    {
        self.on(Method::Get, Arc::new(handler))
    }

    pub fn post<F>(&self, handler: F) -> &Self
    where
        F: Fn(&mut Request, &mut Response, &dyn Next) -> Result<(), Error>
            + Send
            + Sync
            + 'static,
    {
        self.on(Method::Post, Arc::new(handler))
    }

    pub fn put<F>(&self, handler: F) -> &Self
    where
        F: Fn(&mut Request, &mut Response, &dyn Next) -> Result<(), Error>
            + Send
            + Sync
            + 'static,
    {
        self.on(Method::Put, Arc::new(handler))
    }

    pub fn patch<F>(&self, handler: F) -> &Self
    where
        F: Fn(&mut Request, &mut Response, &dyn Next) -> Result<(), Error>
            + Send
            + Sync
            + 'static,
    {
        self.on(Method::Patch, Arc::new(handler))
    }

    pub fn delete<F>(&self, handler: F) -> &Self
    where
        F: Fn(&mut Request, &mut Response, &dyn Next) -> Result<(), Error>
            + Send
            + Sync
            + 'static,
    {
        self.on(Method::Delete, Arc::new(handler))
    }

    fn handlers_for(&self, method: &str) -> Vec<Arc<dyn Handler>> {
        let method = match method.parse::<Method>() {
            Ok(method) => method,
            Err(()) => return Vec::new(),
        };
        self.node
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&method)
            .cloned()
            .unwrap_or_default()
    }

    /// Walks `path` down from this endpoint. Literal children win over
    /// parametric (`:name`) ones; among parametric siblings the first in
    /// lexical order is taken. Anything after `?` and empty segments are
    /// ignored.
    pub fn resolve(&self, path: &str) -> Option<Route> {
        let path = path.split('?').next().unwrap_or_default();
        let mut endpoint = self.clone();
        let mut params = Vec::new();

        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let next = {
                let links = endpoint.links();
                match links.children.get(segment) {
                    Some(child) => child.clone(),
                    None => {
                        let (name, child) = links
                            .children
                            .iter()
                            .find(|(name, _)| name.starts_with(':'))?;
                        params.push((name.clone(), segment.to_string()));
                        child.clone()
                    }
                }
            };
            endpoint = next;
        }

        Some(Route { endpoint, params })
    }

    /// Routes `req` through the tree and returns the response together with
    /// the error that shaped it, if any. Unknown paths answer 404, methods
    /// without handlers 405, failing handlers 500 (any body they wrote is
    /// kept). A chain that leaves the status unset answers 204.
    pub fn handle_request(&self, mut req: Request) -> (Response, Option<Error>) {
        let mut resp = Response::for_request(&req);
        let outcome = self.serve(&mut req, &mut resp);
        let err = match outcome {
            Ok(()) => {
                if resp.status == 0 {
                    resp.status = 204;
                }
                None
            }
            Err(e) => {
                resp.status = match e {
                    Error::RouteNotFound(_) => 404,
                    Error::MethodNotAllowed { .. } => 405,
                    _ if resp.status >= 500 => resp.status,
                    _ => 500,
                };
                Some(e)
            }
        };
        resp.id = req.id;
        resp.pid = req.pid;
        (resp, err)
    }

    pub fn dispatch(&self, req: Request) -> Response {
        self.handle_request(req).0
    }

    fn serve(&self, req: &mut Request, resp: &mut Response) -> Result<(), Error> {
        let route = self
            .resolve(&req.endpoint)
            .ok_or_else(|| Error::RouteNotFound(req.endpoint.clone()))?;
        for (name, value) in route.params {
            req.add_header(&name, value);
        }

        let handlers = route.endpoint.handlers_for(&req.method);
        if handlers.is_empty() {
            return Err(Error::MethodNotAllowed {
                method: req.method.clone(),
                endpoint: route.endpoint.url(),
            });
        }
        Chain {
            handlers: &handlers,
        }
        .call(req, resp)
    }
}
