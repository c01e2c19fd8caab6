use std::collections::HashMap;
use std::sync::Arc;

use super::{AsyncHandler, Method};

type HandlerBox = Arc<dyn AsyncHandler>;

/// Outcome of matching a path against the route tree.
pub enum RouteMatch {
    Found(HandlerBox, HashMap<String, String>),
    /// The path exists but not for this method.
    MethodNotAllowed,
    NotFound,
}

#[derive(Default)]
struct RadixNode {
    segment: String,
    children: Vec<RadixNode>,
    handlers: HashMap<String, HandlerBox>,
    is_param: bool,
    param_name: Option<String>,
}

impl RadixNode {
    fn insert(&mut self, method: &str, parts: &[&str], handler: HandlerBox) {
        let Some((part, remaining)) = parts.split_first() else {
            self.handlers.insert(method.to_uppercase(), handler);
            return;
        };

        let (is_param, segment, param_name) = match part.strip_prefix(':') {
            Some(name) => (true, ":param".to_string(), Some(name.to_string())),
            None => (false, part.to_string(), None),
        };

        if let Some(child) = self
            .children
            .iter_mut()
            .find(|c| (c.is_param && is_param) || (!c.is_param && c.segment == segment))
        {
            if is_param && child.param_name != param_name {
                tracing::warn!(
                    existing = ?child.param_name,
                    new = ?param_name,
                    "conflicting parameter names at the same route position"
                );
            }
            child.insert(method, remaining, handler);
            return;
        }

        let mut child = RadixNode {
            segment,
            is_param,
            param_name,
            ..Default::default()
        };
        child.insert(method, remaining, handler);
        self.children.push(child);
    }

    /// Static segments win over parameters; on a dead end the search backtracks.
    fn search<'a>(
        &'a self,
        parts: &[&str],
        params: &mut HashMap<String, String>,
    ) -> Option<&'a RadixNode> {
        let Some((part, remaining)) = parts.split_first() else {
            return (!self.handlers.is_empty()).then_some(self);
        };

        for child in self.children.iter().filter(|c| !c.is_param && c.segment == *part) {
            if let Some(found) = child.search(remaining, params) {
                return Some(found);
            }
        }

        for child in self.children.iter().filter(|c| c.is_param) {
            let mut attempt = params.clone();
            if let Some(name) = &child.param_name {
                attempt.insert(name.clone(), part.to_string());
            }
            if let Some(found) = child.search(remaining, &mut attempt) {
                *params = attempt;
                return Some(found);
            }
        }

        None
    }
}

#[derive(Default)]
pub struct Router {
    root: RadixNode,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&mut self, method: &str, path: &str, handler: Box<dyn AsyncHandler>) {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        self.root.insert(method, &parts, Arc::from(handler));
    }

    pub fn find(&self, method: &Method, path: &str) -> RouteMatch {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut params = HashMap::new();

        match self.root.search(&parts, &mut params) {
            Some(node) => match node.handlers.get(method.as_str()) {
                Some(handler) => RouteMatch::Found(Arc::clone(handler), params),
                None => RouteMatch::MethodNotAllowed,
            },
            None => RouteMatch::NotFound,
        }
    }
}
