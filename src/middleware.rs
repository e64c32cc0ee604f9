// src/middleware.rs
use std::sync::Arc;

use crate::request::Request;
use crate::response::Response;

/// Decision from a request middleware.
pub enum MiddlewareFlow {
    /// Continue to the next middleware / the handler.
    Continue,
    /// Skip everything downstream and answer with this response.
    ShortCircuit(Response),
}

/// Pre-routing middleware, run in registration order.
pub type RequestMiddleware = Arc<dyn Fn(&Request) -> MiddlewareFlow + Send + Sync>;

/// Buffered-response middleware, run in reverse registration order.
/// Streaming responses bypass these: their headers may already be on the
/// wire when the handler returns.
pub type ResponseMiddleware = Arc<dyn Fn(&Request, &mut Response) + Send + Sync>;

#[derive(Clone, Default)]
pub struct MiddlewareChain {
    pub(crate) pre: Vec<RequestMiddleware>,
    pub(crate) post: Vec<ResponseMiddleware>,
}

impl MiddlewareChain {
    pub fn add_request<F>(&mut self, mw: F)
    where
        F: Fn(&Request) -> MiddlewareFlow + Send + Sync + 'static,
    {
        self.pre.push(Arc::new(mw));
    }

    pub fn add_response<F>(&mut self, mw: F)
    where
        F: Fn(&Request, &mut Response) + Send + Sync + 'static,
    {
        self.post.push(Arc::new(mw));
    }

    pub(crate) fn run_post(&self, req: &Request, resp: &mut Response) {
        for mw in self.post.iter().rev() {
            mw(req, resp);
        }
    }
}
