//! Minimal HTTP/1.1 layer: connection loop, routing, extractors.

mod extract;
mod request;
mod response;
mod router;
mod server;


pub use extract::{FromRequest, IntoResponse, Json, Query, State};
pub use request::{Context, Method, Request, Uri, Version};
pub use response::{json, json_with_status, Response, StatusCode};
pub use router::{RouteMatch, Router};
pub use server::Server;

use std::future::Future;
use std::pin::Pin;

#[derive(Debug)]
pub enum Flow {
    Stop(Response),
    Next(Request, Response),
}

pub trait AsyncHandler: Send + Sync {
    fn call(&self, req: Request, res: Response) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

impl<F, Fut, R> AsyncHandler for F
where
    F: Fn(Request, Response) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse,
{
    fn call(&self, req: Request, res: Response) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let fut = self(req, res);
        Box::pin(async move { fut.await.into_response() })
    }
}

/// Runs before routing; `Flow::Stop` short-circuits the handler.
pub type Middleware = fn(Request, Response) -> Flow;
