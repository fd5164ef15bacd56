use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use rmpv::Value;

use iproto_common::protocol::body;
use iproto_common::protocol::error::Result;
use iproto_common::protocol::RequestType;

use crate::connection::Connection;
use crate::pool::ConnectionPool;

/// A request ready to be sent: its type, its encoded body and an optional
/// deadline overriding the configured request timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub code: RequestType,
    pub body: Bytes,
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(code: RequestType, body: Bytes) -> Self {
        Self {
            code,
            body,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// `CALL` of a stored function with positional arguments.
    pub fn call(function: &str, args: Vec<Value>) -> Result<Self> {
        Ok(Self::new(RequestType::Call, body::call_body(function, args)?))
    }

    /// `EVAL` of an expression with positional arguments.
    pub fn eval(expression: &str, args: Vec<Value>) -> Result<Self> {
        Ok(Self::new(RequestType::Eval, body::eval_body(expression, args)?))
    }

    pub fn ping() -> Result<Self> {
        Ok(Self::new(RequestType::Ping, body::ping_body()?))
    }
}

/// Anything that can carry a request to a server and bring back the
/// response body.
///
/// Implemented by a single [`Connection`], a [`ConnectionPool`], the
/// cluster manager and the retrying wrapper, which compose by wrapping
/// one another.
pub trait RequestDispatcher: Send + Sync {
    fn dispatch(&self, request: Request) -> BoxFuture<'_, Result<Bytes>>;

    /// Calls a stored function and returns the `DATA` of the response.
    fn call<'a>(&'a self, function: &'a str, args: Vec<Value>) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let response = self.dispatch(Request::call(function, args)?).await?;
            body::response_data(&response)
        })
    }

    /// Evaluates an expression and returns the `DATA` of the response.
    fn eval<'a>(&'a self, expression: &'a str, args: Vec<Value>) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let response = self.dispatch(Request::eval(expression, args)?).await?;
            body::response_data(&response)
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.dispatch(Request::ping()?).await?;
            Ok(())
        })
    }
}

impl RequestDispatcher for Connection {
    fn dispatch(&self, request: Request) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(async move {
            match request.timeout {
                Some(timeout) => self.send_with_timeout(request.code, request.body, timeout).await,
                None => self.send(request.code, request.body).await,
            }
        })
    }
}

impl RequestDispatcher for ConnectionPool {
    fn dispatch(&self, request: Request) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(async move {
            let connection = self.acquire()?;
            connection.dispatch(request).await
        })
    }
}

impl<D> RequestDispatcher for Arc<D>
where
    D: RequestDispatcher + ?Sized,
{
    fn dispatch(&self, request: Request) -> BoxFuture<'_, Result<Bytes>> {
        (**self).dispatch(request)
    }
}
