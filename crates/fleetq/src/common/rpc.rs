use std::fmt::{Debug, Formatter};
use tokio::sync::{mpsc, oneshot};

/// Can be used to respond to a request sent to the controller loop.
#[must_use = "response token should be used to respond to a request"]
pub struct ResponseToken<T> {
    sender: oneshot::Sender<T>,
}

impl<T> Debug for ResponseToken<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Response token")
    }
}

impl<T> ResponseToken<T> {
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel::<T>();
        (Self { sender: tx }, rx)
    }

    pub fn respond(self, response: T) {
        if self.sender.send(response).is_err() {
            log::warn!("Could not send response to controller request, the other end hang up");
        }
    }
}

/// Sends a request created by `make_request` and returns a receiver that resolves once the
/// response token has been used.
pub fn initiate_request<F, Response, R>(make_request: F) -> oneshot::Receiver<Response>
where
    F: FnOnce(ResponseToken<Response>) -> Result<(), mpsc::error::SendError<R>>,
    R: Debug,
{
    let (token, rx) = ResponseToken::new();
    if let Err(error) = make_request(token) {
        log::warn!("Could not send controller request: {error:?}");
    }
    rx
}

pub type RpcSender<T> = mpsc::UnboundedSender<T>;
pub type RpcReceiver<T> = mpsc::UnboundedReceiver<T>;

pub fn make_rpc_queue<T>() -> (RpcSender<T>, RpcReceiver<T>) {
    mpsc::unbounded_channel()
}
