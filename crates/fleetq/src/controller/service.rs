use std::future::Future;

use tokio::sync::{oneshot, watch};

use crate::common::rpc::{ResponseToken, RpcSender, initiate_request, make_rpc_queue};
use crate::controller::process::{Controller, controller_process};
use crate::controller::status::ControllerStatus;

#[derive(Debug)]
pub enum ControllerMessage {
    /// Stop after the current cycle.
    /// The response is sent once the controller loop has ended.
    Stop {
        response: Option<ResponseToken<()>>,
    },
}

/// Handle to a running controller loop.
#[derive(Clone)]
pub struct ControllerService {
    sender: RpcSender<ControllerMessage>,
    status: watch::Receiver<ControllerStatus>,
}

impl ControllerService {
    pub(crate) fn new(
        sender: RpcSender<ControllerMessage>,
        status: watch::Receiver<ControllerStatus>,
    ) -> Self {
        Self { sender, status }
    }

    /// Status published at the end of the last cycle.
    pub fn status(&self) -> ControllerStatus {
        self.status.borrow().clone()
    }

    /// Asks the controller to stop, without waiting for it.
    pub fn request_stop(&self) {
        if let Err(error) = self.sender.send(ControllerMessage::Stop { response: None }) {
            log::warn!("Could not send stop request: {error:?}");
        }
    }

    /// Asks the controller to stop and waits until its loop ends.
    pub fn stop(&self) -> impl Future<Output = ()> + use<> {
        let fut: oneshot::Receiver<()> = initiate_request(|token| {
            self.sender.send(ControllerMessage::Stop {
                response: Some(token),
            })
        });
        async move {
            // The loop may have ended already
            let _ = fut.await;
        }
    }
}

pub fn create_controller_service(
    controller: Controller,
) -> (ControllerService, impl Future<Output = ()>) {
    let (tx, rx) = make_rpc_queue();
    let (status_tx, status_rx) = watch::channel(controller.status().clone());
    let process = controller_process(controller, rx, status_tx);
    let service = ControllerService::new(tx, status_rx);
    (service, process)
}
