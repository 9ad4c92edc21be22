// Rendezvous between blocked proposers and the apply path
// One single-slot reply channel per in-flight request id

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::Error;
use crate::raft::request::{RequestId, Response};

/// Process-local map from in-flight request id to the reply slot held by the
/// blocked caller. Callers must register with [`Line::wait`] *before*
/// proposing, so an immediate apply on a colocated leader cannot win the race
/// against the registration.
#[derive(Debug)]
pub(crate) struct Line<R> {
    slots: Mutex<HashMap<RequestId, oneshot::Sender<Response<R>>>>,
}

impl<R> Line<R> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a fresh reply slot for `id` and returns the waiter half.
    /// Dropping the waiter before a reply arrives frees the slot.
    pub(crate) fn wait(self: &Arc<Self>, id: RequestId) -> Waiter<R> {
        let (tx, rx) = oneshot::channel();
        self.slots.lock().unwrap().insert(id, tx);
        Waiter {
            id,
            line: Arc::clone(self),
            rx,
            finished: false,
        }
    }

    /// Delivers a response to the waiter registered for its id, if any.
    /// A response for a canceled or unknown id is dropped silently.
    pub(crate) fn call(&self, res: Response<R>) {
        let slot = self.slots.lock().unwrap().remove(&res.id);
        match slot {
            Some(tx) => {
                // The waiter may have been dropped between cancel and now.
                let _ = tx.send(res);
            }
            None => debug!(id = %res.id, "response without a waiter, dropping"),
        }
    }

    /// Frees the slot for `id` if it is still registered.
    pub(crate) fn cancel(&self, id: RequestId) {
        self.slots.lock().unwrap().remove(&id);
    }

    /// Wakes every pending waiter with [`Error::Stopped`]. Called once when
    /// the driver loop exits.
    pub(crate) fn drain(&self) {
        let slots = std::mem::take(&mut *self.slots.lock().unwrap());
        for (id, tx) in slots {
            let _ = tx.send(Response {
                id,
                result: Err(Error::Stopped),
            });
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

/// The caller-held half of a reply slot. Receives exactly one response, or
/// [`Error::Stopped`] if the node shuts down first. Dropping it without
/// receiving cancels the slot, so a late apply finds nobody to wake.
#[derive(Debug)]
pub(crate) struct Waiter<R> {
    id: RequestId,
    line: Arc<Line<R>>,
    rx: oneshot::Receiver<Response<R>>,
    finished: bool,
}

impl<R> Waiter<R> {
    pub(crate) async fn recv(mut self) -> Result<Option<R>, Error> {
        let received = (&mut self.rx).await;
        self.finished = true;
        match received {
            Ok(res) => res.result,
            Err(_) => Err(Error::Stopped),
        }
    }
}

impl<R> Drop for Waiter<R> {
    fn drop(&mut self) {
        if !self.finished {
            self.line.cancel(self.id);
        }
    }
}
