//! `PendingCookie`: cookie-driven async completion. Instead of parking a
//! thread and notifying it out of band, the waiting caller holds an
//! explicit handle owned by the DurabilityMonitor entry, which delivers
//! its result as a message rather than unparking a thread.

use ep_types::EpResult;
use tokio::sync::oneshot;

/// Held by a tracked Prepare; consumed exactly once, on Commit, Abort,
/// timeout, or cancellation (the caller gets `WouldBlock` and a later
/// Commit/Abort notifies the cookie).
#[derive(Debug)]
pub struct PendingCookie {
    sender: oneshot::Sender<EpResult<()>>,
}

/// Given to the frontend-thread caller that created the Prepare; `await`ed
/// to receive the definitive result.
#[derive(Debug)]
pub struct CookieWaiter {
    receiver: oneshot::Receiver<EpResult<()>>,
}

pub fn pending_cookie() -> (PendingCookie, CookieWaiter) {
    let (tx, rx) = oneshot::channel();
    (PendingCookie { sender: tx }, CookieWaiter { receiver: rx })
}

impl PendingCookie {
    /// Delivers the final result. Consumes self: a cookie is notified
    /// exactly once.
    pub fn notify(self, result: EpResult<()>) {
        let _ = self.sender.send(result);
    }
}

impl CookieWaiter {
    /// Awaits the notification. `Err(EpError::Cancelled)` if the
    /// `PendingCookie` was dropped without notifying (connection close).
    pub async fn wait(self) -> EpResult<()> {
        self.receiver.await.unwrap_or(Err(ep_types::EpError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_delivers_result_to_waiter() {
        let (cookie, waiter) = pending_cookie();
        cookie.notify(Ok(()));
        assert_eq!(waiter.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn dropping_cookie_cancels_the_waiter() {
        let (cookie, waiter) = pending_cookie();
        drop(cookie);
        assert_eq!(waiter.wait().await, Err(ep_types::EpError::Cancelled));
    }
}
