//! In-process mailbox delivery between replica roles.
//!
//! A mailbox is an addressable unbounded queue of protocol messages.
//! Delivery is reliable and ordered per address; back-pressure across
//! addresses is the caller's concern (the backfill protocol acks bytes
//! explicitly in both directions). Sends to an address whose mailbox is
//! gone are dropped: peers tear down independently and stragglers are
//! normal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::proto::Message;

/// Address of a registered mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MailboxAddr(u64);

type Routes = Arc<Mutex<HashMap<MailboxAddr, mpsc::UnboundedSender<Message>>>>;

fn lock_routes(routes: &Routes) -> std::sync::MutexGuard<'_, HashMap<MailboxAddr, mpsc::UnboundedSender<Message>>> {
    match routes.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Routes messages to registered mailboxes. Clones share the route table.
#[derive(Clone, Debug, Default)]
pub struct MailboxManager {
    routes: Routes,
    next_addr: Arc<AtomicU64>,
}

impl MailboxManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a fresh mailbox. It deregisters itself when dropped.
    pub fn register(&self) -> Mailbox {
        let addr = MailboxAddr(self.next_addr.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        lock_routes(&self.routes).insert(addr, tx);
        Mailbox {
            addr,
            rx,
            routes: self.routes.clone(),
        }
    }

    /// Deliver `message` to `addr`. Unknown or closed addresses drop it.
    pub fn send(&self, addr: MailboxAddr, message: Message) {
        let sender = lock_routes(&self.routes).get(&addr).cloned();
        match sender {
            Some(sender) => {
                if sender.send(message).is_err() {
                    tracing::debug!(?addr, "dropped message to closed mailbox");
                }
            }
            None => tracing::debug!(?addr, "dropped message to unknown mailbox"),
        }
    }
}

/// Receiving end of one registered address.
#[derive(Debug)]
pub struct Mailbox {
    addr: MailboxAddr,
    rx: mpsc::UnboundedReceiver<Message>,
    routes: Routes,
}

impl Mailbox {
    pub fn addr(&self) -> MailboxAddr {
        self.addr
    }

    /// Next message, or `None` once the mailbox is deregistered.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        lock_routes(&self.routes).remove(&self.addr);
    }
}
