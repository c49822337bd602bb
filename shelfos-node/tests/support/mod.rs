//! A tiny in-memory broadcast medium letting two or more `Scheduler`s
//! exchange frames synchronously, without real sockets. Modeled on the
//! single-process simulator style used to drive multi-peer scenarios end to
//! end against the actual wire encoding rather than against mocked
//! internals.
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use shelfos::scheduler::Radio;

#[derive(Default)]
struct Medium {
    inboxes: Vec<VecDeque<Vec<u8>>>,
}

/// A shared broadcast medium. `radio_for` hands out one `HubRadio` per node;
/// broadcasting on any of them enqueues the frame onto every other node's
/// inbox, the way an actual shared-medium radio would.
#[derive(Default)]
pub struct Hub {
    medium: Rc<RefCell<Medium>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn radio_for(&self, node_index: usize) -> HubRadio {
        {
            let mut medium = self.medium.borrow_mut();
            while medium.inboxes.len() <= node_index {
                medium.inboxes.push(VecDeque::new());
            }
        }
        HubRadio {
            medium: self.medium.clone(),
            node_index,
        }
    }
}

pub struct HubRadio {
    medium: Rc<RefCell<Medium>>,
    node_index: usize,
}

impl Radio for HubRadio {
    fn broadcast(&mut self, bytes: &[u8]) {
        let mut medium = self.medium.borrow_mut();
        let n = medium.inboxes.len();
        for (i, inbox) in medium.inboxes.iter_mut().enumerate() {
            if i != self.node_index && i < n {
                inbox.push_back(bytes.to_vec());
            }
        }
    }

    fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.medium.borrow_mut().inboxes[self.node_index].pop_front()
    }
}
