use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::error::TransportError;

/// A fixed number of slots for outbound connections, plus an index from peer address to slot.
///
/// A slot is only handed out again after its connection is disconnected and was released, which
///  also removes its address mapping.
///
/// Released connections may still hold received data. They are kept aside and polled until they
///  yield nothing more.
pub struct OutboundPool<C: Connection> {
    slots: Vec<Option<Arc<C>>>,
    by_addr: FxHashMap<SocketAddr, usize>,
    poll_cursor: usize,
    released: VecDeque<Arc<C>>,
}

impl<C: Connection> OutboundPool<C> {
    pub fn new(pool_size: usize) -> OutboundPool<C> {
        OutboundPool {
            slots: (0..pool_size).map(|_| None).collect(),
            by_addr: Default::default(),
            poll_cursor: 0,
            released: Default::default(),
        }
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.by_addr.contains_key(addr)
    }

    #[cfg(test)]
    fn num_connections(&self) -> usize {
        self.slots.iter()
            .filter(|s| s.is_some())
            .count()
    }

    /// Returns the live connection for an address if there is one, otherwise opens a new
    ///  connection in a free slot. Fails if all slots hold live connections.
    pub fn acquire(&mut self, addr: SocketAddr, connect: impl FnOnce() -> C) -> Result<Arc<C>, TransportError> {
        if let Some(&idx) = self.by_addr.get(&addr) {
            if let Some(connection) = self.slots[idx].as_ref().filter(|c| !c.is_disconnected()) {
                trace!("reusing pooled connection #{} to {:?}", idx, addr);
                return Ok(connection.clone());
            }
            self.release(idx);
        }

        let idx = self.slots.iter()
            .position(|s| match s {
                None => true,
                Some(connection) => connection.is_disconnected(),
            })
            .ok_or(TransportError::PoolExhausted { pool_size: self.slots.len() })?;
        self.release(idx);

        debug!("assigning pool slot #{} to {:?}", idx, addr);
        let connection = Arc::new(connect());
        self.slots[idx] = Some(connection.clone());
        self.by_addr.insert(addr, idx);
        Ok(connection)
    }

    fn release(&mut self, idx: usize) {
        if let Some(connection) = self.slots[idx].take() {
            trace!("releasing pool slot #{} ({:?})", idx, connection.endpoint());
            connection.close();
            self.released.push_back(connection);
        }
        self.by_addr.retain(|_, i| *i != idx);
    }

    /// Reclaims the slots of disconnected connections, returning the number of reclaimed slots
    pub fn cleanup(&mut self) -> usize {
        let disconnected: Vec<usize> = self.slots.iter()
            .enumerate()
            .filter(|(_, s)| s.as_ref().map(|c| c.is_disconnected()).unwrap_or(false))
            .map(|(idx, _)| idx)
            .collect();
        for idx in &disconnected {
            self.release(*idx);
        }
        disconnected.len()
    }

    /// Closes all pooled connections and empties the pool
    pub fn teardown(&mut self) {
        debug!("tearing down outbound connection pool");
        for idx in 0..self.slots.len() {
            self.release(idx);
        }
        self.poll_cursor = 0;
    }

    pub fn connections(&self) -> Vec<Arc<C>> {
        self.slots.iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// Drains released connections first, dropping each one once it yields nothing. After that,
    ///  round-robin over all slots, starting after the slot that yielded the last result.
    pub fn poll<T>(&mut self, mut f: impl FnMut(&C) -> Option<T>) -> Option<T> {
        while let Some(connection) = self.released.front() {
            if let Some(result) = f(connection) {
                return Some(result);
            }
            if let Some(connection) = self.released.pop_front() {
                trace!("dropping drained connection to {:?}", connection.endpoint());
            }
        }

        let num_slots = self.slots.len();
        for _ in 0..num_slots {
            let idx = self.poll_cursor;
            self.poll_cursor = (self.poll_cursor + 1) % num_slots;

            if let Some(connection) = &self.slots[idx] {
                if let Some(result) = f(connection) {
                    return Some(result);
                }
            }
        }
        None
    }
}
