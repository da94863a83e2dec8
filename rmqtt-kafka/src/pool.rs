//! Fixed-capacity slots staging will payloads between fetch and delivery.

use bytes::BytesMut;

use crate::error::ProxyError;

pub type SlotId = usize;

#[derive(Debug)]
pub struct BufferPool {
    slot_capacity: usize,
    slots: Vec<Option<BytesMut>>,
    in_use: Vec<bool>,
    free: Vec<SlotId>,
}

impl BufferPool {
    pub fn new(slot_count: usize, slot_capacity: usize) -> Self {
        Self {
            slot_capacity,
            slots: (0..slot_count).map(|_| None).collect(),
            in_use: vec![false; slot_count],
            free: (0..slot_count).rev().collect(),
        }
    }

    /// Free slots left.
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn acquire(&mut self) -> Option<SlotId> {
        let slot = self.free.pop()?;
        self.in_use[slot] = true;
        let buf = self.slots[slot].get_or_insert_with(|| BytesMut::with_capacity(self.slot_capacity));
        buf.clear();
        Some(slot)
    }

    /// Append `bytes` to an acquired slot.
    pub fn buffer(&mut self, slot: SlotId, bytes: &[u8]) -> Result<(), ProxyError> {
        match self.slots.get_mut(slot) {
            Some(Some(buf)) if self.in_use[slot] => {
                if buf.len() + bytes.len() > self.slot_capacity {
                    return Err(ProxyError::SlotOverflow(slot));
                }
                buf.extend_from_slice(bytes);
                Ok(())
            }
            _ => Err(ProxyError::SlotOverflow(slot)),
        }
    }

    #[inline]
    pub fn get(&self, slot: SlotId) -> &[u8] {
        match self.slots.get(slot) {
            Some(Some(buf)) => buf,
            _ => &[],
        }
    }

    /// Returns the slot to the pool, a second release only logs.
    pub fn release(&mut self, slot: SlotId) -> bool {
        match self.in_use.get_mut(slot) {
            Some(in_use) if *in_use => {
                *in_use = false;
                if let Some(buf) = self.slots[slot].as_mut() {
                    buf.clear();
                }
                self.free.push(slot);
                true
            }
            _ => {
                log::warn!("buffer slot {} released twice", slot);
                false
            }
        }
    }
}
