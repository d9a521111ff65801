///! Fragment reassembly table (C4): reconstructs a logical datagram from
///! fragments that may arrive out of order, keyed by a 10-bit fragment ID.
///!
///! The ID space is the only deduplication key, so a burst of more than
///! 1024 in-flight datagrams will alias; see `feed` for the duplicate-byte
///! reset policy this is lossy by design.

use std::sync::Mutex;

use crate::error::Result;
use crate::wire::{FragHeader, MAX_FRAG_ID, MAX_FRAG_INDEX};

#[derive(Clone, Default)]
struct Cell {
    data: Option<Vec<u8>>,
}

struct Slot {
    cells: Vec<Cell>,
    received_count: u16,
    expected_count: u16,
}

impl Slot {
    fn new() -> Self {
        Self {
            cells: vec![Cell::default(); MAX_FRAG_INDEX as usize + 1],
            received_count: 0,
            expected_count: 0,
        }
    }

    fn reset(&mut self) {
        for cell in &mut self.cells {
            cell.data = None;
        }
        self.received_count = 0;
        self.expected_count = 0;
    }
}

/// Fixed-size array of `MAX_FRAG_ID + 1` independently-locked reassembly slots.
pub struct FragmentTable {
    slots: Vec<Mutex<Slot>>,
}

impl FragmentTable {
    pub fn new() -> Self {
        let slots = (0..=MAX_FRAG_ID).map(|_| Mutex::new(Slot::new())).collect();
        Self { slots }
    }

    /// Feed one fragment into the table. Returns `Some(datagram)` the moment
    /// the slot it belongs to becomes complete, `None` otherwise.
    pub fn feed(&self, header: FragHeader, data: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let slot = &self.slots[header.id as usize];
        let mut slot = slot.lock().expect("fragment slot mutex poisoned");

        let index = header.index as usize;
        if let Some(existing) = &slot.cells[index].data {
            if existing != &data {
                log::warn!(
                    "fragment {}:{} seen twice with differing bytes, resetting slot",
                    header.id,
                    header.index
                );
                slot.reset();
            } else {
                log::debug!("duplicate fragment {}:{} ignored", header.id, header.index);
                return Ok(None);
            }
        }

        slot.cells[index].data = Some(data);
        slot.received_count += 1;

        if header.is_final {
            slot.expected_count = header.index as u16 + 1;
        }

        if slot.expected_count > 0 && slot.received_count == slot.expected_count {
            let mut out = Vec::new();
            for cell in &slot.cells[..slot.expected_count as usize] {
                out.extend_from_slice(cell.data.as_deref().unwrap_or_default());
            }
            slot.reset();
            return Ok(Some(out));
        }

        Ok(None)
    }
}

impl Default for FragmentTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    fn split(datagram: &[u8], id: u16, chunk: usize) -> Vec<(FragHeader, Vec<u8>)> {
        let chunks: Vec<&[u8]> = datagram.chunks(chunk.max(1)).collect();
        let last = chunks.len().saturating_sub(1);
        chunks
            .iter()
            .enumerate()
            .map(|(i, c)| {
                (
                    FragHeader::new(id, i as u8, i == last).unwrap(),
                    c.to_vec(),
                )
            })
            .collect()
    }

    #[test]
    fn single_fragment_completes_immediately() {
        let table = FragmentTable::new();
        let header = FragHeader::new(5, 0, true).unwrap();
        let out = table.feed(header, b"hello".to_vec()).unwrap();
        assert_eq!(out, Some(b"hello".to_vec()));
    }

    #[test]
    fn reassembles_in_order() {
        let table = FragmentTable::new();
        let datagram = b"the quick brown fox jumps over the lazy dog".to_vec();
        let fragments = split(&datagram, 1, 5);

        let mut result = None;
        for (header, data) in fragments {
            result = table.feed(header, data).unwrap();
        }
        assert_eq!(result, Some(datagram));
    }

    #[test]
    fn reassembles_any_permutation() {
        let datagram = b"reordering should not matter at all".to_vec();
        let mut fragments = split(&datagram, 2, 6);
        let mut rng = rand::thread_rng();
        fragments.shuffle(&mut rng);

        let table = FragmentTable::new();
        let mut completions = 0;
        let mut result = None;
        for (header, data) in fragments {
            if let Some(d) = table.feed(header, data).unwrap() {
                completions += 1;
                result = Some(d);
            }
        }
        assert_eq!(completions, 1);
        assert_eq!(result, Some(datagram));
    }

    #[test]
    fn returns_none_before_final_fragment() {
        let table = FragmentTable::new();
        let header = FragHeader::new(9, 0, false).unwrap();
        let out = table.feed(header, b"partial".to_vec()).unwrap();
        assert_eq!(out, None);
    }

    #[test]
    fn disjoint_ids_do_not_interfere() {
        let table = FragmentTable::new();
        let a = split(b"datagram A payload", 1, 6);
        let b = split(b"datagram B payload, different", 2, 7);

        let mut results = Vec::new();
        for (header, data) in a.into_iter().chain(b.into_iter()) {
            if let Some(d) = table.feed(header, data).unwrap() {
                results.push(d);
            }
        }

        assert_eq!(results.len(), 2);
        assert!(results.contains(&b"datagram A payload".to_vec()));
        assert!(results.contains(&b"datagram B payload, different".to_vec()));
    }

    #[test]
    fn differing_duplicate_resets_slot() {
        let table = FragmentTable::new();
        let header0 = FragHeader::new(3, 0, false).unwrap();
        assert_eq!(table.feed(header0, b"first".to_vec()).unwrap(), None);

        // Same id:index, different bytes -> reset, so a fresh final fragment
        // at index 0 alone now completes the (new) datagram.
        let header_final = FragHeader::new(3, 0, true).unwrap();
        let out = table.feed(header_final, b"second".to_vec()).unwrap();
        assert_eq!(out, Some(b"second".to_vec()));
    }

    #[test]
    fn identical_duplicate_is_idempotent() {
        let table = FragmentTable::new();
        let header = FragHeader::new(4, 0, false).unwrap();
        assert_eq!(table.feed(header, b"same".to_vec()).unwrap(), None);
        assert_eq!(table.feed(header, b"same".to_vec()).unwrap(), None);

        let final_header = FragHeader::new(4, 1, true).unwrap();
        let out = table.feed(final_header, b"-tail".to_vec()).unwrap();
        assert_eq!(out, Some(b"same-tail".to_vec()));
    }

    #[test]
    fn rejects_out_of_range_header() {
        assert!(FragHeader::new(MAX_FRAG_ID + 1, 0, true).is_err());
    }
}
