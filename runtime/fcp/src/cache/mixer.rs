// SPDX-License-Identifier: GPL-3.0-or-later

//! Mixer cache (C5): `output_count` rows of `input_count` coefficients, each
//! row carrying its own dirty flag. A row is read from the device in full on
//! first touch and served from memory thereafter; a write mutates the
//! in-memory row and flushes the whole row back. Rows never couple to each
//! other, mirroring `MixerCtls` in the teacher's TCD22xx control synthesis.

use fcp_protocol::transport::{FcpTransport, Transport};
use glib::Error;

pub struct MixerCache {
    input_count: usize,
    rows: Vec<Vec<u16>>,
    dirty: Vec<bool>,
}

impl MixerCache {
    pub fn new(output_count: usize, input_count: usize) -> Self {
        Self {
            input_count,
            rows: vec![vec![0u16; input_count]; output_count],
            dirty: vec![true; output_count],
        }
    }

    pub fn invalidate_row(&mut self, row: usize) {
        if let Some(flag) = self.dirty.get_mut(row) {
            *flag = true;
        }
    }

    fn ensure_loaded<T: Transport>(&mut self, transport: &FcpTransport<T>, row: usize) -> Result<(), Error> {
        if self.dirty[row] {
            let values = transport.mix_read(row as u16, self.input_count as u16)?;
            self.rows[row].copy_from_slice(&values);
            self.dirty[row] = false;
        }
        Ok(())
    }

    /// Reads a single coefficient, fetching the owning row on first touch.
    pub fn read<T: Transport>(&mut self, transport: &FcpTransport<T>, row: usize, col: usize) -> Result<u16, Error> {
        self.ensure_loaded(transport, row)?;
        Ok(self.rows[row][col])
    }

    /// Mutates one coefficient in the cached row and flushes the whole row.
    pub fn write<T: Transport>(
        &mut self,
        transport: &FcpTransport<T>,
        row: usize,
        col: usize,
        value: u16,
    ) -> Result<(), Error> {
        self.ensure_loaded(transport, row)?;
        self.rows[row][col] = value;
        transport.mix_write(row as u16, &self.rows[row])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcp_protocol::transport::fake::FakeTransport;

    #[test]
    fn write_then_read_hits_cache_without_second_device_read() {
        let fake = FakeTransport::default();
        fake.responses
            .borrow_mut()
            .push_back((fcp_protocol::transport::OP_MIX_READ, vec![0u8; 8]));
        let transport = FcpTransport::new(fake);

        let mut cache = MixerCache::new(1, 4);
        cache.write(&transport, 0, 2, 24000).unwrap();
        let value = cache.read(&transport, 0, 2).unwrap();
        assert_eq!(value, 24000);

        // Only the write's single mix_write and the initial mix_read from `write`'s
        // own ensure_loaded should have touched the transport; the following read
        // must not issue another mix_read.
        let sent = transport.io().sent.borrow();
        assert!(sent.iter().filter(|(op, _)| *op == fcp_protocol::transport::OP_MIX_READ).count() <= 1);
    }

    #[test]
    fn write_leaves_other_coefficients_unchanged() {
        let fake = FakeTransport::default();
        fake.responses.borrow_mut().push_back((
            fcp_protocol::transport::OP_MIX_READ,
            vec![1, 0, 2, 0, 3, 0, 4, 0],
        ));
        let transport = FcpTransport::new(fake);

        let mut cache = MixerCache::new(1, 4);
        cache.write(&transport, 0, 2, 24000).unwrap();

        let sent = transport.io().sent.borrow();
        let (_, write_req) = sent
            .iter()
            .find(|(op, _)| *op == fcp_protocol::transport::OP_MIX_WRITE)
            .unwrap();
        let written: Vec<u16> = write_req[4..]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(written, vec![1, 2, 24000, 4]);
    }
}
