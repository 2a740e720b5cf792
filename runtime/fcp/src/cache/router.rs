// SPDX-License-Identifier: GPL-3.0-or-later

//! Router ("mux") cache (C5): three parallel sample-rate-group tables of
//! 32-bit slots (low 12 bits destination pin, high 12 bits source pin). The
//! whole cache shares one dirty flag; on first touch after invalidation all
//! three tables are re-read in full. A write to one destination updates the
//! same router pin across every rate table the destination is present at and
//! re-flushes each of those tables whole.

use fcp_protocol::transport::{FcpTransport, Transport};
use glib::Error;

const RATE_GROUPS: usize = 3;

/// One router input choice: a user-visible label and its device-map router pin.
#[derive(Debug, Clone)]
pub struct RouterInput {
    pub label: String,
    pub pin: u16,
}

/// One router destination (an audio-control output).
#[derive(Debug, Clone)]
pub struct RouterOutput {
    pub pin: u16,
    /// `Some(input index)` when the destination is `static-source`: read-only,
    /// never touches a table slot.
    pub fixed_input: Option<usize>,
    /// Per-rate slot index into that rate's table, or -1 when the destination
    /// is absent at that rate.
    pub slots: [i32; RATE_GROUPS],
}

pub struct RouterCache {
    sizes: [usize; RATE_GROUPS],
    tables: [Vec<u32>; RATE_GROUPS],
    dirty: bool,
    pub inputs: Vec<RouterInput>,
    pub outputs: Vec<RouterOutput>,
}

fn slot_value(dest_pin: u16, source_pin: u16) -> u32 {
    (dest_pin as u32 & 0xFFF) | ((source_pin as u32 & 0xFFF) << 12)
}

impl RouterCache {
    pub fn new(sizes: [usize; RATE_GROUPS]) -> Self {
        Self {
            sizes,
            tables: [
                vec![0u32; sizes[0]],
                vec![0u32; sizes[1]],
                vec![0u32; sizes[2]],
            ],
            dirty: true,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn invalidate(&mut self) {
        self.dirty = true;
    }

    /// Seeds the tables from data already read during synthesis, so the
    /// first `read_output`/`write_output` doesn't re-fetch what synthesis
    /// just used to resolve each destination's slot.
    pub fn seed_tables(&mut self, tables: [Vec<u32>; RATE_GROUPS]) {
        self.tables = tables;
        self.dirty = false;
    }

    fn ensure_loaded<T: Transport>(&mut self, transport: &FcpTransport<T>) -> Result<(), Error> {
        if self.dirty {
            for rate in 0..RATE_GROUPS {
                if self.sizes[rate] > 0 {
                    self.tables[rate] = transport.mux_read(rate as u8, self.sizes[rate] as u8)?;
                }
            }
            self.dirty = false;
        }
        Ok(())
    }

    /// Returns the currently selected input index for `output`.
    pub fn read_output<T: Transport>(
        &mut self,
        transport: &FcpTransport<T>,
        output: usize,
    ) -> Result<usize, Error> {
        self.ensure_loaded(transport)?;
        let out = &self.outputs[output];
        if let Some(fixed) = out.fixed_input {
            return Ok(fixed);
        }
        let slot = out.slots[0];
        if slot < 0 {
            return Err(glib::Error::new(
                glib::FileError::Inval,
                "router destination has no slot at the primary rate",
            ));
        }
        let value = self.tables[0][slot as usize];
        let source_pin = (value >> 12) as u16 & 0xFFF;
        self.inputs
            .iter()
            .position(|input| input.pin == source_pin)
            .ok_or_else(|| glib::Error::new(glib::FileError::Inval, "unknown router source pin"))
    }

    /// Selects `input_index` for `output`, updating and re-flushing every rate
    /// table the destination is present at.
    pub fn write_output<T: Transport>(
        &mut self,
        transport: &FcpTransport<T>,
        output: usize,
        input_index: usize,
    ) -> Result<(), Error> {
        self.ensure_loaded(transport)?;
        let source_pin = self.inputs[input_index].pin;
        let dest_pin = self.outputs[output].pin;
        let slots = self.outputs[output].slots;

        for rate in 0..RATE_GROUPS {
            let slot = slots[rate];
            if slot >= 0 {
                self.tables[rate][slot as usize] = slot_value(dest_pin, source_pin);
            }
        }
        for rate in 0..RATE_GROUPS {
            if slots[rate] >= 0 {
                transport.mux_write(rate as u16, &self.tables[rate])?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcp_protocol::transport::fake::FakeTransport;

    #[test]
    fn write_updates_only_present_rates() {
        let fake = FakeTransport::default();
        fake.responses.borrow_mut().push_back((
            fcp_protocol::transport::OP_MUX_READ,
            vec![0u8; 8 * 4],
        ));
        fake.responses.borrow_mut().push_back((
            fcp_protocol::transport::OP_MUX_READ,
            vec![0u8; 6 * 4],
        ));
        let transport = FcpTransport::new(fake);

        let mut cache = RouterCache::new([8, 6, 0]);
        cache.inputs.push(RouterInput { label: "Off".into(), pin: 0 });
        cache.inputs.push(RouterInput {
            label: "Analog 3".into(),
            pin: 0x203,
        });
        cache.outputs.push(RouterOutput {
            pin: 0x010,
            fixed_input: None,
            slots: [7, 5, -1],
        });

        cache.write_output(&transport, 0, 1).unwrap();

        let sent = transport.io().sent.borrow();
        let writes: Vec<_> = sent
            .iter()
            .filter(|(op, _)| *op == fcp_protocol::transport::OP_MUX_WRITE)
            .collect();
        // Only rates 0 and 1 have a slot for this destination.
        assert_eq!(writes.len(), 2);

        let (_, rate0_req) = writes[0];
        let slot7 = u32::from_le_bytes(rate0_req[4 + 7 * 4..4 + 8 * 4].try_into().unwrap());
        assert_eq!(slot7, slot_value(0x010, 0x203));
    }
}
