use log::error;

use crate::{Result, SpiSdError};

/// Idle filler; the card only drives data while the host clocks this out.
pub const IDLE_BYTE: u8 = 0xFF;

/// Bytes per data block, fixed for SDHC/SDXC cards.
pub const BLOCK_LEN: usize = 512;
pub(crate) const BLOCK_BITS: u32 = 9;
pub(crate) const OFFSET_MASK: u64 = (BLOCK_LEN as u64) - 1;

/// Iteration ceiling shared by the response poll and the busy poll.
pub(crate) const WAIT_RESPONSE_TIMEOUT: u32 = 0x1FF_FFFF;

/// Full-duplex byte pipe the driver talks through.
///
/// One call clocks every byte of `buf` out to the card while overwriting
/// the same slot with the byte received during that transfer. Chip-select
/// gating across a command/data exchange chain is the pipe's concern; the
/// driver never touches it.
pub trait SpiIo {
    type Error: core::fmt::Debug;

    fn exchange(&mut self, buf: &mut [u8]) -> core::result::Result<(), Self::Error>;
}

/// Run one exchange, folding pipe failures into the transport error.
pub(crate) fn transfer<T: SpiIo>(io: &mut T, buf: &mut [u8]) -> Result<()> {
    io.exchange(buf).map_err(|e| {
        error!("spi exchange failed: {:?}", e);
        SpiSdError::Transport
    })
}

/// Clock one idle byte and return whatever the card drove back.
pub(crate) fn transfer_byte<T: SpiIo>(io: &mut T) -> Result<u8> {
    let mut byte = [IDLE_BYTE];
    transfer(io, &mut byte)?;
    Ok(byte[0])
}

/// Read bytes until one differs from 0xFF.
pub(crate) fn wait_for_response<T: SpiIo>(io: &mut T) -> Result<u8> {
    let mut timeout = WAIT_RESPONSE_TIMEOUT;
    loop {
        let byte = transfer_byte(io)?;
        if byte != IDLE_BYTE {
            return Ok(byte);
        }
        if timeout == 0 {
            error!("no response within the poll ceiling");
            return Err(SpiSdError::Timeout);
        }
        timeout -= 1;
    }
}

/// Read bytes until the card releases the 0x00 busy signal.
pub(crate) fn wait_until_not_busy<T: SpiIo>(io: &mut T) -> Result<()> {
    let mut timeout = WAIT_RESPONSE_TIMEOUT;
    loop {
        if transfer_byte(io)? != 0x00 {
            return Ok(());
        }
        if timeout == 0 {
            error!("card stayed busy past the poll ceiling");
            return Err(SpiSdError::Timeout);
        }
        timeout -= 1;
    }
}

/// Number of blocks the byte range [address, address + len) touches.
/// `len` must be nonzero.
pub(crate) fn blocks_spanned(address: u64, len: u64) -> u32 {
    (((address + len - 1) >> BLOCK_BITS) - (address >> BLOCK_BITS) + 1) as u32
}

pub trait GetBit {
    type Output;
    fn get_bit(&self, bit: u8) -> bool;
    fn get_bits(&self, start: u8, end: u8) -> Self::Output;
}

impl GetBit for u128 {
    type Output = u128;
    fn get_bit(&self, bit: u8) -> bool {
        (*self & (1 << bit)) != 0
    }
    fn get_bits(&self, start: u8, end: u8) -> Self::Output {
        let mask = (1 << (end - start + 1)) - 1;
        (*self >> start) & mask
    }
}
