//! SD card driver speaking the SD protocol in SPI mode over a generic
//! full-duplex byte pipe.
//!
//! The driver supports byte-granular reads and writes for cards that are
//! version 2.00 or later, high capacity or extended capacity (SDHC/SDXC)
//! and supplied with 3.3V.
//!
//! [`SpiSdDriver`] is built from bottom-up layers:
//!
//! - Byte pipe layer -- the [`SpiIo`] capability supplied by the caller
//! - Command layer -- 6-byte frames, CMD55 prefixing, R1/R2/R3/R7 responses
//! - Block layer -- token-framed 512-byte transfers with busy handling
//! - Block-band layer -- byte-granular addressing on top of whole blocks,
//!   with read-modify-write of partially covered edge blocks
//! - Session layer -- the initialization handshake and capacity discovery

#![no_std]

#[cfg(feature = "alloc")]
extern crate alloc;
#[cfg(test)]
extern crate std;

use core::fmt::{Display, Formatter};

use log::{debug, error};
use preprint::pprintln;

use crate::cmd::{
    send_command, ACMD41_HCS_ARG, ACMD41_RETRY_NUMBER, CMD0_RETRY_NUMBER, CMD8_ARG, R1_LEN,
    R3_LEN, R7_LEN, STUFF_ARG,
};
use crate::register::{
    DataErrorToken, Ocr, WriteResponse, CID_LEN, CRC_LEN, CSD_LEN, ERROR_TOKEN_MASK,
    R1_IDLE_STATE, R1_READY_STATE, START_BLOCK_TOKEN, START_MULTI_BLOCK_TOKEN,
    STOP_TRANSMISSION_TOKEN, R1,
};
use crate::utils::{
    blocks_spanned, transfer, wait_for_response, wait_until_not_busy, BLOCK_BITS, IDLE_BYTE,
    OFFSET_MASK,
};

pub use crate::cmd::Cmd;
pub use crate::register::{Cid, Csd};
pub use crate::utils::{SpiIo, BLOCK_LEN};

mod cmd;
mod register;
mod utils;

/// Failure categories surfaced by every driver operation. The detailed
/// cause is logged at the failing site.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SpiSdError {
    /// The requested byte range does not fit the card.
    OutOfBounds,
    /// The byte pipe reported a failure.
    Transport,
    /// A poll loop hit its iteration ceiling.
    Timeout,
    /// The card answered with an unexpected response or token.
    Protocol,
    /// Not a V2.00+ high-capacity card at 3.3V.
    UnsupportedCard,
}

impl Display for SpiSdError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            SpiSdError::OutOfBounds => write!(f, "address range outside card"),
            SpiSdError::Transport => write!(f, "spi transport error"),
            SpiSdError::Timeout => write!(f, "timeout error"),
            SpiSdError::Protocol => write!(f, "protocol error"),
            SpiSdError::UnsupportedCard => write!(f, "unsupported card"),
        }
    }
}

pub type Result<T> = core::result::Result<T, SpiSdError>;

/// Receive one framed 512-byte block from the card.
fn read_block<T: SpiIo>(io: &mut T, data: &mut [u8]) -> Result<()> {
    assert_eq!(data.len(), BLOCK_LEN);

    let token = wait_for_response(io)?;
    if token & ERROR_TOKEN_MASK == 0 {
        error!("data error token on read: {:?}", DataErrorToken::from(token));
        return Err(SpiSdError::Protocol);
    }
    if token != START_BLOCK_TOKEN {
        error!("expected start-of-block, got {:#04x}", token);
        return Err(SpiSdError::Protocol);
    }

    data.fill(IDLE_BYTE);
    transfer(io, data)?;

    // The CRC is clocked out by the card either way; with CRC mode off it
    // is junk and gets discarded.
    let mut crc = [IDLE_BYTE; CRC_LEN];
    transfer(io, &mut crc)?;

    Ok(())
}

/// Send one framed 512-byte block and wait out the programming window.
fn write_block<T: SpiIo>(io: &mut T, data: &[u8], multi: bool) -> Result<()> {
    assert_eq!(data.len(), BLOCK_LEN);

    let token = if multi {
        START_MULTI_BLOCK_TOKEN
    } else {
        START_BLOCK_TOKEN
    };
    let mut buf = [token];
    transfer(io, &mut buf)?;

    // The pipe overwrites what it sends, so the payload goes out of a copy.
    let mut payload = [0u8; BLOCK_LEN];
    payload.copy_from_slice(data);
    transfer(io, &mut payload)?;

    let mut crc = [IDLE_BYTE; CRC_LEN];
    transfer(io, &mut crc)?;

    let token = wait_for_response(io)?;
    match WriteResponse::decode(token) {
        WriteResponse::Accepted => {}
        rejected => {
            error!("block write rejected: {:?}", rejected);
            return Err(SpiSdError::Protocol);
        }
    }

    wait_until_not_busy(io)
}

/// SD card session over a full-duplex SPI byte pipe.
///
/// # Example
/// ```ignore
/// let mut sd = SpiSdDriver::open(spi)?;
/// let mut buf = [0u8; 16];
/// sd.read(&mut buf, 0)?;
/// sd.write(&buf, 512)?;
/// ```
#[derive(Debug)]
pub struct SpiSdDriver<T> {
    io: T,
    memory_size: u64,
}

impl<T: SpiIo> SpiSdDriver<T> {
    /// Wrap a pipe without touching the card.
    pub fn new(io: T) -> Self {
        Self { io, memory_size: 0 }
    }

    /// Wrap a pipe and run the full initialization handshake.
    pub fn open(io: T) -> Result<Self> {
        let mut driver = Self::new(io);
        driver.init()?;
        Ok(driver)
    }

    /// End the session and hand the pipe back. SPI mode has no
    /// protocol-level shutdown.
    pub fn close(self) -> T {
        self.io
    }

    /// Total addressable bytes, known once `init` has run.
    pub fn memory_size(&self) -> u64 {
        self.memory_size
    }

    pub fn num_blocks(&self) -> u64 {
        self.memory_size >> BLOCK_BITS
    }

    /// Bring the card from power-up to the data-transfer state and learn
    /// its capacity. Must complete before any read or write.
    pub fn init(&mut self) -> Result<()> {
        // At least 74 clocks of warm-up before the first command.
        let mut warmup = [IDLE_BYTE; 10];
        transfer(&mut self.io, &mut warmup)?;

        self.enter_spi_mode()?;
        self.check_version()?;
        // CRC stays disabled: CMD59 is never sent and every frame after
        // CMD8 carries filler in its CRC slot.
        self.leave_idle()?;
        self.check_capacity_class()?;

        let csd = self.read_csd()?;
        self.memory_size = csd.capacity_bytes();
        debug!("csd reports {} bytes", self.memory_size);
        pprintln!("sd init ok");
        Ok(())
    }

    /// CMD0 until the card answers from the idle state.
    fn enter_spi_mode(&mut self) -> Result<()> {
        let mut response = [0u8; R1_LEN];
        let mut attempts = 0;
        loop {
            send_command(&mut self.io, Cmd::GoIdleState, STUFF_ARG, &mut response)?;
            if response[0] == R1_IDLE_STATE {
                return Ok(());
            }
            attempts += 1;
            if attempts == CMD0_RETRY_NUMBER {
                error!("card refused SPI mode, last R1 {:?}", R1::from(response[0]));
                return Err(SpiSdError::Protocol);
            }
        }
    }

    /// CMD8: V2.00+ cards echo the voltage and check pattern back.
    fn check_version(&mut self) -> Result<()> {
        let mut response = [0u8; R7_LEN];
        send_command(&mut self.io, Cmd::SendIfCond, CMD8_ARG, &mut response)?;
        if response[0] != R1_IDLE_STATE || response[3] != 0x01 || response[4] != 0xAA {
            error!("CMD8 answered {:02x?}: below V2.00 or wrong voltage", response);
            return Err(SpiSdError::UnsupportedCard);
        }
        Ok(())
    }

    /// ACMD41 with HCS until the card reports ready. Announcing host
    /// high-capacity support is only meaningful on the first attempt.
    fn leave_idle(&mut self) -> Result<()> {
        let mut response = [0u8; R1_LEN];
        let mut arg = ACMD41_HCS_ARG;
        let mut attempts = 0;
        loop {
            send_command(&mut self.io, Cmd::SdSendOpCond, arg, &mut response)?;
            if response[0] == R1_READY_STATE {
                return Ok(());
            }
            arg = STUFF_ARG;
            attempts += 1;
            if attempts == ACMD41_RETRY_NUMBER {
                error!("card never left the idle state");
                return Err(SpiSdError::Timeout);
            }
        }
    }

    /// CMD58: byte addressing on SDSC cards is not implemented, so the
    /// OCR must carry the CCS bit.
    fn check_capacity_class(&mut self) -> Result<()> {
        let mut response = [0u8; R3_LEN];
        send_command(&mut self.io, Cmd::ReadOcr, STUFF_ARG, &mut response)?;
        let ocr = Ocr::from_response([response[1], response[2], response[3], response[4]]);
        if response[0] != R1_READY_STATE || !ocr.ccs() {
            error!("OCR {:02x?}: only SDHC and SDXC are supported", &response[1..]);
            return Err(SpiSdError::UnsupportedCard);
        }
        Ok(())
    }

    /// Registers longer than a response arrive as a small block read:
    /// R1, start token, payload, CRC.
    fn read_register(&mut self, cmd: Cmd) -> Result<[u8; CSD_LEN]> {
        let mut response = [0u8; R1_LEN];
        send_command(&mut self.io, cmd, STUFF_ARG, &mut response)?;
        if response[0] != R1_READY_STATE {
            error!("{:?} rejected, R1 {:?}", cmd, R1::from(response[0]));
            return Err(SpiSdError::Protocol);
        }
        let token = wait_for_response(&mut self.io)?;
        if token != START_BLOCK_TOKEN {
            error!("no start token ahead of {:?} payload: {:#04x}", cmd, token);
            return Err(SpiSdError::Protocol);
        }
        let mut buf = [IDLE_BYTE; CSD_LEN + CRC_LEN];
        transfer(&mut self.io, &mut buf)?;
        let mut register = [0u8; CSD_LEN];
        register.copy_from_slice(&buf[..CSD_LEN]);
        Ok(register)
    }

    /// Read the Card-Specific Data register. Valid once `init` has
    /// brought the card out of the idle state.
    pub fn read_csd(&mut self) -> Result<Csd> {
        Ok(Csd::new(self.read_register(Cmd::SendCsd)?))
    }

    /// Read the Card Identification register. Valid once `init` has
    /// brought the card out of the idle state.
    pub fn read_cid(&mut self) -> Result<Cid> {
        let raw = self.read_register(Cmd::SendCid)?;
        let mut cid = [0u8; CID_LEN];
        cid.copy_from_slice(&raw);
        Ok(Cid::new(cid))
    }

    /// Read `data.len()` bytes starting at byte `address`. Returns only
    /// when the transfer is complete; an empty buffer is a no-op.
    pub fn read(&mut self, data: &mut [u8], address: u64) -> Result<()> {
        let len = data.len() as u64;
        if len == 0 {
            return Ok(());
        }
        self.check_bounds(address, len)?;

        let nblocks = blocks_spanned(address, len);
        let cmd = if nblocks == 1 {
            Cmd::ReadSingleBlock
        } else {
            Cmd::ReadMultipleBlock
        };
        self.start_data_command(cmd, address)?;
        self.read_block_run(data, address)?;

        if nblocks != 1 {
            let mut response = [0u8; R1_LEN];
            send_command(&mut self.io, Cmd::StopTransmission, STUFF_ARG, &mut response)?;
            if response[0] != R1_READY_STATE {
                error!("stop transmission rejected, R1 {:?}", R1::from(response[0]));
                return Err(SpiSdError::Protocol);
            }
        }

        Ok(())
    }

    /// Write `data.len()` bytes starting at byte `address`. Partially
    /// covered edge blocks are read first and written back patched, so
    /// their remaining bytes survive. Returns only when the card has
    /// committed every block; an empty buffer is a no-op.
    pub fn write(&mut self, data: &[u8], address: u64) -> Result<()> {
        let len = data.len() as u64;
        if len == 0 {
            return Ok(());
        }
        self.check_bounds(address, len)?;

        let mut first_block = [0u8; BLOCK_LEN];
        let mut last_block = [0u8; BLOCK_LEN];

        let first_block_addr = address & !OFFSET_MASK;
        let last_block_addr = (address + len - 1) & !OFFSET_MASK;
        if address & OFFSET_MASK != 0 || len < BLOCK_LEN as u64 {
            self.read(&mut first_block, first_block_addr)?;
        }
        if last_block_addr != first_block_addr
            && (address + len - 1) & OFFSET_MASK != OFFSET_MASK
        {
            self.read(&mut last_block, last_block_addr)?;
        }

        let nblocks = blocks_spanned(address, len);
        let cmd = if nblocks == 1 {
            Cmd::WriteSingleBlock
        } else {
            Cmd::WriteMultipleBlock
        };
        self.start_data_command(cmd, address)?;
        self.write_block_run(data, address, &mut first_block, &mut last_block)?;

        if nblocks != 1 {
            // One stop token, one idle byte, then the card goes busy.
            let mut stop = [STOP_TRANSMISSION_TOKEN, IDLE_BYTE];
            transfer(&mut self.io, &mut stop)?;
            wait_until_not_busy(&mut self.io)?;
        }

        Ok(())
    }

    /// Issue a data command carrying the block index of `address` and
    /// require the ready-state R1.
    fn start_data_command(&mut self, cmd: Cmd, address: u64) -> Result<()> {
        let mut response = [0u8; R1_LEN];
        send_command(&mut self.io, cmd, (address >> BLOCK_BITS) as u32, &mut response)?;
        if response[0] != R1_READY_STATE {
            error!("{:?} rejected, R1 {:?}", cmd, R1::from(response[0]));
            return Err(SpiSdError::Protocol);
        }
        Ok(())
    }

    fn check_bounds(&self, address: u64, len: u64) -> Result<()> {
        if address > self.memory_size || len > self.memory_size
            || address + len > self.memory_size
        {
            error!(
                "range {}+{} outside the {} byte card",
                address, len, self.memory_size
            );
            return Err(SpiSdError::OutOfBounds);
        }
        Ok(())
    }

    /// Stream the blocks of one read run. Interior blocks land straight
    /// in the caller's buffer; partial edge blocks go through a scratch
    /// block first.
    fn read_block_run(&mut self, data: &mut [u8], address: u64) -> Result<()> {
        let mut scratch = [0u8; BLOCK_LEN];
        let len = data.len() as u64;
        let nblocks = blocks_spanned(address, len);
        let mut data_idx = 0;
        for i in 0..nblocks {
            let first_idx = if i == 0 {
                (address & OFFSET_MASK) as usize
            } else {
                0
            };
            let copy_len = if i == nblocks - 1 {
                ((address + len - 1) & OFFSET_MASK) as usize - first_idx + 1
            } else {
                BLOCK_LEN - first_idx
            };
            if first_idx == 0 && copy_len == BLOCK_LEN {
                read_block(&mut self.io, &mut data[data_idx..data_idx + BLOCK_LEN])?;
            } else {
                read_block(&mut self.io, &mut scratch)?;
                data[data_idx..data_idx + copy_len]
                    .copy_from_slice(&scratch[first_idx..first_idx + copy_len]);
            }
            data_idx += copy_len;
        }
        Ok(())
    }

    /// Send the blocks of one write run. Interior blocks come straight
    /// from the caller; the edge blocks are the pre-read scratch blocks
    /// patched with the caller's bytes.
    fn write_block_run(
        &mut self,
        data: &[u8],
        address: u64,
        first_block: &mut [u8; BLOCK_LEN],
        last_block: &mut [u8; BLOCK_LEN],
    ) -> Result<()> {
        let len = data.len() as u64;
        let nblocks = blocks_spanned(address, len);
        let multi = nblocks > 1;
        let mut data_idx = 0;
        for i in 0..nblocks {
            let first_idx = if i == 0 {
                (address & OFFSET_MASK) as usize
            } else {
                0
            };
            let copy_len = if i == nblocks - 1 {
                ((address + len - 1) & OFFSET_MASK) as usize - first_idx + 1
            } else {
                BLOCK_LEN - first_idx
            };
            if first_idx == 0 && copy_len == BLOCK_LEN {
                write_block(&mut self.io, &data[data_idx..data_idx + BLOCK_LEN], multi)?;
            } else if i == 0 {
                first_block[first_idx..first_idx + copy_len]
                    .copy_from_slice(&data[..copy_len]);
                write_block(&mut self.io, first_block, multi)?;
            } else {
                last_block[..copy_len].copy_from_slice(&data[data_idx..data_idx + copy_len]);
                write_block(&mut self.io, last_block, multi)?;
            }
            data_idx += copy_len;
        }
        Ok(())
    }
}
