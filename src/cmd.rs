use log::error;

use crate::register::R1_IDLE_STATE;
use crate::utils::{transfer, wait_for_response, SpiIo, IDLE_BYTE};
use crate::{Result, SpiSdError};

/// Attempts at CMD0 before giving up on entering SPI mode.
pub(crate) const CMD0_RETRY_NUMBER: u32 = 5;
/// Attempts at ACMD41 while the card works through its power-up routine.
pub(crate) const ACMD41_RETRY_NUMBER: u32 = 0x1_0000;

pub(crate) const STUFF_ARG: u32 = 0x0000_0000;
/// 3.3V supply plus the 0xAA check pattern.
pub(crate) const CMD8_ARG: u32 = 0x0000_01AA;
/// HCS set: the host understands block-addressed cards.
pub(crate) const ACMD41_HCS_ARG: u32 = 0x4000_0000;

pub(crate) const R1_LEN: usize = 1;
pub(crate) const R2_LEN: usize = 2;
pub(crate) const R3_LEN: usize = 5;
pub(crate) const R7_LEN: usize = 5;

const FRAME_LEN: usize = 6;
/// Start bit (0) plus transmission bit (1) in front of the command index.
const HOST_BITS: u8 = 0x40;
const INDEX_MASK: u8 = 0x3F;

/// SPI-mode command set spoken by the driver.
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Cmd {
    /// CMD0, software reset into SPI mode
    GoIdleState = 0,
    /// CMD8, voltage range and check pattern
    SendIfCond = 8,
    /// CMD9, read the CSD register
    SendCsd = 9,
    /// CMD10, read the CID register
    SendCid = 10,
    /// CMD12, stop a multi-block read
    StopTransmission = 12,
    /// CMD13, read the status register
    SendStatus = 13,
    /// CMD17
    ReadSingleBlock = 17,
    /// CMD18
    ReadMultipleBlock = 18,
    /// CMD24
    WriteSingleBlock = 24,
    /// CMD25
    WriteMultipleBlock = 25,
    /// ACMD41, start initialization / leave the idle state
    SdSendOpCond = 41,
    /// CMD55, prefix announcing an application command
    AppCmd = 55,
    /// CMD58, read the OCR
    ReadOcr = 58,
}

impl Cmd {
    pub fn index(self) -> u8 {
        self as u8
    }

    /// Application commands must be announced with a CMD55 prefix.
    pub fn is_app(self) -> bool {
        matches!(self, Cmd::SdSendOpCond)
    }

    /// Total response length in bytes (R1, R2 or R3/R7).
    pub fn response_len(self) -> usize {
        match self {
            Cmd::SendIfCond | Cmd::ReadOcr => R3_LEN,
            Cmd::SendStatus => R2_LEN,
            _ => R1_LEN,
        }
    }

    /// Value for the CRC slot. The card only verifies CMD0 and CMD8;
    /// everything afterwards runs with CRC disabled and takes filler.
    fn crc(self) -> u8 {
        match self {
            Cmd::GoIdleState => 0x95,
            Cmd::SendIfCond => 0x87,
            _ => IDLE_BYTE,
        }
    }
}

/// Build the 6-byte wire frame for `cmd`.
pub(crate) fn frame(cmd: Cmd, arg: u32) -> [u8; FRAME_LEN] {
    let mut frame = [IDLE_BYTE; FRAME_LEN];
    frame[0] = HOST_BITS | (cmd.index() & INDEX_MASK);
    frame[1..5].copy_from_slice(&arg.to_be_bytes());
    frame[5] = cmd.crc();
    frame
}

/// Send `cmd` and collect its response into `response`.
///
/// `response` must hold at least `cmd.response_len()` bytes. The first
/// response byte is found by polling past the idle filler; the remainder
/// is clocked in directly behind it.
pub(crate) fn send_command<T: SpiIo>(
    io: &mut T,
    cmd: Cmd,
    arg: u32,
    response: &mut [u8],
) -> Result<()> {
    if cmd.is_app() {
        let mut prefix = [0u8; R1_LEN];
        send_command(io, Cmd::AppCmd, STUFF_ARG, &mut prefix)?;
        if prefix[0] != R1_IDLE_STATE {
            error!("CMD55 prefix answered {:#04x} instead of idle", prefix[0]);
            return Err(SpiSdError::Protocol);
        }
    }

    let mut buf = frame(cmd, arg);
    transfer(io, &mut buf)?;

    let len = cmd.response_len();
    response[0] = wait_for_response(io)?;
    if len > 1 {
        let tail = &mut response[1..len];
        tail.fill(IDLE_BYTE);
        transfer(io, tail)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_reset() {
        assert_eq!(
            frame(Cmd::GoIdleState, 0),
            [0x40, 0x00, 0x00, 0x00, 0x00, 0x95]
        );
    }

    #[test]
    fn test_frame_if_cond() {
        assert_eq!(
            frame(Cmd::SendIfCond, CMD8_ARG),
            [0x48, 0x00, 0x00, 0x01, 0xAA, 0x87]
        );
    }

    #[test]
    fn test_frame_arg_big_endian() {
        let frame = frame(Cmd::ReadSingleBlock, 0x1234_5678);
        assert_eq!(frame[0], 0x51);
        assert_eq!(&frame[1..5], &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(frame[5], 0xFF);
    }

    #[test]
    fn test_response_lengths() {
        assert_eq!(Cmd::GoIdleState.response_len(), 1);
        assert_eq!(Cmd::SendStatus.response_len(), 2);
        assert_eq!(Cmd::SendIfCond.response_len(), 5);
        assert_eq!(Cmd::ReadOcr.response_len(), 5);
    }

    #[test]
    fn test_only_acmd41_takes_prefix() {
        assert!(Cmd::SdSendOpCond.is_app());
        assert!(!Cmd::AppCmd.is_app());
        assert!(!Cmd::WriteMultipleBlock.is_app());
    }
}
