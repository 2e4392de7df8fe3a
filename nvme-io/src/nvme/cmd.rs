//! I/O commands and completions as seen above the transport.

use std::fmt;

use crate::dma::DmaBuf;
use crate::error::{Error, Result};

/// NVM command set opcodes used by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Write logical blocks
    Write = 0x01,
    /// Read logical blocks
    Read = 0x02,
}

/// One read or write command.
///
/// The buffer travels with the command while it is in flight and comes back
/// in the matching [`Completion`].
#[derive(Debug)]
pub struct IoCommand {
    /// Operation
    pub opcode: Opcode,
    /// Target namespace id
    pub nsid: u32,
    /// Starting logical block address
    pub lba: u64,
    /// Number of logical blocks (1-based)
    pub num_blocks: u32,
    /// Data buffer
    pub buf: DmaBuf,
}

/// Completion queue entry status.
///
/// A command succeeded when both the Status Code Type and the Status Code
/// are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status {
    /// Status Code Type
    pub sct: u8,
    /// Status Code
    pub sc: u8,
}

impl Status {
    /// Successful completion
    pub const SUCCESS: Status = Status { sct: 0, sc: 0x00 };
    /// Invalid field in command
    pub const INVALID_FIELD: Status = Status { sct: 0, sc: 0x02 };
    /// Internal error
    pub const INTERNAL_ERROR: Status = Status { sct: 0, sc: 0x06 };
    /// Invalid namespace or format
    pub const INVALID_NAMESPACE: Status = Status { sct: 0, sc: 0x0b };
    /// LBA out of range
    pub const LBA_OUT_OF_RANGE: Status = Status { sct: 0, sc: 0x80 };

    /// Decode the status half-word of a completion entry.
    ///
    /// SCT is in bits 9:11, SC in bits 1:8, bit 0 is the phase tag.
    pub fn from_raw(status_raw: u16) -> Self {
        Self {
            sct: ((status_raw >> 9) & 0x7) as u8,
            sc: ((status_raw >> 1) & 0xff) as u8,
        }
    }

    /// Encode as a status half-word with the phase tag cleared.
    pub fn raw(&self) -> u16 {
        (((self.sct & 0x7) as u16) << 9) | ((self.sc as u16) << 1)
    }

    /// Whether the command succeeded.
    pub fn is_success(&self) -> bool {
        self.sct == 0 && self.sc == 0
    }

    /// Convert into a `Result`.
    pub fn into_result(self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(Error::NvmeError {
                sct: self.sct,
                sc: self.sc,
            })
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SCT={:#x} SC={:#04x}", self.sct, self.sc)
    }
}

/// A finished command: its status and the buffer it carried.
#[derive(Debug)]
pub struct Completion {
    /// Completion status
    pub status: Status,
    /// The command's data buffer
    pub buf: DmaBuf,
}

impl Completion {
    /// The buffer on success; on failure the buffer is freed and the status
    /// is returned as an error.
    pub fn into_result(self) -> Result<DmaBuf> {
        self.status.into_result()?;
        Ok(self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_raw() {
        // SCT=0, SC=0x80 with phase bit set
        let status = Status::from_raw((0x80 << 1) | 1);
        assert_eq!(status, Status::LBA_OUT_OF_RANGE);
        assert!(!status.is_success());
        assert_eq!(Status::from_raw(status.raw()), status);

        let status = Status::from_raw((0x2 << 9) | (0x81 << 1));
        assert_eq!(status.sct, 2);
        assert_eq!(status.sc, 0x81);
    }

    #[test]
    fn test_status_into_result() {
        assert!(Status::SUCCESS.into_result().is_ok());
        match Status::INTERNAL_ERROR.into_result() {
            Err(Error::NvmeError { sct: 0, sc: 0x06 }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }
}
