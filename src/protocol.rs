//! Frame types and session-ordering rules for the client/server wire
//! protocol.
//!
//! Every frame is a five-byte header `<type:1><value:4 LE>` optionally
//! followed by `value` payload bytes. `TERMINATE_COMMAND` and `EXIT_CODE`
//! never carry a payload: their header value is the datum itself (zero,
//! and the signed exit code). A zero-length data frame on a stream type
//! means the stream has closed.

use thiserror::Error;

pub const HEADER_LEN: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Relative working directory, client to server.
    WorkingDirectory = 0,
    /// `NAME=VALUE` pair, client to server.
    EnvironmentVariable = 1,
    /// One element of the argument vector, client to server.
    CommandArgument = 2,
    /// Command name; the unique transition out of the prologue.
    StartCommand = 3,
    /// Stdin bytes in both directions; server to client it is always a
    /// zero-length close notice.
    StdinData = 4,
    StdoutData = 5,
    StderrData = 6,
    /// Ends the session, client to server.
    TerminateCommand = 7,
    /// Signed exit code in the header value; the terminal frame.
    ExitCode = 8,
}

impl FrameType {
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0 => Ok(FrameType::WorkingDirectory),
            1 => Ok(FrameType::EnvironmentVariable),
            2 => Ok(FrameType::CommandArgument),
            3 => Ok(FrameType::StartCommand),
            4 => Ok(FrameType::StdinData),
            5 => Ok(FrameType::StdoutData),
            6 => Ok(FrameType::StderrData),
            7 => Ok(FrameType::TerminateCommand),
            8 => Ok(FrameType::ExitCode),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }

    /// Whether the header value is a payload length rather than a datum.
    pub fn carries_payload(self) -> bool {
        !matches!(self, FrameType::TerminateCommand | FrameType::ExitCode)
    }

    /// Whether the frame is only legal before `START_COMMAND`.
    pub fn is_prologue(self) -> bool {
        matches!(
            self,
            FrameType::WorkingDirectory | FrameType::EnvironmentVariable | FrameType::CommandArgument
        )
    }
}

/// Session phase shared by both sides: the prologue admits frame types
/// 0 through 3, everything after `START_COMMAND` admits 4 through 8.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Prologue,
    Running,
}

impl Phase {
    pub fn admits(self, frame_type: FrameType) -> bool {
        match self {
            Phase::Prologue => frame_type.is_prologue() || frame_type == FrameType::StartCommand,
            Phase::Running => !frame_type.is_prologue() && frame_type != FrameType::StartCommand,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    /// Little-endian header value: the payload length for data frames,
    /// the datum for control frames.
    pub value: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn header(frame_type: FrameType, value: u32) -> [u8; HEADER_LEN] {
        let length = value.to_le_bytes();
        [frame_type as u8, length[0], length[1], length[2], length[3]]
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("read invalid payload type ({0}) from socket")]
    UnknownType(u8),
    #[error("socket closed mid-header")]
    TruncatedHeader,
    #[error("socket closed after reading {got} of {expected} payload bytes")]
    TruncatedPayload { got: usize, expected: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_round_trip() {
        for byte in 0..=8u8 {
            assert_eq!(FrameType::from_byte(byte).unwrap() as u8, byte);
        }

        assert!(FrameType::from_byte(9).is_err());
        assert!(FrameType::from_byte(255).is_err());
    }

    #[test]
    fn control_frames_have_no_payload() {
        assert!(!FrameType::TerminateCommand.carries_payload());
        assert!(!FrameType::ExitCode.carries_payload());
        assert!(FrameType::StdinData.carries_payload());
    }

    #[test]
    fn phases_partition_the_frame_types() {
        for byte in 0..=8u8 {
            let frame_type = FrameType::from_byte(byte).unwrap();

            assert_ne!(
                Phase::Prologue.admits(frame_type),
                Phase::Running.admits(frame_type)
            );
        }

        assert!(Phase::Prologue.admits(FrameType::StartCommand));
        assert!(!Phase::Running.admits(FrameType::StartCommand));
        assert!(!Phase::Prologue.admits(FrameType::ExitCode));
    }

    #[test]
    fn header_layout_is_little_endian() {
        assert_eq!(
            Frame::header(FrameType::ExitCode, 0x0102_0304),
            [8, 0x04, 0x03, 0x02, 0x01]
        );
    }
}
