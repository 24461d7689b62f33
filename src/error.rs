//! Structural errors in the input program.
//!
//! These are reported before analysis starts. Verification failures are not
//! errors: they are warnings in the [`crate::verifier::Report`].

use thiserror::Error;

use crate::label::Label;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifierError {
    #[error("empty program")]
    EmptyProgram,

    #[error("{label}: jump to invalid target {target}")]
    InvalidJumpTarget { label: Label, target: i32 },

    #[error("{0}: control flow falls through the end of the program")]
    FallthroughOffEnd(Label),

    #[error("{label}: invalid register r{reg}")]
    InvalidRegister { label: Label, reg: u8 },

    #[error("{label}: invalid access width {width}")]
    InvalidWidth { label: Label, width: i32 },

    #[error("{label}: invalid map fd {fd}")]
    InvalidMapFd { label: Label, fd: i32 },

    #[error("{label}: cannot take the address of program map {fd}")]
    ProgramMapAddress { label: Label, fd: i32 },

    #[error("{label}: illegal recursion")]
    IllegalRecursion { label: Label },

    #[error("{label}: too many call stack frames")]
    CallStackTooDeep { label: Label },

    #[error("{label}: writing to the read-only frame pointer r10")]
    WriteToFramePointer { label: Label },

    #[error("cannot parse state fact `{0}`")]
    InvalidConstraint(String),
}

pub type Result<T> = std::result::Result<T, VerifierError>;
