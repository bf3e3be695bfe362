use core::fmt;

use axerrno::AxError;
use x86::vmx::VmFail;

use crate::vmx::{VcpuState, VmxInstructionError};

/// How a VMX instruction reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmFailKind {
    /// `VMfailValid`: a current VMCS exists and holds an instruction error.
    Valid,
    /// `VMfailInvalid`: there is no current VMCS to report an error in.
    Invalid,
}

impl From<VmFail> for VmFailKind {
    fn from(fail: VmFail) -> Self {
        match fail {
            VmFail::VmFailValid => Self::Valid,
            VmFail::VmFailInvalid => Self::Invalid,
        }
    }
}

/// Errors reported while bringing a processor into VMX operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxError {
    /// A required hardware capability is missing.
    CapabilityAbsent(&'static str),
    /// A control or feature register could not be brought into the state
    /// VMXON requires.
    PreconditionViolation(&'static str),
    /// `VMXON` failed.
    ActivationRejected(VmFailKind),
    /// `VMCLEAR` or `VMPTRLD` rejected the control structure.
    StructureLoadRejected(VmFailKind),
    /// A field value violates a mask from the capability cache. Nothing was
    /// written.
    FieldWriteViolation {
        /// VMCS field encoding.
        field: u32,
        /// The rejected value.
        value: u64,
    },
    /// The first VM entry failed.
    ResumeFailure(VmxInstructionError),
    /// An activation step was called out of order.
    BadState {
        /// State the step must be called from.
        expected: VcpuState,
        /// State the controller was actually in.
        actual: VcpuState,
    },
    /// `VMREAD` or `VMWRITE` failed.
    VmcsAccess {
        /// VMCS field encoding.
        field: u32,
        /// Failure reported by the instruction.
        fail: VmFailKind,
    },
    /// `INVVPID` failed.
    InvalidationRejected(VmFailKind),
    /// An argument is outside the accepted range.
    InvalidInput(&'static str),
    /// Allocating the control-structure pages failed.
    NoMemory,
}

/// Result type of this crate.
pub type Result<T = ()> = core::result::Result<T, VmxError>;

impl fmt::Display for VmxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapabilityAbsent(what) => write!(f, "unsupported platform: {what}"),
            Self::PreconditionViolation(what) => write!(f, "cannot enable VMX: {what}"),
            Self::ActivationRejected(fail) => write!(f, "VMXON failed: {fail:?}"),
            Self::StructureLoadRejected(fail) => write!(f, "VMCS load failed: {fail:?}"),
            Self::FieldWriteViolation { field, value } => write!(
                f,
                "value {value:#x} violates the capability masks of VMCS field {field:#x}"
            ),
            Self::ResumeFailure(err) => write!(f, "VM entry failed: {}", err.as_str()),
            Self::BadState { expected, actual } => {
                write!(f, "vcpu is {actual:?}, operation requires {expected:?}")
            }
            Self::VmcsAccess { field, fail } => {
                write!(f, "VMCS access to field {field:#x} failed: {fail:?}")
            }
            Self::InvalidationRejected(fail) => write!(f, "INVVPID failed: {fail:?}"),
            Self::InvalidInput(what) => write!(f, "invalid input: {what}"),
            Self::NoMemory => write!(f, "out of memory"),
        }
    }
}

impl From<VmxError> for AxError {
    fn from(err: VmxError) -> Self {
        match err {
            VmxError::CapabilityAbsent(_) => AxError::Unsupported,
            VmxError::PreconditionViolation(_) => AxError::PermissionDenied,
            VmxError::ActivationRejected(_) | VmxError::StructureLoadRejected(_) => {
                AxError::ResourceBusy
            }
            VmxError::FieldWriteViolation { .. } | VmxError::InvalidInput(_) => {
                AxError::InvalidInput
            }
            VmxError::ResumeFailure(_)
            | VmxError::VmcsAccess { .. }
            | VmxError::InvalidationRejected(_) => AxError::Io,
            VmxError::BadState { .. } => AxError::BadState,
            VmxError::NoMemory => AxError::NoMemory,
        }
    }
}
