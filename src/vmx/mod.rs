mod capability;
mod definitions;
pub(crate) mod entry;
mod exit;
mod host;
pub(crate) mod percpu;
mod structs;
mod vcpu;
pub(crate) mod vmcs;

pub use self::capability::{CachedVcpuData, ControlCapability, VmxControlCapabilities};
pub use self::definitions::{InvVpidKind, VmxExitReason, VmxInstructionError};
pub use self::host::{HostEnvironment, IdtEntry, TrapFrame};
pub use self::structs::{MsrAccess, MsrBitmap, VmxBasic};
pub use self::vcpu::{ExitAction, Vcpu, VcpuState};
pub use self::vmcs::{CrField, VmxControl};

/// Return if current platform support virtualization extension.
pub fn has_hardware_support() -> bool {
    if let Some(feature) = raw_cpuid::CpuId::new().get_feature_info() {
        feature.has_vmx()
    } else {
        false
    }
}
