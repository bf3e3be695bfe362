//! Unit tests for the vmx_vcpu crate.
//!
//! Scenarios run the controller against the simulated processor in
//! [`crate::test_utils::mock`]. The per-processor table is global, so every
//! test uses its own APIC id.

mod exit_handling;

use alloc::boxed::Box;

use crate::Vcpu;
use crate::test_utils::mock::{MockCpu, MockCpuConfig, MockHal};

fn new_vcpu(config: MockCpuConfig) -> Box<Vcpu<MockHal>> {
    Vcpu::new(MockCpu::new(config)).unwrap()
}

/// A controller that went through the whole activation sequence.
fn launched_vcpu(config: MockCpuConfig) -> Box<Vcpu<MockHal>> {
    let mut vcpu = new_vcpu(config);
    vcpu.virtualize().unwrap();
    vcpu
}
