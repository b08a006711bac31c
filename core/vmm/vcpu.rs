//! Virtual CPU (VCPU) run state
//!
//! Tracks where a vCPU is executing so that interrupt injection from any
//! host thread knows how to reach it.

use spin::Mutex;

use crate::core::vmm::VcpuId;

/// VCPU states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    /// VCPU is not created
    Uninitialized,
    /// VCPU is created but not running
    Ready,
    /// VCPU is running guest code on the given host CPU
    Running(usize),
    /// VCPU is blocked in WFI
    Blocked,
    /// VCPU has exited
    Exited,
}

impl VcpuState {
    /// Whether the vCPU can receive interrupts
    pub fn is_active(self) -> bool {
        !matches!(self, VcpuState::Uninitialized | VcpuState::Exited)
    }
}

#[derive(Debug)]
struct RunState {
    state: VcpuState,
    wakeup: bool,
}

/// VCPU structure
#[derive(Debug)]
pub struct VirtualCpu {
    id: VcpuId,
    run: Mutex<RunState>,
}

impl VirtualCpu {
    /// Create an uninitialized vCPU slot
    pub fn new(id: VcpuId) -> Self {
        Self {
            id,
            run: Mutex::new(RunState { state: VcpuState::Uninitialized, wakeup: false }),
        }
    }

    /// VCPU index
    pub fn id(&self) -> VcpuId {
        self.id
    }

    /// Current run state
    pub fn state(&self) -> VcpuState {
        self.run.lock().state
    }

    /// Set the run state
    pub fn set_state(&self, state: VcpuState) {
        log::trace!("vcpu{}: {:?}", self.id, state);
        self.run.lock().state = state;
    }

    /// Record a wakeup request and return the state observed with it
    pub(crate) fn post_wakeup(&self) -> VcpuState {
        let mut run = self.run.lock();
        run.wakeup = true;
        run.state
    }

    /// Consume a pending wakeup request
    pub(crate) fn take_wakeup(&self) -> bool {
        core::mem::replace(&mut self.run.lock().wakeup, false)
    }
}
