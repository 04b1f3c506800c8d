use serde::{Deserialize, Serialize};

use capkernel_types::{DeviceId, KernelMessage, KernelSlot, VatId};

use crate::clist::ClistEntry;
use crate::keeper::RunQueueEntry;
use crate::promise::{Decider, PromiseState};

/// Structural snapshot of kernel state. Two kernels that processed the same
/// inputs produce equal dumps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelDump {
    pub crank_number: u64,
    pub activity_hash: String,
    pub run_queue: Vec<RunQueueEntry>,
    /// Kernel log lines, oldest first.
    pub log: Vec<String>,
    pub vats: Vec<VatDump>,
    pub devices: Vec<DeviceDump>,
    pub objects: Vec<ObjectDump>,
    pub promises: Vec<PromiseDump>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatDump {
    pub id: VatId,
    pub name: String,
    pub clist: Vec<ClistEntry>,
    pub transcript_length: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDump {
    pub id: DeviceId,
    pub name: String,
    pub slot: KernelSlot,
    pub state: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDump {
    pub slot: KernelSlot,
    pub owner: VatId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseDump {
    pub slot: KernelSlot,
    pub state: PromiseState,
    pub decider: Decider,
    pub subscribers: Vec<VatId>,
    pub queue: Vec<KernelMessage>,
}

impl KernelDump {
    pub fn vat(&self, name: &str) -> Option<&VatDump> {
        self.vats.iter().find(|v| v.name == name)
    }

    pub fn promise(&self, slot: KernelSlot) -> Option<&PromiseDump> {
        self.promises.iter().find(|p| p.slot == slot)
    }
}
