//! The run loop: one run-queue entry per crank, committed atomically.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value as Json};
use tracing::{debug, info, warn};

use capkernel_store::HostStorage;
use capkernel_types::{
    slot_ref, CapData, DeviceId, KernelMessage, KernelSlot, Message, SharedVatSetup, SlotKind,
    VatDelivery, VatDispatch, VatId, VatOptions, VatParams, VatSlot, VatSyscall,
};

use crate::config::KernelConfig;
use crate::device::{Device, DeviceIo, DeviceOutcome};
use crate::dump::{DeviceDump, KernelDump, ObjectDump, PromiseDump, VatDump};
use crate::error::{KernelError, ProtocolViolation};
use crate::keeper::{KernelKeeper, RunQueueEntry};
use crate::promise::{not_callable, Decider, PromiseState, Resolution};
use crate::transcript::TranscriptEntry;

/// The one-time delivery that starts a fresh kernel.
#[derive(Clone, Debug, PartialEq)]
pub struct Bootstrap {
    /// Name of the vat whose root object receives `bootstrap`.
    pub vat: String,
    /// First argument of the delivery.
    pub argv: Json,
}

/// A crank that faulted. Either nothing had been delivered and the crank
/// was rolled back, or the delivery stands with the faulting syscalls
/// refused.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CrankFault {
    pub crank: u64,
    pub vat: Option<VatId>,
    pub error: String,
}

struct GenesisVat {
    name: String,
    setup: SharedVatSetup,
    options: VatOptions,
}

struct VatRecord {
    name: String,
    options: VatOptions,
    dispatch: Box<dyn VatDispatch>,
}

struct DeviceRecord {
    name: String,
    device: Box<dyn Device>,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum CrankSummary<'a> {
    Delivery {
        entry: &'a RunQueueEntry,
        vat: Option<VatId>,
        transcript: Option<&'a TranscriptEntry>,
        fault: Option<&'a str>,
    },
    DeviceInput {
        device: DeviceId,
        method: &'a str,
        args: &'a CapData<KernelSlot>,
    },
}

pub struct Kernel {
    config: KernelConfig,
    keeper: KernelKeeper,
    genesis_vats: Vec<GenesisVat>,
    genesis_devices: Vec<(String, Box<dyn Device>)>,
    vats: BTreeMap<VatId, VatRecord>,
    devices: BTreeMap<DeviceId, DeviceRecord>,
    started: bool,
    faults: Vec<CrankFault>,
    crank_transcript: Option<(VatId, TranscriptEntry)>,
    // Set once a vat or device has seen this crank's delivery.
    crank_delivered: bool,
}

impl Kernel {
    pub fn new(storage: Box<dyn HostStorage>, config: KernelConfig) -> Self {
        Self {
            config,
            keeper: KernelKeeper::new(storage),
            genesis_vats: Vec::new(),
            genesis_devices: Vec::new(),
            vats: BTreeMap::new(),
            devices: BTreeMap::new(),
            started: false,
            faults: Vec::new(),
            crank_transcript: None,
            crank_delivered: false,
        }
    }

    fn check_new_name(&self, name: &str) -> Result<(), KernelError> {
        if self.started {
            return Err(KernelError::AlreadyStarted);
        }
        let taken = self.genesis_vats.iter().any(|v| v.name == name)
            || self.genesis_devices.iter().any(|(n, _)| n == name);
        if taken {
            return Err(KernelError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    /// Register a vat. IDs are assigned in registration order, so a
    /// restarted kernel must register the same vats in the same order.
    pub fn add_genesis_vat(
        &mut self,
        name: impl Into<String>,
        setup: SharedVatSetup,
        options: VatOptions,
    ) -> Result<(), KernelError> {
        let name = name.into();
        self.check_new_name(&name)?;
        self.genesis_vats.push(GenesisVat {
            name,
            setup,
            options,
        });
        Ok(())
    }

    pub fn add_genesis_device(
        &mut self,
        name: impl Into<String>,
        device: Box<dyn Device>,
    ) -> Result<(), KernelError> {
        let name = name.into();
        self.check_new_name(&name)?;
        self.genesis_devices.push((name, device));
        Ok(())
    }

    /// Build every vat and device. A fresh store gets its genesis state and
    /// the bootstrap delivery; an existing one is rebuilt by replaying
    /// transcripts. Returns whether the store was fresh.
    pub fn start(&mut self, bootstrap: Option<&Bootstrap>) -> Result<bool, KernelError> {
        if self.started {
            return Err(KernelError::AlreadyStarted);
        }
        let fresh = !self.keeper.is_initialized();
        let genesis_vats = std::mem::take(&mut self.genesis_vats);
        let genesis_devices = std::mem::take(&mut self.genesis_devices);

        if !fresh {
            let stored = self.keeper.vat_names()?;
            let registered: Vec<&str> = genesis_vats.iter().map(|v| v.name.as_str()).collect();
            if stored != registered {
                return Err(KernelError::Corrupt(format!(
                    "registered vats {registered:?} do not match stored vats {stored:?}"
                )));
            }
            let stored = self.keeper.device_names()?;
            let registered: Vec<&str> = genesis_devices.iter().map(|(n, _)| n.as_str()).collect();
            if stored != registered {
                return Err(KernelError::Corrupt(format!(
                    "registered devices {registered:?} do not match stored devices {stored:?}"
                )));
            }
        }

        for vat in genesis_vats {
            let vat_id = if fresh {
                self.keeper.allocate_vat_id(&vat.name)?
            } else {
                self.keeper
                    .vat_id(&vat.name)?
                    .ok_or_else(|| KernelError::UnknownVat(vat.name.clone()))?
            };
            let params = VatParams {
                vat_id,
                name: vat.name.clone(),
                options: vat.options.clone(),
            };
            let dispatch = vat.setup.setup(&params);
            self.vats.insert(
                vat_id,
                VatRecord {
                    name: vat.name,
                    options: vat.options,
                    dispatch,
                },
            );
        }

        for (name, mut device) in genesis_devices {
            let device_id = if fresh {
                self.keeper.allocate_device(&name)?.0
            } else {
                self.keeper
                    .device_id(&name)?
                    .ok_or_else(|| KernelError::UnknownDevice(name.clone()))?
            };
            device.restore(self.keeper.device_state(device_id).as_deref());
            self.devices.insert(device_id, DeviceRecord { name, device });
        }

        if fresh {
            if let Some(bootstrap) = bootstrap {
                self.queue_bootstrap(bootstrap)?;
            }
            self.keeper.set_initialized();
            self.keeper.commit()?;
            info!(
                vats = self.vats.len(),
                devices = self.devices.len(),
                bootstrap = ?bootstrap.map(|b| b.vat.as_str()),
                "Kernel initialized"
            );
        } else {
            self.replay()?;
        }

        self.started = true;
        let crank = self.keeper.crank_number()?;
        info!(fresh, crank, "Kernel started");
        Ok(fresh)
    }

    fn ensure_started(&self) -> Result<(), KernelError> {
        if self.started {
            Ok(())
        } else {
            Err(KernelError::NotStarted)
        }
    }

    fn queue_bootstrap(&mut self, bootstrap: &Bootstrap) -> Result<(), KernelError> {
        let boot_vat = self
            .keeper
            .vat_id(&bootstrap.vat)?
            .ok_or_else(|| KernelError::UnknownVat(bootstrap.vat.clone()))?;

        let mut slots = Vec::new();
        let mut vats = serde_json::Map::new();
        for (&vat_id, record) in &self.vats {
            if vat_id == boot_vat {
                continue;
            }
            let root = self.keeper.export_to_kernel(vat_id, VatSlot::root())?;
            vats.insert(record.name.clone(), slot_ref(slots.len()));
            slots.push(root);
        }
        let mut devices = serde_json::Map::new();
        for (&device_id, record) in &self.devices {
            devices.insert(record.name.clone(), slot_ref(slots.len()));
            slots.push(self.keeper.device_slot(device_id)?);
        }

        let args = CapData::from_json(&json!([bootstrap.argv, vats, devices]), slots);
        let kpid = self.queue_to_export(boot_vat, VatSlot::root(), "bootstrap", args)?;
        debug!(vat = %boot_vat, result = %kpid, "Bootstrap queued");
        Ok(())
    }

    fn queue_to_export(
        &mut self,
        vat: VatId,
        export: VatSlot,
        method: &str,
        args: CapData<KernelSlot>,
    ) -> Result<KernelSlot, KernelError> {
        if export.kind != SlotKind::Object {
            return Err(ProtocolViolation::IllegalExport { vat, slot: export }.into());
        }
        args.validate().map_err(ProtocolViolation::MalformedCapData)?;
        let target = self.keeper.export_to_kernel(vat, export)?;
        let kpid = self.keeper.add_result_promise()?;
        self.keeper.push_run_queue(RunQueueEntry::Send {
            target,
            msg: Message::new(method, args, Some(kpid)),
        })?;
        Ok(kpid)
    }

    /// Queue a message straight to an object a vat exports, bypassing
    /// every other vat. Returns the result promise.
    pub fn queue_to_vat_export(
        &mut self,
        vat_name: &str,
        export: VatSlot,
        method: &str,
        args: CapData<KernelSlot>,
    ) -> Result<KernelSlot, KernelError> {
        self.ensure_started()?;
        let vat = self
            .keeper
            .vat_id(vat_name)?
            .ok_or_else(|| KernelError::UnknownVat(vat_name.to_string()))?;
        match self.queue_to_export(vat, export, method, args) {
            Ok(kpid) => {
                self.keeper.commit()?;
                Ok(kpid)
            }
            Err(e) => {
                self.keeper.abort();
                Err(e)
            }
        }
    }

    /// Execute one crank. Returns `false` if the run-queue was empty.
    pub fn step(&mut self) -> Result<bool, KernelError> {
        self.ensure_started()?;
        let Some(entry) = self.keeper.pop_run_queue()? else {
            return Ok(false);
        };
        let crank = self.keeper.crank_number()? + 1;
        self.crank_transcript = None;
        self.crank_delivered = false;

        let outcome = self.process(crank, &entry);
        let transcript = self.crank_transcript.take();

        match outcome {
            Ok(()) => self.finish_crank(crank, &entry, transcript, None)?,
            Err(e) if e.is_crank_fault() => {
                let vat = transcript.as_ref().map(|(vat, _)| *vat);
                let error = e.to_string();
                if self.crank_delivered {
                    // The vat's tables already reflect the delivery; keep
                    // the kernel side of it.
                    warn!(crank, vat = ?vat, error = %error, "Crank fault, delivery kept");
                } else {
                    self.keeper.abort();
                    self.keeper.pop_run_queue()?;
                    warn!(crank, error = %error, "Crank fault, rolled back");
                }

                if let RunQueueEntry::Send {
                    msg: Message {
                        result: Some(kpid), ..
                    },
                    ..
                } = &entry
                {
                    self.reject_for_fault(*kpid, &e)?;
                }
                self.finish_crank(crank, &entry, transcript, Some(&error))?;
                self.faults.push(CrankFault { crank, vat, error });
            }
            Err(e) => {
                self.keeper.abort();
                return Err(e);
            }
        }
        Ok(true)
    }

    /// Step until the run-queue is empty. Returns the number of cranks.
    pub fn run(&mut self) -> Result<u64, KernelError> {
        let mut cranks = 0;
        while self.step()? {
            cranks += 1;
        }
        debug!(cranks, "Run queue drained");
        Ok(cranks)
    }

    fn finish_crank(
        &mut self,
        crank: u64,
        entry: &RunQueueEntry,
        transcript: Option<(VatId, TranscriptEntry)>,
        fault: Option<&str>,
    ) -> Result<(), KernelError> {
        if let Some((vat, t)) = &transcript {
            self.keeper.append_transcript(*vat, t)?;
        }
        let summary = serde_json::to_vec(&CrankSummary::Delivery {
            entry,
            vat: transcript.as_ref().map(|(vat, _)| *vat),
            transcript: transcript.as_ref().map(|(_, t)| t),
            fault,
        })?;
        self.keeper.finish_crank(crank, &summary);
        self.keeper.commit()?;
        debug!(crank, "Crank committed");
        Ok(())
    }

    /// Reject the result of a faulted message unless it is settled or a
    /// vat that is still healthy decides it.
    fn reject_for_fault(&mut self, kpid: KernelSlot, error: &KernelError) -> Result<(), KernelError> {
        let promise = self.keeper.promise(kpid)?;
        if promise.state.is_resolved() {
            return Ok(());
        }
        match (promise.decider, error) {
            (Decider::Kernel, _) => {}
            (Decider::Vat(decider), KernelError::Dispatch { vat, .. }) if decider == *vat => {
                self.keeper.reclaim_decider(kpid)?;
            }
            (Decider::Vat(decider), _) => {
                debug!(kpid = %kpid, decider = %decider, "Faulted message result stays with its decider");
                return Ok(());
            }
        }
        let reason = CapData::error("Error", format!("crank fault: {error}"));
        self.keeper.reject_as_kernel(kpid, reason)
    }

    fn process(&mut self, crank: u64, entry: &RunQueueEntry) -> Result<(), KernelError> {
        match entry {
            RunQueueEntry::Send { target, msg } => self.process_send(crank, *target, msg.clone()),
            RunQueueEntry::Notify { vat, kpid } => self.process_notify(crank, *vat, *kpid),
        }
    }

    fn pipelining_enabled(&self, vat: VatId) -> bool {
        self.vats
            .get(&vat)
            .and_then(|record| record.options.enable_pipelining)
            .unwrap_or(self.config.enable_pipelining)
    }

    fn process_send(&mut self, crank: u64, target: KernelSlot, msg: KernelMessage) -> Result<(), KernelError> {
        match target.kind {
            SlotKind::Object => {
                let owner = self.keeper.object_owner(target)?;
                self.deliver_to_vat(crank, owner, target, msg)
            }
            SlotKind::Device => self.deliver_to_device(target, msg),
            SlotKind::Promise => {
                let promise = self.keeper.promise(target)?;
                match promise.state {
                    PromiseState::Unresolved => match promise.decider {
                        Decider::Vat(vat) if self.pipelining_enabled(vat) => {
                            debug!(kpid = %target, vat = %vat, "Pipelining to decider");
                            self.deliver_to_vat(crank, vat, target, msg)
                        }
                        _ => {
                            debug!(kpid = %target, method = %msg.method, "Queued on unresolved promise");
                            self.keeper.queue_on_promise(target, msg)
                        }
                    },
                    PromiseState::FulfilledToPresence(presence) => {
                        self.process_send(crank, presence, msg)
                    }
                    PromiseState::FulfilledToData(_) => {
                        let reason = not_callable(target, &msg.method);
                        self.reject_result(&msg, reason)
                    }
                    PromiseState::Rejected(reason) => self.reject_result(&msg, reason),
                }
            }
        }
    }

    fn reject_result(&mut self, msg: &KernelMessage, reason: CapData<KernelSlot>) -> Result<(), KernelError> {
        match msg.result {
            Some(kpid) => self.keeper.reject_as_kernel(kpid, reason),
            None => {
                debug!(method = %msg.method, "Dropping failed message with no result");
                Ok(())
            }
        }
    }

    fn deliver_to_vat(
        &mut self,
        crank: u64,
        vat: VatId,
        target: KernelSlot,
        msg: KernelMessage,
    ) -> Result<(), KernelError> {
        if !self.vats.contains_key(&vat) {
            return Err(KernelError::Corrupt(format!("no dispatcher for {vat}")));
        }
        if let Some(kpid) = msg.result {
            self.keeper.assign_decider(kpid, vat)?;
        }
        let vat_target = self.keeper.import_from_kernel(vat, target)?;
        let vat_msg = self.keeper.import_message(vat, &msg)?;
        self.dispatch(
            crank,
            vat,
            VatDelivery::Deliver {
                target: vat_target,
                msg: vat_msg,
            },
        )
    }

    fn process_notify(&mut self, crank: u64, vat: VatId, kpid: KernelSlot) -> Result<(), KernelError> {
        let promise = self.keeper.promise(kpid)?;
        let vpid = self.keeper.import_from_kernel(vat, kpid)?;
        let delivery = match promise.state {
            PromiseState::Unresolved => {
                return Err(KernelError::Corrupt(format!(
                    "notification queued for unresolved {kpid}"
                )))
            }
            PromiseState::FulfilledToPresence(slot) => VatDelivery::NotifyFulfillToPresence {
                promise: vpid,
                target: self.keeper.import_from_kernel(vat, slot)?,
            },
            PromiseState::FulfilledToData(data) => VatDelivery::NotifyFulfillToData {
                promise: vpid,
                data: self.keeper.import_capdata(vat, &data)?,
            },
            PromiseState::Rejected(data) => VatDelivery::NotifyReject {
                promise: vpid,
                data: self.keeper.import_capdata(vat, &data)?,
            },
        };
        self.dispatch(crank, vat, delivery)
    }

    fn dispatch(&mut self, crank: u64, vat: VatId, delivery: VatDelivery) -> Result<(), KernelError> {
        let record = self
            .vats
            .get_mut(&vat)
            .ok_or_else(|| KernelError::Corrupt(format!("no dispatcher for {vat}")))?;
        debug!(crank, vat = %vat, name = %record.name, delivery = delivery.name(), "Delivering");

        self.crank_delivered = true;
        let outcome = record.dispatch.dispatch(&delivery);
        self.crank_transcript = Some((
            vat,
            TranscriptEntry {
                crank,
                delivery,
                syscalls: outcome.syscalls.clone(),
                dispatch_error: outcome.error.as_ref().map(ToString::to_string),
            },
        ));

        let refused = self.apply_syscalls(vat, outcome.syscalls)?;
        if let Some(source) = outcome.error {
            return Err(KernelError::Dispatch { vat, source });
        }
        if !refused.is_empty() {
            return Err(KernelError::Refused {
                owner: vat.to_string(),
                reasons: refused,
            });
        }
        Ok(())
    }

    /// Apply syscalls in order. A syscall that breaks the protocol is
    /// undone and refused on its own; the ones around it still apply.
    fn apply_syscalls(&mut self, vat: VatId, syscalls: Vec<VatSyscall>) -> Result<Vec<String>, KernelError> {
        let mut refused = Vec::new();
        for (index, syscall) in syscalls.into_iter().enumerate() {
            let name = syscall.name();
            let savepoint = self.keeper.savepoint();
            match self.apply_syscall(vat, syscall) {
                Ok(()) => {}
                Err(e) if e.is_crank_fault() => {
                    self.keeper.rollback_to(savepoint);
                    warn!(vat = %vat, index, syscall = name, error = %e, "Syscall refused");
                    refused.push(format!("syscall {index} ({name}): {e}"));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(refused)
    }

    fn promise_slot(&mut self, vat: VatId, slot: VatSlot) -> Result<KernelSlot, KernelError> {
        if !slot.is_promise() {
            return Err(ProtocolViolation::NotAPromise(slot.to_string()).into());
        }
        self.keeper.export_to_kernel(vat, slot)
    }

    fn apply_syscall(&mut self, vat: VatId, syscall: VatSyscall) -> Result<(), KernelError> {
        debug!(vat = %vat, syscall = syscall.name(), "Syscall");
        match syscall {
            VatSyscall::Send {
                target,
                method,
                args,
                result,
            } => {
                let target = self.keeper.export_to_kernel(vat, target)?;
                let args = self.keeper.export_capdata(vat, &args)?;
                let result = match result {
                    Some(slot) => {
                        let kpid = self.promise_slot(vat, slot)?;
                        self.keeper.transfer_to_kernel(vat, kpid)?;
                        Some(kpid)
                    }
                    None => None,
                };
                self.enqueue_send(target, Message::new(method, args, result))
            }
            VatSyscall::Subscribe { promise } => {
                let kpid = self.promise_slot(vat, promise)?;
                self.keeper.subscribe(vat, kpid)
            }
            VatSyscall::FulfillToPresence { promise, target } => {
                let kpid = self.promise_slot(vat, promise)?;
                let target = self.keeper.export_to_kernel(vat, target)?;
                self.keeper
                    .resolve(Decider::Vat(vat), kpid, Resolution::ToPresence(target))
            }
            VatSyscall::FulfillToData { promise, data } => {
                let kpid = self.promise_slot(vat, promise)?;
                let data = self.keeper.export_capdata(vat, &data)?;
                self.keeper
                    .resolve(Decider::Vat(vat), kpid, Resolution::ToData(data))
            }
            VatSyscall::Reject { promise, data } => {
                let kpid = self.promise_slot(vat, promise)?;
                let data = self.keeper.export_capdata(vat, &data)?;
                self.keeper
                    .resolve(Decider::Vat(vat), kpid, Resolution::Reject(data))
            }
            VatSyscall::Log { line } => {
                self.keeper.append_log(&line)?;
                Ok(())
            }
        }
    }

    /// Put a send on the run-queue, short-circuiting targets that are
    /// already settled.
    fn enqueue_send(&mut self, target: KernelSlot, msg: KernelMessage) -> Result<(), KernelError> {
        if target.is_promise() {
            match self.keeper.promise(target)?.state {
                PromiseState::Unresolved => {}
                PromiseState::FulfilledToPresence(presence) => {
                    return self.keeper.push_run_queue(RunQueueEntry::Send {
                        target: presence,
                        msg,
                    });
                }
                PromiseState::FulfilledToData(_) => {
                    let reason = not_callable(target, &msg.method);
                    return self.reject_result(&msg, reason);
                }
                PromiseState::Rejected(reason) => return self.reject_result(&msg, reason),
            }
        }
        self.keeper.push_run_queue(RunQueueEntry::Send { target, msg })
    }

    fn deliver_to_device(&mut self, target: KernelSlot, msg: KernelMessage) -> Result<(), KernelError> {
        let device_id = self.keeper.device_owner(target)?;
        let record = self
            .devices
            .get_mut(&device_id)
            .ok_or_else(|| KernelError::Corrupt(format!("no device for {target}")))?;
        self.crank_delivered = true;
        let mut io = DeviceIo::default();
        let outcome = record.device.invoke(&msg.method, &msg.args, &mut io);
        debug!(device = %device_id, name = %record.name, method = %msg.method, ok = outcome.is_ok(), "Device invoked");
        let mut refused = self.apply_device_io(device_id, io)?;

        if let Some(kpid) = msg.result {
            let resolution = match outcome {
                Ok(data) => data.validate().map(|()| Resolution::ToData(data)),
                Err(reason) => reason.validate().map(|()| Resolution::Reject(reason)),
            };
            let resolution = resolution.unwrap_or_else(|e| {
                refused.push(format!("result of {}: {e}", msg.method));
                Resolution::Reject(CapData::error(
                    "Error",
                    format!("device {device_id} returned malformed capdata"),
                ))
            });
            self.keeper.resolve(Decider::Kernel, kpid, resolution)?;
        }
        if !refused.is_empty() {
            return Err(KernelError::Refused {
                owner: device_id.to_string(),
                reasons: refused,
            });
        }
        Ok(())
    }

    /// Persist device state and queue its sends. Sends with malformed
    /// arguments are dropped and reported.
    fn apply_device_io(&mut self, device_id: DeviceId, io: DeviceIo) -> Result<Vec<String>, KernelError> {
        if let Some(state) = io.state {
            self.keeper.set_device_state(device_id, &state);
        }
        let mut refused = Vec::new();
        for (index, (target, msg)) in io.sends.into_iter().enumerate() {
            if let Err(e) = msg.args.validate() {
                warn!(device = %device_id, index, method = %msg.method, error = %e, "Device send refused");
                refused.push(format!("send {index} ({}): {e}", msg.method));
                continue;
            }
            self.enqueue_send(target, msg)?;
        }
        Ok(refused)
    }

    /// Hand host input to a device. Runs as its own committed crank, so any
    /// sends the device makes land at the tail of the run-queue.
    pub fn device_input(
        &mut self,
        device_name: &str,
        method: &str,
        args: CapData<KernelSlot>,
    ) -> Result<DeviceOutcome, KernelError> {
        self.ensure_started()?;
        let device_id = self
            .keeper
            .device_id(device_name)?
            .ok_or_else(|| KernelError::UnknownDevice(device_name.to_string()))?;
        let crank = self.keeper.crank_number()? + 1;
        let record = self
            .devices
            .get_mut(&device_id)
            .ok_or_else(|| KernelError::UnknownDevice(device_name.to_string()))?;

        let mut io = DeviceIo::default();
        let outcome = record.device.invoke(method, &args, &mut io);
        match self.apply_device_io(device_id, io) {
            Ok(refused) if refused.is_empty() => {}
            Ok(refused) => {
                let error = KernelError::Refused {
                    owner: device_id.to_string(),
                    reasons: refused,
                }
                .to_string();
                self.faults.push(CrankFault {
                    crank,
                    vat: None,
                    error,
                });
            }
            Err(e) => {
                self.keeper.abort();
                return Err(e);
            }
        }

        let summary = serde_json::to_vec(&CrankSummary::DeviceInput {
            device: device_id,
            method,
            args: &args,
        })?;
        self.keeper.finish_crank(crank, &summary);
        self.keeper.commit()?;
        info!(crank, device = device_name, method, "Device input committed");
        Ok(outcome)
    }

    /// Rebuild every vat by re-delivering its transcript and checking that
    /// it makes the same syscalls. Nothing is re-applied to kernel state.
    fn replay(&mut self) -> Result<(), KernelError> {
        let mut deliveries = 0usize;
        for (&vat, record) in self.vats.iter_mut() {
            let entries = self.keeper.transcript(vat)?;
            for (index, entry) in entries.iter().enumerate() {
                let outcome = record.dispatch.dispatch(&entry.delivery);
                let error = outcome.error.as_ref().map(ToString::to_string);
                if outcome.syscalls != entry.syscalls || error != entry.dispatch_error {
                    return Err(KernelError::ReplayDivergence {
                        vat,
                        index: index as u64,
                        detail: describe_divergence(entry, &outcome.syscalls, error.as_deref()),
                    });
                }
            }
            debug!(vat = %vat, name = %record.name, entries = entries.len(), "Vat replayed");
            deliveries += entries.len();
        }
        info!(vats = self.vats.len(), deliveries, "Replay complete");
        Ok(())
    }

    // ---- inspection ----

    pub fn dump(&self) -> Result<KernelDump, KernelError> {
        let mut vats = Vec::new();
        for name in self.keeper.vat_names()? {
            let id = self
                .keeper
                .vat_id(&name)?
                .ok_or_else(|| KernelError::Corrupt(format!("vat {name} has no id")))?;
            vats.push(VatDump {
                id,
                clist: self.keeper.clist_entries(id),
                transcript_length: self.keeper.transcript_len(id),
                name,
            });
        }

        let mut devices = Vec::new();
        for name in self.keeper.device_names()? {
            let id = self
                .keeper
                .device_id(&name)?
                .ok_or_else(|| KernelError::Corrupt(format!("device {name} has no id")))?;
            devices.push(DeviceDump {
                id,
                slot: self.keeper.device_slot(id)?,
                state: self.keeper.device_state(id),
                name,
            });
        }

        let objects = self
            .keeper
            .kernel_objects()?
            .into_iter()
            .map(|(slot, owner)| ObjectDump { slot, owner })
            .collect();
        let promises = self
            .keeper
            .kernel_promises()?
            .into_iter()
            .map(|(slot, p)| PromiseDump {
                slot,
                state: p.state,
                decider: p.decider,
                subscribers: p.subscribers.into_iter().collect(),
                queue: p.queue,
            })
            .collect();

        Ok(KernelDump {
            crank_number: self.keeper.crank_number()?,
            activity_hash: self.keeper.activity_hash(),
            run_queue: self.keeper.run_queue()?,
            log: self.keeper.log_lines()?,
            vats,
            devices,
            objects,
            promises,
        })
    }

    pub fn promise_status(&self, kpid: KernelSlot) -> Result<PromiseState, KernelError> {
        if !kpid.is_promise() {
            return Err(ProtocolViolation::NotAPromise(kpid.to_string()).into());
        }
        Ok(self.keeper.promise(kpid)?.state)
    }

    pub fn vat_name_to_id(&self, name: &str) -> Result<Option<VatId>, KernelError> {
        self.keeper.vat_id(name)
    }

    pub fn device_name_to_id(&self, name: &str) -> Result<Option<DeviceId>, KernelError> {
        self.keeper.device_id(name)
    }

    /// The kernel object a vat exports as `slot`, if it has been exported.
    pub fn exported_object(&self, vat: VatId, slot: VatSlot) -> Option<KernelSlot> {
        self.keeper.kernel_slot_for(vat, slot)
    }

    pub fn crank_number(&self) -> Result<u64, KernelError> {
        self.keeper.crank_number()
    }

    pub fn run_queue_len(&self) -> Result<usize, KernelError> {
        self.keeper.run_queue_len()
    }

    pub fn transcript(&self, vat: VatId) -> Result<Vec<TranscriptEntry>, KernelError> {
        self.keeper.transcript(vat)
    }

    pub fn faults(&self) -> &[CrankFault] {
        &self.faults
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Tear down the kernel, keeping its storage for a later restart.
    pub fn into_storage(self) -> Box<dyn HostStorage> {
        self.keeper.into_storage()
    }
}

fn describe_divergence(entry: &TranscriptEntry, replayed: &[VatSyscall], error: Option<&str>) -> String {
    if entry.syscalls == replayed {
        return format!(
            "recorded dispatch error {:?}, replay produced {error:?}",
            entry.dispatch_error
        );
    }
    let position = entry
        .syscalls
        .iter()
        .zip(replayed)
        .position(|(a, b)| a != b)
        .unwrap_or_else(|| entry.syscalls.len().min(replayed.len()));
    let show = |s: Option<&VatSyscall>| {
        s.map(|s| serde_json::to_string(s).unwrap_or_else(|_| s.name().to_string()))
            .unwrap_or_else(|| "nothing".to_string())
    };
    format!(
        "syscall {position}: recorded {}, replay produced {}",
        show(entry.syscalls.get(position)),
        show(replayed.get(position))
    )
}
