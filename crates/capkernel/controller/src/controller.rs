//! The host's handle on a running kernel.

use serde_json::{json, Value as Json};
use tracing::info;

use capkernel_kernel::{
    Bootstrap, CrankFault, Device, DeviceOutcome, Kernel, KernelConfig, KernelDump, KernelError,
    PromiseState, TranscriptEntry,
};
use capkernel_store::{HostStorage, JournalStore, MemoryStore};
use capkernel_types::{CapData, DeviceId, KernelSlot, SharedVatSetup, VatId, VatOptions, VatSlot};

use crate::config::{ControllerConfig, StorageConfig};
use crate::devices::builtin_device;
use crate::error::{ControllerError, ControllerResult};
use crate::registry::ModuleRegistry;

/// Collects genesis vats, devices, the bootstrap choice and storage, then
/// starts a kernel over them.
pub struct ControllerBuilder {
    kernel: KernelConfig,
    storage: Option<Box<dyn HostStorage>>,
    vats: Vec<(String, SharedVatSetup, VatOptions)>,
    devices: Vec<(String, Box<dyn Device>)>,
    bootstrap: Option<String>,
    argv: Json,
}

impl Default for ControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerBuilder {
    pub fn new() -> Self {
        Self {
            kernel: KernelConfig::default(),
            storage: None,
            vats: Vec::new(),
            devices: Vec::new(),
            bootstrap: None,
            argv: json!([]),
        }
    }

    /// Everything a config file describes, with vat modules resolved
    /// through `registry`. Journal storage is opened here, and created if
    /// it does not exist yet.
    pub fn from_config(config: &ControllerConfig, registry: &ModuleRegistry) -> ControllerResult<Self> {
        Self::configured(config, registry, false)
    }

    /// Like [`ControllerBuilder::from_config`], for inspecting a journal
    /// that must already exist. A missing journal is an error and nothing
    /// is created on disk.
    pub fn from_existing(config: &ControllerConfig, registry: &ModuleRegistry) -> ControllerResult<Self> {
        Self::configured(config, registry, true)
    }

    fn configured(config: &ControllerConfig, registry: &ModuleRegistry, existing: bool) -> ControllerResult<Self> {
        let mut builder = Self::new()
            .kernel_config(config.kernel.clone())
            .argv(json!(config.argv));
        if let Some(vat) = &config.bootstrap {
            builder = builder.bootstrap(vat.clone());
        }
        for vat in &config.vats {
            builder = builder.vat(vat.name.clone(), registry.get(&vat.module)?, vat.options.clone());
        }
        for name in &config.devices {
            builder = builder.device(name.clone(), builtin_device(name)?);
        }
        let storage: Box<dyn HostStorage> = match &config.storage {
            StorageConfig::Memory if existing => {
                return Err(ControllerError::Config(
                    "an in-memory store has no existing state to open".into(),
                ))
            }
            StorageConfig::Memory => Box::new(MemoryStore::new()),
            StorageConfig::Journal { dir, .. } => {
                let journal = config.storage.journal_config().unwrap_or_default();
                if existing {
                    Box::new(JournalStore::open_existing(dir.clone(), journal)?)
                } else {
                    Box::new(JournalStore::open(dir.clone(), journal)?)
                }
            }
        };
        Ok(builder.storage(storage))
    }

    pub fn kernel_config(mut self, config: KernelConfig) -> Self {
        self.kernel = config;
        self
    }

    /// Defaults to a fresh [`MemoryStore`].
    pub fn storage(mut self, storage: Box<dyn HostStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Register a genesis vat. Order matters: it fixes vat IDs.
    pub fn vat(mut self, name: impl Into<String>, setup: SharedVatSetup, options: VatOptions) -> Self {
        self.vats.push((name.into(), setup, options));
        self
    }

    pub fn device(mut self, name: impl Into<String>, device: Box<dyn Device>) -> Self {
        self.devices.push((name.into(), device));
        self
    }

    /// The vat whose root receives `bootstrap` on first start.
    pub fn bootstrap(mut self, vat: impl Into<String>) -> Self {
        self.bootstrap = Some(vat.into());
        self
    }

    pub fn argv(mut self, argv: Json) -> Self {
        self.argv = argv;
        self
    }

    /// Start the kernel. A fresh store gets the bootstrap delivery queued;
    /// an existing one is replayed.
    pub fn build(self) -> ControllerResult<Controller> {
        let storage = self
            .storage
            .unwrap_or_else(|| Box::new(MemoryStore::new()));
        let mut kernel = Kernel::new(storage, self.kernel);
        for (name, setup, options) in self.vats {
            kernel.add_genesis_vat(name, setup, options)?;
        }
        for (name, device) in self.devices {
            kernel.add_genesis_device(name, device)?;
        }
        let bootstrap = self.bootstrap.map(|vat| Bootstrap {
            vat,
            argv: self.argv,
        });
        let fresh = kernel.start(bootstrap.as_ref())?;
        info!(fresh, "Controller ready");
        Ok(Controller { kernel, fresh })
    }
}

pub struct Controller {
    kernel: Kernel,
    fresh: bool,
}

impl Controller {
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder::new()
    }

    /// Whether this start created the store (and queued bootstrap).
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Run one crank. `false` once the run-queue is empty.
    pub fn step(&mut self) -> ControllerResult<bool> {
        Ok(self.kernel.step()?)
    }

    /// Run until the run-queue is empty, returning the number of cranks.
    pub fn run(&mut self) -> ControllerResult<u64> {
        let cranks = self.kernel.run()?;
        info!(cranks, faults = self.kernel.faults().len(), "Run queue drained");
        Ok(cranks)
    }

    pub fn dump(&self) -> ControllerResult<KernelDump> {
        Ok(self.kernel.dump()?)
    }

    pub fn vat_name_to_id(&self, name: &str) -> ControllerResult<VatId> {
        self.kernel
            .vat_name_to_id(name)?
            .ok_or_else(|| KernelError::UnknownVat(name.to_string()).into())
    }

    pub fn device_name_to_id(&self, name: &str) -> ControllerResult<DeviceId> {
        self.kernel
            .device_name_to_id(name)?
            .ok_or_else(|| KernelError::UnknownDevice(name.to_string()).into())
    }

    /// Queue a message to an object `vat` exports. Returns the result
    /// promise, which the host can watch with [`Controller::promise_status`].
    pub fn queue_to_vat_export(
        &mut self,
        vat: &str,
        export: VatSlot,
        method: &str,
        args: CapData<KernelSlot>,
    ) -> ControllerResult<KernelSlot> {
        Ok(self.kernel.queue_to_vat_export(vat, export, method, args)?)
    }

    /// [`Controller::queue_to_vat_export`] aimed at the vat's root object.
    pub fn queue_to_vat_root(&mut self, vat: &str, method: &str, args: CapData<KernelSlot>) -> ControllerResult<KernelSlot> {
        self.queue_to_vat_export(vat, VatSlot::root(), method, args)
    }

    pub fn device_input(&mut self, device: &str, method: &str, args: CapData<KernelSlot>) -> ControllerResult<DeviceOutcome> {
        Ok(self.kernel.device_input(device, method, args)?)
    }

    pub fn promise_status(&self, kpid: KernelSlot) -> ControllerResult<PromiseState> {
        Ok(self.kernel.promise_status(kpid)?)
    }

    /// State a device last persisted.
    pub fn device_state(&self, device: &str) -> ControllerResult<Option<String>> {
        let dump = self.dump()?;
        dump.devices
            .into_iter()
            .find(|d| d.name == device)
            .map(|d| d.state)
            .ok_or_else(|| KernelError::UnknownDevice(device.to_string()).into())
    }

    pub fn transcript(&self, vat: &str) -> ControllerResult<Vec<TranscriptEntry>> {
        let id = self.vat_name_to_id(vat)?;
        Ok(self.kernel.transcript(id)?)
    }

    pub fn crank_number(&self) -> ControllerResult<u64> {
        Ok(self.kernel.crank_number()?)
    }

    pub fn faults(&self) -> &[CrankFault] {
        self.kernel.faults()
    }

    /// Stop, handing back the storage for a later restart.
    pub fn shutdown(self) -> Box<dyn HostStorage> {
        self.kernel.into_storage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capkernel_liveslots::{liveslots_vat, Far};
    use capkernel_store::StoreError;

    fn echo() -> SharedVatSetup {
        liveslots_vat(|_ctx| Far::new("Echo").method("echo", |_ctx, mut args| Ok(args.remove(0))))
    }

    #[test]
    fn test_empty_builder_starts() {
        let mut controller = Controller::builder().build().unwrap();
        assert!(controller.is_fresh());
        assert_eq!(controller.run().unwrap(), 0);
    }

    #[test]
    fn test_queue_to_root_resolves() {
        let mut controller = Controller::builder()
            .vat("echo", echo(), VatOptions::default())
            .build()
            .unwrap();
        let kpid = controller
            .queue_to_vat_root("echo", "echo", CapData::from_json(&json!(["hi"]), vec![]))
            .unwrap();
        controller.run().unwrap();
        assert_eq!(
            controller.promise_status(kpid).unwrap(),
            PromiseState::FulfilledToData(CapData::from_json(&json!("hi"), vec![]))
        );
    }

    #[test]
    fn test_name_lookups() {
        let controller = Controller::builder()
            .vat("echo", echo(), VatOptions::default())
            .device("clock", builtin_device("clock").unwrap())
            .build()
            .unwrap();
        assert!(controller.vat_name_to_id("echo").is_ok());
        assert!(controller.device_name_to_id("clock").is_ok());
        assert!(matches!(
            controller.vat_name_to_id("nobody"),
            Err(ControllerError::Kernel(KernelError::UnknownVat(_)))
        ));
    }

    #[test]
    fn test_from_existing_requires_a_journal() {
        let parent = tempfile::tempdir().unwrap();
        let dir = parent.path().join("journal");
        let config = ControllerConfig {
            storage: StorageConfig::journal(&dir),
            ..ControllerConfig::default()
        };
        let registry = ModuleRegistry::with_builtins();

        let err = ControllerBuilder::from_existing(&config, &registry).err();
        assert!(matches!(err, Some(ControllerError::Store(StoreError::NotFound(_)))));
        assert!(!dir.exists());

        let mut controller = ControllerBuilder::from_config(&config, &registry)
            .unwrap()
            .build()
            .unwrap();
        controller.run().unwrap();
        drop(controller);
        let reopened = ControllerBuilder::from_existing(&config, &registry)
            .unwrap()
            .build()
            .unwrap();
        assert!(!reopened.is_fresh());

        let memory = ControllerConfig::default();
        assert!(matches!(
            ControllerBuilder::from_existing(&memory, &registry).err(),
            Some(ControllerError::Config(_))
        ));
    }

    #[test]
    fn test_unknown_module_in_config() {
        let mut config = ControllerConfig::default();
        config.vats.push(crate::config::VatConfig::new("x", "no-such-module"));
        let err = ControllerBuilder::from_config(&config, &ModuleRegistry::with_builtins()).err();
        assert!(matches!(err, Some(ControllerError::UnknownModule(_))));
    }
}
