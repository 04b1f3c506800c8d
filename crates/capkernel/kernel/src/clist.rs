//! Per-vat CLists: the bijection between a vat's local slots and kernel
//! slots.
//!
//! Both directions are stored (`<vat>.c.<kslot>` and `<vat>.c.<vslot>`),
//! entries are only ever added, and allocation is driven purely by the
//! order of calls so replay reproduces every number.

use serde::{Deserialize, Serialize};
use tracing::debug;

use capkernel_types::{CapData, KernelSlot, Message, SlotKind, VatId, VatSlot};

use crate::error::{KernelError, ProtocolViolation};
use crate::keeper::{KernelKeeper, FIRST_IMPORT_ID};
use crate::promise::Decider;

/// One row of a vat's CList.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClistEntry {
    pub kernel_slot: KernelSlot,
    pub vat_slot: VatSlot,
}

fn clist_key(vat: VatId, slot: impl std::fmt::Display) -> String {
    format!("{vat}.c.{slot}")
}

impl KernelKeeper {
    /// Translate a slot a vat is sending outward.
    ///
    /// Vat-allocated slots (`o+N`, `p+N`) are registered on first sight: a
    /// new kernel object owned by the vat, or a new kernel promise the vat
    /// decides. Kernel-allocated slots must already be in the CList.
    pub fn export_to_kernel(&mut self, vat: VatId, slot: VatSlot) -> Result<KernelSlot, KernelError> {
        if let Some(raw) = self.get(&clist_key(vat, slot)) {
            let kslot: KernelSlot = raw
                .parse()
                .map_err(|e| KernelError::Corrupt(format!("clist {vat} {slot}: {e}")))?;
            if kslot.kind != slot.kind {
                return Err(ProtocolViolation::KindMismatch {
                    slot: slot.to_string(),
                    mapped: kslot.to_string(),
                    expected: slot.kind,
                }
                .into());
            }
            return Ok(kslot);
        }

        if !slot.allocated_by_vat {
            return Err(ProtocolViolation::UnknownVatSlot { vat, slot }.into());
        }
        let kslot = match slot.kind {
            SlotKind::Object => self.add_kernel_object(vat)?,
            SlotKind::Promise => self.add_kernel_promise(Decider::Vat(vat))?,
            SlotKind::Device => return Err(ProtocolViolation::IllegalExport { vat, slot }.into()),
        };
        self.add_clist_entry(vat, kslot, slot);
        debug!(vat = %vat, vat_slot = %slot, kernel_slot = %kslot, "Exported to kernel");
        Ok(kslot)
    }

    /// Translate a kernel slot arriving in a vat, allocating the next
    /// `o-N`/`p-N`/`d-N` on first sight.
    pub fn import_from_kernel(&mut self, vat: VatId, kslot: KernelSlot) -> Result<VatSlot, KernelError> {
        if let Some(raw) = self.get(&clist_key(vat, kslot)) {
            let slot: VatSlot = raw
                .parse()
                .map_err(|e| KernelError::Corrupt(format!("clist {vat} {kslot}: {e}")))?;
            if slot.kind != kslot.kind {
                return Err(ProtocolViolation::KindMismatch {
                    slot: kslot.to_string(),
                    mapped: slot.to_string(),
                    expected: kslot.kind,
                }
                .into());
            }
            return Ok(slot);
        }

        let index = self.allocate(&KernelKeeper::import_counter_key(vat, kslot.kind), FIRST_IMPORT_ID)?;
        let slot = VatSlot::imported(kslot.kind, index);
        self.add_clist_entry(vat, kslot, slot);
        debug!(vat = %vat, vat_slot = %slot, kernel_slot = %kslot, "Imported into vat");
        Ok(slot)
    }

    fn add_clist_entry(&mut self, vat: VatId, kslot: KernelSlot, slot: VatSlot) {
        self.set(&clist_key(vat, kslot), &slot.to_string());
        self.set(&clist_key(vat, slot), &kslot.to_string());
    }

    /// The vat's side of a kernel slot, if it has one.
    pub fn vat_slot_for(&self, vat: VatId, kslot: KernelSlot) -> Option<VatSlot> {
        self.get(&clist_key(vat, kslot)).and_then(|raw| raw.parse().ok())
    }

    /// The kernel side of a vat slot, if it has one.
    pub fn kernel_slot_for(&self, vat: VatId, slot: VatSlot) -> Option<KernelSlot> {
        self.get(&clist_key(vat, slot)).and_then(|raw| raw.parse().ok())
    }

    /// Every CList row of `vat`, ordered by kernel slot.
    pub fn clist_entries(&self, vat: VatId) -> Vec<ClistEntry> {
        let prefix = format!("{vat}.c.k");
        let mut entries: Vec<ClistEntry> = self
            .keys_with_prefix(&prefix)
            .into_iter()
            .filter_map(|key| {
                let kernel_slot: KernelSlot = key.strip_prefix(&format!("{vat}.c."))?.parse().ok()?;
                let vat_slot: VatSlot = self.get(&key)?.parse().ok()?;
                Some(ClistEntry {
                    kernel_slot,
                    vat_slot,
                })
            })
            .collect();
        entries.sort_by_key(|e| e.kernel_slot);
        entries
    }

    pub fn export_capdata(&mut self, vat: VatId, data: &CapData<VatSlot>) -> Result<CapData<KernelSlot>, KernelError> {
        data.validate().map_err(ProtocolViolation::MalformedCapData)?;
        data.try_map_slots(|slot| self.export_to_kernel(vat, *slot))
    }

    pub fn import_capdata(&mut self, vat: VatId, data: &CapData<KernelSlot>) -> Result<CapData<VatSlot>, KernelError> {
        data.try_map_slots(|kslot| self.import_from_kernel(vat, *kslot))
    }

    /// Translate an inbound message. The result promise is imported last so
    /// argument slots are numbered first.
    pub fn import_message(&mut self, vat: VatId, msg: &Message<KernelSlot>) -> Result<Message<VatSlot>, KernelError> {
        let args = self.import_capdata(vat, &msg.args)?;
        let result = msg
            .result
            .map(|kp| self.import_from_kernel(vat, kp))
            .transpose()?;
        Ok(Message::new(msg.method.clone(), args, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capkernel_store::MemoryStore;
    use capkernel_types::slot_ref;
    use proptest::prelude::*;
    use serde_json::json;

    fn keeper() -> KernelKeeper {
        KernelKeeper::new(Box::new(MemoryStore::new()))
    }

    fn vs(s: &str) -> VatSlot {
        s.parse().unwrap()
    }

    #[test]
    fn export_allocates_once() {
        let mut k = keeper();
        let v1 = VatId(1);
        let ko = k.export_to_kernel(v1, vs("o+0")).unwrap();
        assert_eq!(ko, KernelSlot::object(20));
        assert_eq!(k.export_to_kernel(v1, vs("o+0")).unwrap(), ko);
        assert_eq!(k.object_owner(ko).unwrap(), v1);

        let kp = k.export_to_kernel(v1, vs("p+5")).unwrap();
        assert_eq!(kp, KernelSlot::promise(40));
        assert_eq!(k.promise(kp).unwrap().decider, Decider::Vat(v1));
    }

    #[test]
    fn import_allocates_from_ten_per_kind() {
        let mut k = keeper();
        let v2 = VatId(2);
        assert_eq!(k.import_from_kernel(v2, KernelSlot::object(20)).unwrap(), vs("o-10"));
        assert_eq!(k.import_from_kernel(v2, KernelSlot::object(21)).unwrap(), vs("o-11"));
        assert_eq!(k.import_from_kernel(v2, KernelSlot::promise(40)).unwrap(), vs("p-10"));
        assert_eq!(k.import_from_kernel(v2, KernelSlot::device(30)).unwrap(), vs("d-10"));
        assert_eq!(k.import_from_kernel(v2, KernelSlot::object(20)).unwrap(), vs("o-10"));
    }

    #[test]
    fn exporting_own_object_back_returns_original() {
        let mut k = keeper();
        let v1 = VatId(1);
        let ko = k.export_to_kernel(v1, vs("o+3")).unwrap();
        assert_eq!(k.import_from_kernel(v1, ko).unwrap(), vs("o+3"));
        let imported = k.import_from_kernel(VatId(2), ko).unwrap();
        assert_eq!(k.export_to_kernel(VatId(2), imported).unwrap(), ko);
    }

    #[test]
    fn unknown_imports_and_device_exports_are_violations() {
        let mut k = keeper();
        let v1 = VatId(1);
        assert!(matches!(
            k.export_to_kernel(v1, vs("o-4")).unwrap_err(),
            KernelError::Protocol(ProtocolViolation::UnknownVatSlot { .. })
        ));
        let fake_device = VatSlot::exported(SlotKind::Device, 1);
        assert!(matches!(
            k.export_to_kernel(v1, fake_device).unwrap_err(),
            KernelError::Protocol(ProtocolViolation::IllegalExport { .. })
        ));
    }

    #[test]
    fn kind_mismatch_is_detected() {
        let mut k = keeper();
        k.set("v1.c.o+1", "kp40");
        assert!(matches!(
            k.export_to_kernel(VatId(1), vs("o+1")).unwrap_err(),
            KernelError::Protocol(ProtocolViolation::KindMismatch { .. })
        ));

        k.set("v1.c.ko20", "p-10");
        let err = k.import_from_kernel(VatId(1), KernelSlot::object(20)).unwrap_err();
        let KernelError::Protocol(ProtocolViolation::KindMismatch { slot, mapped, expected }) = err else {
            panic!("expected a kind mismatch, got {err:?}");
        };
        assert_eq!((slot.as_str(), mapped.as_str()), ("ko20", "p-10"));
        assert_eq!(expected, SlotKind::Object);
        // Nothing was allocated for the bad mapping.
        assert!(k.get("v1.o.nextImport").is_none());
    }

    #[test]
    fn capdata_translation_checks_indices() {
        let mut k = keeper();
        let v1 = VatId(1);
        let good = CapData::from_json(&json!([slot_ref(0)]), vec![vs("o+1")]);
        let kdata = k.export_capdata(v1, &good).unwrap();
        assert_eq!(kdata.slots, vec![KernelSlot::object(20)]);

        let bad = CapData::from_json(&json!([slot_ref(1)]), vec![vs("o+1")]);
        assert!(matches!(
            k.export_capdata(v1, &bad).unwrap_err(),
            KernelError::Protocol(ProtocolViolation::MalformedCapData(_))
        ));
    }

    #[test]
    fn entries_list_both_kinds_in_kernel_order() {
        let mut k = keeper();
        let v1 = VatId(1);
        k.export_to_kernel(v1, vs("p+5")).unwrap();
        k.export_to_kernel(v1, vs("o+0")).unwrap();
        let entries = k.clist_entries(v1);
        assert_eq!(
            entries,
            vec![
                ClistEntry { kernel_slot: KernelSlot::object(20), vat_slot: vs("o+0") },
                ClistEntry { kernel_slot: KernelSlot::promise(40), vat_slot: vs("p+5") },
            ]
        );
    }

    #[derive(Clone, Debug)]
    enum Op {
        Export(u8, bool, u64),
        Import(u8, u64),
    }

    fn kind(k: u8) -> SlotKind {
        if k == 0 {
            SlotKind::Object
        } else {
            SlotKind::Promise
        }
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..2, any::<bool>(), 0u64..6).prop_map(|(k, mine, i)| Op::Export(k, mine, i)),
            (0u8..2, 0u64..6).prop_map(|(k, i)| Op::Import(k, i)),
        ]
    }

    proptest! {
        #[test]
        fn clist_stays_bijective(ops in prop::collection::vec(arb_op(), 1..60)) {
            let mut k = keeper();
            let vat = VatId(1);
            for op in ops {
                match op {
                    Op::Export(kd, mine, i) => {
                        let slot = if mine {
                            VatSlot::exported(kind(kd), i)
                        } else {
                            VatSlot::imported(kind(kd), i + FIRST_IMPORT_ID)
                        };
                        if let Ok(kslot) = k.export_to_kernel(vat, slot) {
                            prop_assert_eq!(k.export_to_kernel(vat, slot).unwrap(), kslot);
                            prop_assert_eq!(k.import_from_kernel(vat, kslot).unwrap(), slot);
                        }
                    }
                    Op::Import(kd, i) => {
                        // Far above anything the export counters reach.
                        let start = if kd == 0 { 1000 } else { 2000 };
                        let kslot = KernelSlot { kind: kind(kd), index: start + i };
                        let slot = k.import_from_kernel(vat, kslot).unwrap();
                        prop_assert_eq!(k.import_from_kernel(vat, kslot).unwrap(), slot);
                        prop_assert_eq!(k.export_to_kernel(vat, slot).unwrap(), kslot);
                    }
                }
            }

            let entries = k.clist_entries(vat);
            let vat_slots: std::collections::BTreeSet<_> = entries.iter().map(|e| e.vat_slot).collect();
            prop_assert_eq!(vat_slots.len(), entries.len());
        }
    }
}
