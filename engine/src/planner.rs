//! SD card partition planning.
//!
//! A [`PartitionPlan`] splits a card into the HOS FAT data partition, an optional
//! Linux partition, optional Android partitions and an optional (single or double)
//! emuMMC area. Sizes are kept in MiB; every change goes through a setter that
//! returns a new plan or rejects the change, so a plan is always consistent:
//!
//! `hos + emummc + linux + android + 16 == usable MiB` and `hos >= minimum`.

use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::error::EngineError;
use crate::layout::LayoutTable;
use crate::mbr::Mbr;

/// Sectors per MiB.
pub const MIB_SECTORS: u64 = 1 << 11;
/// The first 16 MiB hold the partition tables and stay unallocated.
pub const LAYOUT_BASE_LBA: u64 = 0x8000;
pub const RESERVED_MIB: u64 = 16;
/// BOOT0 + BOOT1 + 16 MiB offset + 8 MiB alignment, added to every emuMMC size.
pub const EMUMMC_RESERVED_MIB: u64 = 4 + 4 + 16 + 8;
/// Android system partitions carved out before the user data partition.
pub const ANDROID_RESERVED_MIB: u64 = 4096;
pub const LINUX_MIN_MIB: u64 = 8192;
pub const ANDROID_MIN_MIB: u64 = 8192;
pub const MAX_EMUMMC_SLIDER: u32 = 20;
/// Slider position meaning a full-size copy of the reference eMMC.
pub const EMUMMC_FULL_SLIDER: u32 = 10;

/// What the HOS data partition lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetMedium {
    SdCard,
    Emmc,
}

impl TargetMedium {
    /// Smallest allowed HOS partition, in MiB.
    pub fn hos_minimum_mib(&self) -> u64 {
        match self {
            TargetMedium::SdCard => 2048,
            TargetMedium::Emmc => 1024,
        }
    }
}

/// eMMC model the FULL emuMMC size is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceDevice {
    Emmc32Gb,
    Emmc64Gb,
}

impl ReferenceDevice {
    pub fn full_emummc_mib(&self) -> u64 {
        match self {
            ReferenceDevice::Emmc32Gb => 29856,
            // One extra MiB for the backup GPT.
            ReferenceDevice::Emmc64Gb => 59664 + 1,
        }
    }
}

impl FromStr for ReferenceDevice {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "32" | "32gb" | "emmc32" => Ok(Self::Emmc32Gb),
            "64" | "64gb" | "emmc64" => Ok(Self::Emmc64Gb),
            _ => Err(EngineError::Config {
                reason: format!("invalid reference eMMC '{}' (32 or 64)", s),
            }),
        }
    }
}

impl fmt::Display for ReferenceDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceDevice::Emmc32Gb => write!(f, "32GB"),
            ReferenceDevice::Emmc64Gb => write!(f, "64GB"),
        }
    }
}

/// Android partition layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AndroidScheme {
    /// vendor, APP, LNX, SOS, DTB, MDA, CAC, MSC, UDA
    Legacy,
    /// super replaces vendor and APP
    Dynamic,
}

impl FromStr for AndroidScheme {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "legacy" => Ok(Self::Legacy),
            "dynamic" => Ok(Self::Dynamic),
            _ => Err(EngineError::Config {
                reason: format!("invalid Android scheme '{}' (legacy or dynamic)", s),
            }),
        }
    }
}

impl fmt::Display for AndroidScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AndroidScheme::Legacy => write!(f, "legacy"),
            AndroidScheme::Dynamic => write!(f, "dynamic"),
        }
    }
}

/// Result of moving one of the sliders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliderChange {
    /// Taken as requested.
    Accepted(PartitionPlan),
    /// Taken after snapping or clamping; `value` is the slider's new position.
    Adjusted { plan: PartitionPlan, value: u64 },
    /// Refused; the slider goes back to `value`.
    Rejected { value: u64 },
}

impl SliderChange {
    /// The new plan, if the change was taken.
    pub fn plan(self) -> Option<PartitionPlan> {
        match self {
            SliderChange::Accepted(plan) | SliderChange::Adjusted { plan, .. } => Some(plan),
            SliderChange::Rejected { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    device_sectors: u64,
    total_sectors: u64,
    alignment_sectors: u64,
    medium: TargetMedium,
    reference: ReferenceDevice,
    scheme: AndroidScheme,
    hos_mib: u64,
    emummc_mib: u64,
    emummc_double: bool,
    linux_mib: u64,
    android_mib: u64,
}

impl PartitionPlan {
    /// A plan giving the whole card to HOS.
    ///
    /// The usable size is the device size aligned down to 16 MiB; the remainder
    /// is appended to the HOS partition when it is the only one.
    pub fn new(
        device_sectors: u64,
        medium: TargetMedium,
        reference: ReferenceDevice,
    ) -> Result<Self, EngineError> {
        let total_sectors = device_sectors - device_sectors % LAYOUT_BASE_LBA;
        let alignment_sectors = device_sectors - total_sectors;
        let usable_mib = total_sectors / MIB_SECTORS;
        if usable_mib <= RESERVED_MIB + medium.hos_minimum_mib() {
            return Err(EngineError::LayoutConstraintViolated {
                reason: format!(
                    "device of {} MiB is too small for a {} MiB data partition",
                    usable_mib,
                    medium.hos_minimum_mib()
                ),
            });
        }
        Ok(PartitionPlan {
            device_sectors,
            total_sectors,
            alignment_sectors,
            medium,
            reference,
            scheme: AndroidScheme::Legacy,
            hos_mib: usable_mib - RESERVED_MIB,
            emummc_mib: 0,
            emummc_double: false,
            linux_mib: 0,
            android_mib: 0,
        })
    }

    pub fn with_android_scheme(mut self, scheme: AndroidScheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// HOS size left over for the given other sizes. May be negative.
    fn hos_for(&self, emummc: u64, linux: u64, android: u64) -> i64 {
        (self.total_sectors / MIB_SECTORS) as i64
            - RESERVED_MIB as i64
            - emummc as i64
            - linux as i64
            - android as i64
    }

    fn minimum(&self) -> i64 {
        self.medium.hos_minimum_mib() as i64
    }

    /// Move the emuMMC slider (0..=20).
    ///
    /// 0 removes emuMMC, 1..=9 give `(v + 3)` GiB plus the reserved area, 10 is
    /// a full copy of the reference eMMC. 11..=20 are the same sizes doubled,
    /// split over two emuMMC partitions.
    pub fn set_emummc_slider(&self, value: u32) -> SliderChange {
        if value > MAX_EMUMMC_SLIDER {
            return SliderChange::Rejected {
                value: self.emummc_slider() as u64,
            };
        }

        let full = self.reference.full_emummc_mib();
        let double = value > EMUMMC_FULL_SLIDER;
        let base = if double { value - EMUMMC_FULL_SLIDER } else { value } as u64;
        let size = match value {
            0 => 0,
            EMUMMC_FULL_SLIDER => full,
            MAX_EMUMMC_SLIDER => 2 * full,
            _ if double => ((base + 3) * 1024 + EMUMMC_RESERVED_MIB) * 2,
            _ => (base + 3) * 1024 + EMUMMC_RESERVED_MIB,
        };

        let hos = self.hos_for(size, self.linux_mib, self.android_mib);
        if hos > self.minimum() {
            debug!("emuMMC slider {} -> {} MiB (double: {})", value, size, double);
            SliderChange::Accepted(PartitionPlan {
                emummc_mib: size,
                emummc_double: double,
                hos_mib: hos as u64,
                ..self.clone()
            })
        } else {
            SliderChange::Rejected {
                value: self.emummc_slider() as u64,
            }
        }
    }

    /// Slider position encoding the current emuMMC size.
    pub fn emummc_slider(&self) -> u32 {
        let full = self.reference.full_emummc_mib();
        let size = self.emummc_mib;
        if size == 0 {
            0
        } else if size == full {
            EMUMMC_FULL_SLIDER
        } else if size == 2 * full {
            MAX_EMUMMC_SLIDER
        } else {
            let single = if self.emummc_double { size / 2 } else { size };
            let base = (single.saturating_sub(EMUMMC_RESERVED_MIB) / 1024).saturating_sub(3) as u32;
            if self.emummc_double {
                base + EMUMMC_FULL_SLIDER
            } else {
                base
            }
        }
    }

    /// Set the Linux partition size in MiB.
    ///
    /// Below 4096 means none, below 8192 is raised to 8192. A size that would
    /// shrink HOS under its minimum is clamped to what is left.
    pub fn set_linux_size(&self, requested_mib: u64) -> SliderChange {
        let size = if requested_mib < 4096 {
            0
        } else if requested_mib < LINUX_MIN_MIB {
            LINUX_MIN_MIB
        } else {
            requested_mib
        };

        let hos = self.hos_for(self.emummc_mib, size, self.android_mib);
        let (size, hos) = if hos > self.minimum() {
            (size, hos)
        } else {
            let clamped = self.hos_for(self.emummc_mib, 0, self.android_mib) - self.minimum();
            if clamped < LINUX_MIN_MIB as i64 {
                return SliderChange::Rejected {
                    value: self.linux_mib,
                };
            }
            (clamped as u64, self.minimum())
        };

        let plan = PartitionPlan {
            linux_mib: size,
            hos_mib: hos as u64,
            ..self.clone()
        };
        if size == requested_mib {
            SliderChange::Accepted(plan)
        } else {
            SliderChange::Adjusted { plan, value: size }
        }
    }

    /// Set the Android user data size in MiB. The reserved system partitions
    /// are added on top.
    ///
    /// Below 2048 means none, below 4096 is raised to 4096. Clamped like Linux.
    pub fn set_android_user_size(&self, requested_mib: u64) -> SliderChange {
        let user = if requested_mib < 2048 {
            0
        } else if requested_mib < 4096 {
            4096
        } else {
            requested_mib
        };
        let size = if user > 0 { user + ANDROID_RESERVED_MIB } else { 0 };

        let hos = self.hos_for(self.emummc_mib, self.linux_mib, size);
        let (size, user, hos) = if hos > self.minimum() {
            (size, user, hos)
        } else {
            let clamped = self.hos_for(self.emummc_mib, self.linux_mib, 0) - self.minimum();
            if clamped < ANDROID_MIN_MIB as i64 {
                return SliderChange::Rejected {
                    value: self.android_user_mib(),
                };
            }
            let clamped = clamped as u64;
            (clamped, clamped - ANDROID_RESERVED_MIB, self.minimum())
        };

        let plan = PartitionPlan {
            android_mib: size,
            hos_mib: hos as u64,
            ..self.clone()
        };
        if user == requested_mib {
            SliderChange::Accepted(plan)
        } else {
            SliderChange::Adjusted { plan, value: user }
        }
    }

    /// Check every sizing rule.
    pub fn validate(&self) -> Result<(), EngineError> {
        let violation = |reason: String| Err(EngineError::LayoutConstraintViolated { reason });
        let sum = self.hos_mib + self.emummc_mib + self.linux_mib + self.android_mib + RESERVED_MIB;
        if sum != self.total_sectors / MIB_SECTORS {
            return violation(format!(
                "partitions add up to {} MiB, card has {} MiB",
                sum,
                self.total_sectors / MIB_SECTORS
            ));
        }
        if self.hos_mib < self.medium.hos_minimum_mib() {
            return violation(format!(
                "data partition is {} MiB, minimum is {} MiB",
                self.hos_mib,
                self.medium.hos_minimum_mib()
            ));
        }
        if self.linux_mib != 0 && self.linux_mib < LINUX_MIN_MIB {
            return violation(format!("Linux partition of {} MiB is below 8 GiB", self.linux_mib));
        }
        if self.android_mib != 0 && self.android_mib < ANDROID_MIN_MIB {
            return violation(format!("Android partitions of {} MiB are below 8 GiB", self.android_mib));
        }
        if self.emummc_double && self.emummc_mib == 0 {
            return violation("double emuMMC without a size".to_string());
        }
        Ok(())
    }

    /// Partition tables and zeroing for this plan. `previous` is the MBR
    /// currently on the device, whose bootstrap metadata is kept.
    pub fn layout(&self, previous: Option<&Mbr>) -> Result<LayoutTable, EngineError> {
        self.validate()?;
        LayoutTable::from_plan(self, previous)
    }

    pub fn device_sectors(&self) -> u64 {
        self.device_sectors
    }

    /// Device size aligned down to 16 MiB.
    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    pub fn alignment_sectors(&self) -> u64 {
        self.alignment_sectors
    }

    pub fn medium(&self) -> TargetMedium {
        self.medium
    }

    pub fn reference(&self) -> ReferenceDevice {
        self.reference
    }

    pub fn android_scheme(&self) -> AndroidScheme {
        self.scheme
    }

    pub fn hos_mib(&self) -> u64 {
        self.hos_mib
    }

    pub fn emummc_mib(&self) -> u64 {
        self.emummc_mib
    }

    pub fn emummc_double(&self) -> bool {
        self.emummc_double
    }

    pub fn linux_mib(&self) -> u64 {
        self.linux_mib
    }

    /// Android total, reserved partitions included.
    pub fn android_mib(&self) -> u64 {
        self.android_mib
    }

    pub fn android_user_mib(&self) -> u64 {
        self.android_mib.saturating_sub(ANDROID_RESERVED_MIB)
    }

    /// Android needs a GPT; everything else fits the MBR.
    pub fn needs_gpt(&self) -> bool {
        self.android_mib > 0
    }

    /// True when HOS is the only partition.
    pub fn hos_only(&self) -> bool {
        self.emummc_mib == 0 && self.linux_mib == 0 && self.android_mib == 0
    }
}

impl fmt::Display for PartitionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HOS {} MiB", self.hos_mib)?;
        if self.linux_mib > 0 {
            write!(f, ", Linux {} MiB", self.linux_mib)?;
        }
        if self.android_mib > 0 {
            write!(f, ", Android {} MiB ({})", self.android_mib, self.scheme)?;
        }
        if self.emummc_mib > 0 {
            let kind = if self.emummc_double { "2x " } else { "" };
            write!(f, ", emuMMC {}{} MiB", kind, self.emummc_mib)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB_SECTORS: u64 = 1 << 21;

    fn card(gib: u64) -> PartitionPlan {
        PartitionPlan::new(gib * GIB_SECTORS + 12345, TargetMedium::SdCard, ReferenceDevice::Emmc32Gb)
            .expect("plan")
    }

    #[test]
    fn test_new_plan_gives_everything_to_hos() {
        let plan = card(64);
        assert_eq!(plan.total_sectors() % LAYOUT_BASE_LBA, 0);
        assert_eq!(plan.alignment_sectors(), 12345);
        assert_eq!(plan.hos_mib(), 64 * 1024 - 16);
        assert!(plan.hos_only());
        plan.validate().expect("valid");
    }

    #[test]
    fn test_reference_and_scheme_parse() {
        assert_eq!("64GB".parse::<ReferenceDevice>().expect("parse"), ReferenceDevice::Emmc64Gb);
        assert_eq!("emmc32".parse::<ReferenceDevice>().expect("parse"), ReferenceDevice::Emmc32Gb);
        assert!(matches!("128".parse::<ReferenceDevice>(), Err(EngineError::Config { .. })));

        assert_eq!("Dynamic".parse::<AndroidScheme>().expect("parse"), AndroidScheme::Dynamic);
        assert_eq!(
            AndroidScheme::Legacy.to_string().parse::<AndroidScheme>().expect("parse"),
            AndroidScheme::Legacy
        );
        assert!(matches!("treble".parse::<AndroidScheme>(), Err(EngineError::Config { .. })));
    }

    #[test]
    fn test_tiny_card_is_rejected() {
        assert!(PartitionPlan::new(2 * GIB_SECTORS, TargetMedium::SdCard, ReferenceDevice::Emmc32Gb).is_err());
        assert!(PartitionPlan::new(2 * GIB_SECTORS, TargetMedium::Emmc, ReferenceDevice::Emmc32Gb).is_ok());
    }

    #[test]
    fn test_emummc_slider_sizes() {
        let plan = card(128);
        let single = plan.set_emummc_slider(1).plan().expect("accepted");
        assert_eq!(single.emummc_mib(), 4 * 1024 + 32);
        assert!(!single.emummc_double());

        let full = plan.set_emummc_slider(10).plan().expect("accepted");
        assert_eq!(full.emummc_mib(), 29856);

        let double = plan.set_emummc_slider(12).plan().expect("accepted");
        assert_eq!(double.emummc_mib(), (5 * 1024 + 32) * 2);
        assert!(double.emummc_double());

        let double_full = plan.set_emummc_slider(20).plan().expect("accepted");
        assert_eq!(double_full.emummc_mib(), 2 * 29856);
        double_full.validate().expect("valid");
    }

    #[test]
    fn test_emummc_slider_encoding_roundtrips() {
        let plan = card(128);
        for value in 0..=MAX_EMUMMC_SLIDER {
            let moved = plan.set_emummc_slider(value).plan().expect("fits");
            assert_eq!(moved.emummc_slider(), value, "slider {}", value);
        }
    }

    #[test]
    fn test_emummc_rejection_restores_previous_slider() {
        let plan = card(16).set_emummc_slider(2).plan().expect("fits");
        assert_eq!(plan.set_emummc_slider(20), SliderChange::Rejected { value: 2 });
        assert_eq!(plan.set_emummc_slider(21), SliderChange::Rejected { value: 2 });
    }

    #[test]
    fn test_sixty_four_gb_reference_full_size() {
        let plan = PartitionPlan::new(256 * GIB_SECTORS, TargetMedium::SdCard, ReferenceDevice::Emmc64Gb)
            .expect("plan");
        let full = plan.set_emummc_slider(10).plan().expect("fits");
        assert_eq!(full.emummc_mib(), 59665);
    }

    #[test]
    fn test_linux_slider_snaps() {
        let plan = card(64);
        assert!(matches!(
            plan.set_linux_size(2000),
            SliderChange::Adjusted { value: 0, .. }
        ));
        match plan.set_linux_size(5000) {
            SliderChange::Adjusted { plan, value } => {
                assert_eq!(value, 8192);
                assert_eq!(plan.linux_mib(), 8192);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(plan.set_linux_size(16384), SliderChange::Accepted(_)));
    }

    #[test]
    fn test_linux_slider_clamps_to_free_space() {
        let plan = card(32);
        match plan.set_linux_size(64 * 1024) {
            SliderChange::Adjusted { plan, value } => {
                assert_eq!(plan.hos_mib(), 2048);
                assert_eq!(value, 32 * 1024 - 16 - 2048);
                plan.validate().expect("valid");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_linux_rejected_when_clamp_too_small() {
        let plan = card(16).set_emummc_slider(4).plan().expect("fits");
        assert_eq!(plan.set_linux_size(8192), SliderChange::Rejected { value: 0 });
    }

    #[test]
    fn test_android_adds_reserved_partitions() {
        let plan = card(64);
        let with_android = plan.set_android_user_size(8192).plan().expect("fits");
        assert_eq!(with_android.android_mib(), 8192 + 4096);
        assert_eq!(with_android.android_user_mib(), 8192);
        assert!(with_android.needs_gpt());

        assert!(matches!(
            plan.set_android_user_size(3000),
            SliderChange::Adjusted { value: 4096, .. }
        ));
    }

    #[test]
    fn test_emmc_target_uses_lower_minimum() {
        let plan = PartitionPlan::new(16 * GIB_SECTORS, TargetMedium::Emmc, ReferenceDevice::Emmc32Gb)
            .expect("plan");
        let clamped = plan.set_linux_size(64 * 1024).plan().expect("fits");
        assert_eq!(clamped.hos_mib(), 1024);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Change {
            Emummc(u32),
            Linux(u64),
            Android(u64),
        }

        fn change() -> impl Strategy<Value = Change> {
            prop_oneof![
                (0u32..=22).prop_map(Change::Emummc),
                (0u64..200_000).prop_map(Change::Linux),
                (0u64..200_000).prop_map(Change::Android),
            ]
        }

        proptest! {
            #[test]
            fn sizes_always_add_up(
                gib in 8u64..512,
                changes in prop::collection::vec(change(), 1..12),
            ) {
                let mut plan = PartitionPlan::new(gib * GIB_SECTORS, TargetMedium::SdCard, ReferenceDevice::Emmc32Gb)
                    .expect("plan");
                for change in changes {
                    let result = match change {
                        Change::Emummc(v) => plan.set_emummc_slider(v),
                        Change::Linux(mib) => plan.set_linux_size(mib),
                        Change::Android(mib) => plan.set_android_user_size(mib),
                    };
                    if let Some(next) = result.plan() {
                        plan = next;
                    }
                    prop_assert!(plan.validate().is_ok(), "{:?}", plan);
                    prop_assert!(plan.hos_mib() >= 2048);
                }
            }
        }
    }
}
