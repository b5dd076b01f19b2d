//! Device-side core for battery-powered, intermittently-connected endpoints.
//!
//! The crate keeps a device's operating history (boot count, active time,
//! panic backoff) consistent across deep sleep, power loss and watchdog
//! resets, and synchronizes configuration and firmware from a remote server
//! under conditional-request caching rules that minimize bandwidth and flash
//! wear.
//!
//! All hardware and network collaborators are trait seams: [`storage::NvStore`]
//! and [`storage::RetainedStore`] for persistence, [`api::HttpTransport`] for
//! the server channel, [`ota::FirmwareSlot`] for the inactive boot partition
//! and [`lifecycle::SystemControl`] for clocks, sleep and restart. The
//! [`device::Device`] root context owns one instance of each subsystem and
//! drives the boot → sync → sleep cycle; [`mock`] provides scripted
//! implementations of every seam for host-side tests.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod api;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod device;
pub mod escalation;
pub mod lifecycle;
pub mod mock;
pub mod ota;
pub mod storage;
pub mod telemetry;

pub use api::{ApiClient, ApiResponse, HttpTransport, Method};
pub use cache::{ResourceCache, ResourceVersion};
pub use config::ConfigRegistry;
pub use credentials::{CredentialStore, Provisioning, ProvisioningError};
pub use device::{Device, DeviceConfig};
pub use escalation::{EscalatingSleep, EscalationPolicy, PanicHandler};
pub use lifecycle::{LifecycleState, ResetReason, SystemControl, WakeCause};
pub use ota::{FirmwareSlot, OtaError, OtaOutcome};
pub use storage::{Backing, NvStore, PersistentValue, Persistence, RetainedStore, StoreValue};
