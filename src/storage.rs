//! Typed values that survive reboots through pluggable backing stores.

use alloc::string::String;

use log::{info, warn};

/// One value as the backing stores understand it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StoreValue {
    I32(i32),
    I64(i64),
    Bool(bool),
    Str(String),
}

impl StoreValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            StoreValue::I32(_) => ValueKind::I32,
            StoreValue::I64(_) => ValueKind::I64,
            StoreValue::Bool(_) => ValueKind::Bool,
            StoreValue::Str(_) => ValueKind::Str,
        }
    }
}

impl core::fmt::Display for StoreValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StoreValue::I32(v) => write!(f, "{v}"),
            StoreValue::I64(v) => write!(f, "{v}"),
            StoreValue::Bool(v) => write!(f, "{v}"),
            StoreValue::Str(v) => write!(f, "{v}"),
        }
    }
}

/// Type tag for a [`StoreValue`], used by the config registry to reject
/// server payloads whose type disagrees with the registered entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValueKind {
    I32,
    I64,
    Bool,
    Str,
}

impl ValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::I32 => "i32",
            ValueKind::I64 => "i64",
            ValueKind::Bool => "bool",
            ValueKind::Str => "str",
        }
    }
}

/// Conversion between native value types and [`StoreValue`].
///
/// Decoding never coerces: a stored value of the wrong kind yields `None`.
pub trait StoreCodec: Sized {
    const KIND: ValueKind;

    fn to_value(&self) -> StoreValue;
    fn from_value(value: &StoreValue) -> Option<Self>;
}

impl StoreCodec for i32 {
    const KIND: ValueKind = ValueKind::I32;

    fn to_value(&self) -> StoreValue {
        StoreValue::I32(*self)
    }

    fn from_value(value: &StoreValue) -> Option<Self> {
        match value {
            StoreValue::I32(v) => Some(*v),
            _ => None,
        }
    }
}

impl StoreCodec for i64 {
    const KIND: ValueKind = ValueKind::I64;

    fn to_value(&self) -> StoreValue {
        StoreValue::I64(*self)
    }

    fn from_value(value: &StoreValue) -> Option<Self> {
        match value {
            StoreValue::I64(v) => Some(*v),
            _ => None,
        }
    }
}

impl StoreCodec for bool {
    const KIND: ValueKind = ValueKind::Bool;

    fn to_value(&self) -> StoreValue {
        StoreValue::Bool(*self)
    }

    fn from_value(value: &StoreValue) -> Option<Self> {
        match value {
            StoreValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl StoreCodec for String {
    const KIND: ValueKind = ValueKind::Str;

    fn to_value(&self) -> StoreValue {
        StoreValue::Str(self.clone())
    }

    fn from_value(value: &StoreValue) -> Option<Self> {
        match value {
            StoreValue::Str(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// Flash-backed key-value store with per-section transactions.
///
/// `put` only stages a write in the section's open transaction; `commit`
/// makes every staged write of that section durable at once. A reader must
/// observe its own staged writes. Implementations are not reentrant: callers
/// never nest independent transactions on the same section.
pub trait NvStore {
    type Error: core::fmt::Display;

    fn get(&mut self, section: &str, key: &str) -> Result<Option<StoreValue>, Self::Error>;

    /// Stage a write; durable only after [`NvStore::commit`] on the section.
    fn put(&mut self, section: &str, key: &str, value: StoreValue) -> Result<(), Self::Error>;

    /// Atomically persist all staged writes of `section`.
    fn commit(&mut self, section: &str) -> Result<(), Self::Error>;

    /// Discard all staged writes of `section`. Callers that abandon a
    /// transaction midway must roll it back, or a later commit on the same
    /// section would sweep the leftovers in.
    fn rollback(&mut self, section: &str);
}

/// Index of one cell in a retained-RAM arena.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetainedSlot(pub usize);

/// Small memory region that keeps its contents across sleep but not across
/// full power loss. Accessors take a slot index and the arena handle.
pub trait RetainedStore {
    fn load(&self, slot: RetainedSlot) -> Option<StoreValue>;
    fn store(&mut self, slot: RetainedSlot, value: StoreValue);
}

/// Statically-sized retained-memory arena.
///
/// On hardware the platform places one instance in a RAM region that
/// survives sleep; a freshly constructed arena models a full power cycle
/// (all cells empty).
#[derive(Debug)]
pub struct RetainedMemory<const N: usize> {
    cells: [Option<StoreValue>; N],
}

impl<const N: usize> RetainedMemory<N> {
    pub const fn new() -> Self {
        Self {
            cells: [const { None }; N],
        }
    }
}

impl<const N: usize> Default for RetainedMemory<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RetainedStore for RetainedMemory<N> {
    fn load(&self, slot: RetainedSlot) -> Option<StoreValue> {
        self.cells.get(slot.0).cloned().flatten()
    }

    fn store(&mut self, slot: RetainedSlot, value: StoreValue) {
        match self.cells.get_mut(slot.0) {
            Some(cell) => *cell = Some(value),
            None => warn!("retained slot {} out of range, value dropped", slot.0),
        }
    }
}

/// Where a [`PersistentValue`] lives between wake cycles.
///
/// The choice is made once at construction and is not safe to change after
/// the first read.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Persistence {
    /// No backing; the value resets to its default on every boot.
    None,
    /// Retained RAM; survives sleep, lost on full power loss.
    Retained(RetainedSlot),
    /// Non-volatile store, written through on every change.
    Implicit {
        section: &'static str,
        key: &'static str,
    },
    /// Non-volatile store, written only on an explicit bulk flush under a
    /// caller-held section transaction.
    Explicit { key: &'static str },
}

/// Mutable handles to the two persistence backends, bundled so subsystem
/// calls stay one parameter wide.
pub struct Backing<'a, NV, RT> {
    pub nv: &'a mut NV,
    pub retained: &'a mut RT,
}

/// Typed value backed by one of the [`Persistence`] stores.
///
/// `get` always returns the most recently set value regardless of backend.
/// Setting the current value again is a no-op so unchanged values never cost
/// a flash wear cycle. Backend failures degrade to the in-memory value and
/// are logged, never fatal.
#[derive(Debug)]
pub struct PersistentValue<T> {
    persistence: Persistence,
    default: T,
    value: T,
}

impl<T> PersistentValue<T>
where
    T: StoreCodec + Clone + PartialEq,
{
    pub fn new(persistence: Persistence, default: T) -> Self {
        Self {
            persistence,
            value: default.clone(),
            default,
        }
    }

    pub fn get(&self) -> T {
        self.value.clone()
    }

    /// Load the backend value if one is present, otherwise keep the default.
    ///
    /// Explicit-mode values are loaded through [`PersistentValue::load_explicit`]
    /// instead, under the caller's section transaction.
    pub fn load<NV, RT>(&mut self, backing: &mut Backing<'_, NV, RT>)
    where
        NV: NvStore,
        RT: RetainedStore,
    {
        match self.persistence {
            Persistence::None | Persistence::Explicit { .. } => {}
            Persistence::Retained(slot) => {
                if let Some(raw) = backing.retained.load(slot) {
                    self.adopt(&raw);
                }
            }
            Persistence::Implicit { section, key } => match backing.nv.get(section, key) {
                Ok(Some(raw)) => self.adopt(&raw),
                Ok(None) => {}
                Err(err) => warn!("nv read {section}/{key} failed: {err}"),
            },
        }
    }

    /// Set the value, writing through to retained RAM or the implicit
    /// non-volatile backend. A `set` that does not change the value is a
    /// no-op.
    pub fn set<NV, RT>(&mut self, backing: &mut Backing<'_, NV, RT>, value: T)
    where
        NV: NvStore,
        RT: RetainedStore,
    {
        if value == self.value {
            return;
        }
        self.value = value;

        match self.persistence {
            Persistence::None | Persistence::Explicit { .. } => {}
            Persistence::Retained(slot) => {
                backing.retained.store(slot, self.value.to_value());
            }
            Persistence::Implicit { section, key } => {
                let raw = self.value.to_value();
                let write = backing
                    .nv
                    .put(section, key, raw.clone())
                    .and_then(|()| backing.nv.commit(section));
                match write {
                    Ok(()) => info!("nv write {section}/{key}={raw}"),
                    Err(err) => warn!("nv write {section}/{key} failed: {err}"),
                }
            }
        }
    }

    /// Set the in-memory value without touching any backend.
    ///
    /// Only meaningful for `None` and `Explicit` persistence, where the
    /// caller owns durability. Returns whether the value changed.
    pub fn set_local(&mut self, value: T) -> bool {
        if value == self.value {
            return false;
        }
        self.value = value;
        true
    }

    /// Bulk-load path for explicit-mode values, under the caller's section
    /// transaction.
    pub fn load_explicit<NV: NvStore>(&mut self, nv: &mut NV, section: &str) {
        let Persistence::Explicit { key } = self.persistence else {
            return;
        };
        match nv.get(section, key) {
            Ok(Some(raw)) => self.adopt(&raw),
            Ok(None) => {}
            Err(err) => warn!("nv read {section}/{key} failed: {err}"),
        }
    }

    /// Bulk-flush path for explicit-mode values: stages a put when the value
    /// differs from what the backend holds. The caller commits the section.
    ///
    /// Values are logged by key only; explicit mode is where credentials
    /// live.
    pub fn flush_explicit<NV: NvStore>(&self, nv: &mut NV, section: &str) {
        let Persistence::Explicit { key } = self.persistence else {
            return;
        };

        let stored = match nv.get(section, key) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("nv read {section}/{key} failed: {err}");
                None
            }
        };
        let current = self.value.to_value();
        if stored.as_ref() == Some(&current) {
            return;
        }
        match nv.put(section, key, current) {
            Ok(()) => info!("nv write {section}/{key} staged"),
            Err(err) => warn!("nv write {section}/{key} failed: {err}"),
        }
    }

    fn adopt(&mut self, raw: &StoreValue) {
        match T::from_value(raw) {
            Some(value) => self.value = value,
            None => {
                warn!(
                    "stored value kind {} does not match expected {}, keeping default",
                    raw.kind().as_str(),
                    T::KIND.as_str()
                );
                self.value = self.default.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use super::*;
    use crate::mock::MockNv;

    fn backing<'a>(nv: &'a mut MockNv, retained: &'a mut RetainedMemory<4>) -> Backing<'a, MockNv, RetainedMemory<4>> {
        Backing { nv, retained }
    }

    #[test]
    fn get_returns_last_set_value_for_every_backend() {
        let mut nv = MockNv::new();
        let mut retained = RetainedMemory::<4>::new();
        let mut b = backing(&mut nv, &mut retained);

        let mut none = PersistentValue::new(Persistence::None, 1i32);
        let mut ram = PersistentValue::new(Persistence::Retained(RetainedSlot(0)), 2i32);
        let mut flash = PersistentValue::new(
            Persistence::Implicit {
                section: "iot",
                key: "x",
            },
            3i32,
        );

        none.set(&mut b, 10);
        ram.set(&mut b, 20);
        flash.set(&mut b, 30);

        assert_eq!(none.get(), 10);
        assert_eq!(ram.get(), 20);
        assert_eq!(flash.get(), 30);
    }

    #[test]
    fn reboot_preserves_retained_and_implicit_but_not_unbacked() {
        let mut nv = MockNv::new();
        let mut retained = RetainedMemory::<4>::new();

        {
            let mut b = backing(&mut nv, &mut retained);
            let mut none = PersistentValue::new(Persistence::None, 1i32);
            let mut ram = PersistentValue::new(Persistence::Retained(RetainedSlot(0)), 2i32);
            let mut flash = PersistentValue::new(
                Persistence::Implicit {
                    section: "iot",
                    key: "x",
                },
                3i32,
            );
            none.set(&mut b, 10);
            ram.set(&mut b, 20);
            flash.set(&mut b, 30);
        }

        // Same backends, fresh values: a reboot.
        let mut b = backing(&mut nv, &mut retained);
        let mut none = PersistentValue::new(Persistence::None, 1i32);
        let mut ram = PersistentValue::new(Persistence::Retained(RetainedSlot(0)), 2i32);
        let mut flash = PersistentValue::new(
            Persistence::Implicit {
                section: "iot",
                key: "x",
            },
            3i32,
        );
        none.load(&mut b);
        ram.load(&mut b);
        flash.load(&mut b);

        assert_eq!(none.get(), 1);
        assert_eq!(ram.get(), 20);
        assert_eq!(flash.get(), 30);
    }

    #[test]
    fn unchanged_set_never_writes_the_backend() {
        let mut nv = MockNv::new();
        let mut retained = RetainedMemory::<4>::new();
        let mut b = backing(&mut nv, &mut retained);

        let mut flash = PersistentValue::new(
            Persistence::Implicit {
                section: "iot",
                key: "x",
            },
            0i32,
        );
        flash.set(&mut b, 5);
        assert_eq!(b.nv.write_count("iot", "x"), 1);

        flash.set(&mut b, 5);
        flash.set(&mut b, 5);
        assert_eq!(b.nv.write_count("iot", "x"), 1);
    }

    #[test]
    fn explicit_value_is_not_durable_until_flushed() {
        let mut nv = MockNv::new();
        let mut value =
            PersistentValue::new(Persistence::Explicit { key: "token" }, String::new());

        assert!(value.set_local("secret".to_string()));
        assert_eq!(nv.committed("iot", "token"), None);

        value.flush_explicit(&mut nv, "iot");
        assert_eq!(nv.committed("iot", "token"), None);

        nv.commit("iot").unwrap();
        assert_eq!(
            nv.committed("iot", "token"),
            Some(&StoreValue::Str("secret".to_string()))
        );
    }

    #[test]
    fn explicit_flush_skips_unchanged_backend_value() {
        let mut nv = MockNv::new();
        nv.put("iot", "token", StoreValue::Str("secret".to_string()))
            .unwrap();
        nv.commit("iot").unwrap();
        let writes_before = nv.write_count("iot", "token");

        let mut value =
            PersistentValue::new(Persistence::Explicit { key: "token" }, String::new());
        value.load_explicit(&mut nv, "iot");
        value.flush_explicit(&mut nv, "iot");

        assert_eq!(nv.write_count("iot", "token"), writes_before);
    }

    #[test]
    fn mismatched_stored_kind_keeps_the_default() {
        let mut nv = MockNv::new();
        let mut retained = RetainedMemory::<4>::new();
        nv.put("iot", "x", StoreValue::Str("not a number".to_string()))
            .unwrap();
        nv.commit("iot").unwrap();

        let mut b = backing(&mut nv, &mut retained);
        let mut flash = PersistentValue::new(
            Persistence::Implicit {
                section: "iot",
                key: "x",
            },
            7i32,
        );
        flash.load(&mut b);
        assert_eq!(flash.get(), 7);
    }

    #[test]
    fn rollback_discards_staged_but_not_committed_writes() {
        let mut nv = MockNv::new();
        nv.put("iot", "a", StoreValue::I32(1)).unwrap();
        nv.commit("iot").unwrap();

        nv.put("iot", "a", StoreValue::I32(2)).unwrap();
        nv.put("iot", "b", StoreValue::I32(3)).unwrap();
        nv.rollback("iot");
        nv.commit("iot").unwrap();

        assert_eq!(nv.committed("iot", "a"), Some(&StoreValue::I32(1)));
        assert_eq!(nv.committed("iot", "b"), None);
        assert_eq!(nv.get("iot", "a").unwrap(), Some(StoreValue::I32(1)));
    }

    #[test]
    fn storage_failure_degrades_to_memory_value() {
        let mut nv = MockNv::new();
        let mut retained = RetainedMemory::<4>::new();
        nv.fail_writes = true;
        let mut b = backing(&mut nv, &mut retained);

        let mut flash = PersistentValue::new(
            Persistence::Implicit {
                section: "iot",
                key: "x",
            },
            0i32,
        );
        flash.set(&mut b, 42);
        assert_eq!(flash.get(), 42);
        assert_eq!(b.nv.committed("iot", "x"), None);
    }
}
