//! Typed, identity-keyed context map shared across the pipeline (component C1).
//!
//! Keys are created with [`new_key`] and compared by a private numeric
//! identity rather than by their descriptive name, so two keys created with
//! the same string never alias each other. This replaces the source
//! runtime's reflection-based key lookup with a plain, `'static`-free
//! identity counter.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

/// A typed handle into a [`Context`]. `Key<V>` values are produced by
/// [`new_key`]; each call mints a fresh identity even if the `name` is
/// reused, so collisions can only happen by sharing the same `Key` value.
pub struct Key<V> {
    id: u64,
    name: &'static str,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Key<V> {
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<V> Clone for Key<V> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<V> Copy for Key<V> {}

impl<V> PartialEq for Key<V> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl<V> Eq for Key<V> {}

impl<V> std::fmt::Debug for Key<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key").field("name", &self.name).field("id", &self.id).finish()
    }
}

/// Mints a fresh, globally unique context key with the given descriptive
/// name. The name is used only for `Debug` output and `MissingKey` error
/// messages; it plays no part in equality.
pub fn new_key<V>(name: &'static str) -> Key<V> {
    Key {
        id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed),
        name,
        _marker: PhantomData,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("missing required context key: {0}")]
    MissingKey(&'static str),
    #[error("cannot mutate an unmodifiable context view")]
    ImmutableView,
}

impl From<ContextError> for forge_error::RuntimeError {
    fn from(err: ContextError) -> Self {
        forge_error::RuntimeError::new(forge_error::ErrorKind::CallValidation, err.to_string())
            .with_cause(err)
    }
}

#[derive(Clone)]
struct Entry {
    name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

/// A process-local, heterogeneous key-value map.
///
/// `Context` is a cheap handle (an `Arc` plus a writability flag): cloning it
/// does not copy entries. [`Context::unmodifiable_view`] returns a handle
/// sharing the same backing map but with mutation disabled; any attempt to
/// mutate through it returns [`ContextError::ImmutableView`] and leaves the
/// shared state untouched. [`Context::unmodifiable_copy`] and
/// [`Context::modifiable_copy`] instead snapshot the entries into a fresh,
/// independent map.
#[derive(Clone)]
pub struct Context {
    state: Arc<RwLock<HashMap<u64, Entry>>>,
    writable: bool,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        Context {
            state: Arc::new(RwLock::new(HashMap::new())),
            writable: true,
        }
    }

    fn ensure_writable(&self) -> Result<(), ContextError> {
        if self.writable {
            Ok(())
        } else {
            Err(ContextError::ImmutableView)
        }
    }

    pub fn put<V: Send + Sync + 'static>(&self, key: Key<V>, value: V) -> Result<(), ContextError> {
        self.ensure_writable()?;
        self.state.write().unwrap().insert(
            key.id,
            Entry {
                name: key.name,
                value: Arc::new(value),
            },
        );
        Ok(())
    }

    pub fn put_if_absent<V: Send + Sync + 'static>(
        &self,
        key: Key<V>,
        value: V,
    ) -> Result<bool, ContextError> {
        self.ensure_writable()?;
        let mut guard = self.state.write().unwrap();
        if guard.contains_key(&key.id) {
            Ok(false)
        } else {
            guard.insert(
                key.id,
                Entry {
                    name: key.name,
                    value: Arc::new(value),
                },
            );
            Ok(true)
        }
    }

    /// Returns the existing value for `key`, or computes and stores one via
    /// `f` if absent. `f` receives the key so it can be used in diagnostics.
    pub fn compute_if_absent<V: Send + Sync + 'static>(
        &self,
        key: Key<V>,
        f: impl FnOnce(Key<V>) -> V,
    ) -> Result<Arc<V>, ContextError> {
        self.ensure_writable()?;
        let mut guard = self.state.write().unwrap();
        if let Some(entry) = guard.get(&key.id) {
            return Ok(downcast(entry.value.clone()));
        }
        let value = Arc::new(f(key));
        guard.insert(
            key.id,
            Entry {
                name: key.name,
                value: value.clone(),
            },
        );
        Ok(value)
    }

    pub fn get<V: Send + Sync + 'static>(&self, key: Key<V>) -> Option<Arc<V>> {
        let guard = self.state.read().unwrap();
        guard.get(&key.id).map(|e| downcast(e.value.clone()))
    }

    pub fn expect<V: Send + Sync + 'static>(&self, key: Key<V>) -> Result<Arc<V>, ContextError> {
        self.get(key).ok_or(ContextError::MissingKey(key.name))
    }

    /// Copies every entry from `other` into `self`, even if `other` is an
    /// unmodifiable view — the source's writability does not gate reads.
    pub fn put_all(&self, other: &Context) -> Result<(), ContextError> {
        self.ensure_writable()?;
        let src = other.state.read().unwrap();
        let mut dst = self.state.write().unwrap();
        for (id, entry) in src.iter() {
            dst.insert(*id, entry.clone());
        }
        Ok(())
    }

    /// A read-only handle sharing this context's backing map: later puts on
    /// `self` remain visible through the view.
    pub fn unmodifiable_view(&self) -> Context {
        Context {
            state: self.state.clone(),
            writable: false,
        }
    }

    /// A read-only snapshot, independent of later mutation of `self`.
    pub fn unmodifiable_copy(&self) -> Context {
        let snapshot = self.state.read().unwrap().clone();
        Context {
            state: Arc::new(RwLock::new(snapshot)),
            writable: false,
        }
    }

    /// A writable snapshot, independent of later mutation of `self`.
    pub fn modifiable_copy(&self) -> Context {
        let snapshot = self.state.read().unwrap().clone();
        Context {
            state: Arc::new(RwLock::new(snapshot)),
            writable: true,
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn downcast<V: Send + Sync + 'static>(value: Arc<dyn Any + Send + Sync>) -> Arc<V> {
    value
        .downcast::<V>()
        .unwrap_or_else(|_| unreachable!("context key identity guarantees the stored type matches"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_with_same_name_are_distinct() {
        let a: Key<i32> = new_key("count");
        let b: Key<i32> = new_key("count");
        assert_ne!(a, b);

        let ctx = Context::new();
        ctx.put(a, 1).unwrap();
        ctx.put(b, 2).unwrap();
        assert_eq!(*ctx.get(a).unwrap(), 1);
        assert_eq!(*ctx.get(b).unwrap(), 2);
    }

    #[test]
    fn expect_fails_naming_the_key() {
        let key: Key<String> = new_key("session-id");
        let ctx = Context::new();
        let err = ctx.expect(key).unwrap_err();
        assert_eq!(err.to_string(), "missing required context key: session-id");
    }

    #[test]
    fn unmodifiable_view_mirrors_later_mutation_and_rejects_writes() {
        let key: Key<i32> = new_key("n");
        let ctx = Context::new();
        ctx.put(key, 1).unwrap();

        let view = ctx.unmodifiable_view();
        assert_eq!(*view.get(key).unwrap(), 1);

        ctx.put(key, 2).unwrap();
        assert_eq!(*view.get(key).unwrap(), 2);

        let err = view.put(key, 3).unwrap_err();
        assert!(matches!(err, ContextError::ImmutableView));
        // The write through the view did not happen; the owning context is
        // also untouched beyond the one committed `put` above.
        assert_eq!(*ctx.get(key).unwrap(), 2);
    }

    #[test]
    fn unmodifiable_copy_is_independent_of_later_mutation() {
        let key: Key<i32> = new_key("n");
        let ctx = Context::new();
        ctx.put(key, 1).unwrap();

        let copy = ctx.unmodifiable_copy();
        ctx.put(key, 2).unwrap();

        assert_eq!(*copy.get(key).unwrap(), 1);
        assert_eq!(*ctx.get(key).unwrap(), 2);
    }

    #[test]
    fn put_all_copies_values_even_from_an_unmodifiable_view() {
        let key: Key<i32> = new_key("n");
        let source = Context::new();
        source.put(key, 42).unwrap();
        let view = source.unmodifiable_view();

        let dest = Context::new();
        dest.put_all(&view).unwrap();
        assert_eq!(*dest.get(key).unwrap(), 42);
    }

    #[test]
    fn compute_if_absent_only_computes_once() {
        let key: Key<i32> = new_key("lazy");
        let ctx = Context::new();
        let calls = std::sync::atomic::AtomicU32::new(0);

        ctx.compute_if_absent(key, |_| {
            calls.fetch_add(1, Ordering::Relaxed);
            7
        })
        .unwrap();
        ctx.compute_if_absent(key, |_| {
            calls.fetch_add(1, Ordering::Relaxed);
            99
        })
        .unwrap();

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(*ctx.get(key).unwrap(), 7);
    }
}
