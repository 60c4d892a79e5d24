//! Single-threaded reactive primitives: observable cells, lazy memoized
//! computeds, effects, and transaction batching.
//!
//! This is the change-notification collaborator behind the arbor tree
//! engine. Reads inside an effect or computed are tracked through a
//! thread-local runtime; writes notify subscribed effects synchronously, or
//! once per outermost [`batch`] when batching is active.
//!
//! Dependency tracking is pull-validated: every source (cell or computed)
//! has a monotonically increasing version, computeds revalidate against the
//! versions they last saw, and effects subscribe to the flattened leaf
//! sources they actually read.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

thread_local! {
    static RT: Runtime = Runtime::default();
}

#[derive(Default)]
struct Runtime {
    next_id: Cell<u64>,
    versions: RefCell<HashMap<u64, u64>>,
    tracking: RefCell<Vec<Vec<u64>>>,
    subs: RefCell<HashMap<u64, BTreeSet<u64>>>,
    effects: RefCell<HashMap<u64, EffectEntry>>,
    batch_depth: Cell<usize>,
    pending: RefCell<Vec<u64>>,
    draining: Cell<bool>,
}

struct EffectEntry {
    body: Rc<RefCell<dyn FnMut()>>,
    deps: Vec<u64>,
}

fn alloc_id() -> u64 {
    RT.with(|rt| {
        let id = rt.next_id.get() + 1;
        rt.next_id.set(id);
        rt.versions.borrow_mut().insert(id, 0);
        id
    })
}

fn report_observed(id: u64) {
    RT.with(|rt| {
        if let Some(frame) = rt.tracking.borrow_mut().last_mut() {
            if !frame.contains(&id) {
                frame.push(id);
            }
        }
    });
}

fn current_version(id: u64) -> u64 {
    RT.with(|rt| rt.versions.borrow().get(&id).copied().unwrap_or(0))
}

fn bump_version(id: u64) {
    RT.with(|rt| {
        *rt.versions.borrow_mut().entry(id).or_insert(0) += 1;
    });
}

fn report_changed(id: u64) {
    let run_now = RT.with(|rt| {
        *rt.versions.borrow_mut().entry(id).or_insert(0) += 1;
        if let Some(set) = rt.subs.borrow().get(&id) {
            let mut pending = rt.pending.borrow_mut();
            for eid in set {
                if !pending.contains(eid) {
                    pending.push(*eid);
                }
            }
        }
        rt.batch_depth.get() == 0 && !rt.draining.get()
    });
    if run_now {
        drain();
    }
}

fn drain() {
    loop {
        let next = RT.with(|rt| {
            rt.draining.set(true);
            let mut pending = rt.pending.borrow_mut();
            if pending.is_empty() {
                rt.draining.set(false);
                None
            } else {
                Some(pending.remove(0))
            }
        });
        match next {
            Some(eid) => run_effect(eid),
            None => break,
        }
    }
}

fn run_effect(eid: u64) {
    let Some(body) = RT.with(|rt| rt.effects.borrow().get(&eid).map(|e| e.body.clone())) else {
        return;
    };
    // A body that triggers itself is already borrowed; skip the nested run.
    let Ok(mut f) = body.try_borrow_mut() else {
        return;
    };
    RT.with(|rt| rt.tracking.borrow_mut().push(Vec::new()));
    (f)();
    let frame = RT.with(|rt| rt.tracking.borrow_mut().pop().unwrap_or_default());
    drop(f);
    RT.with(|rt| {
        let mut effects = rt.effects.borrow_mut();
        let Some(entry) = effects.get_mut(&eid) else {
            return;
        };
        let mut subs = rt.subs.borrow_mut();
        for dep in &entry.deps {
            if let Some(set) = subs.get_mut(dep) {
                set.remove(&eid);
            }
        }
        for dep in &frame {
            subs.entry(*dep).or_default().insert(eid);
        }
        entry.deps = frame;
    });
}

/// Runs `f` with notifications deferred until the outermost batch exits.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    struct Depth;
    impl Drop for Depth {
        fn drop(&mut self) {
            let flush = RT.with(|rt| {
                let d = rt.batch_depth.get() - 1;
                rt.batch_depth.set(d);
                d == 0 && !rt.draining.get()
            });
            if flush {
                drain();
            }
        }
    }
    RT.with(|rt| rt.batch_depth.set(rt.batch_depth.get() + 1));
    let _guard = Depth;
    f()
}

/// Runs `f` without recording reads into any enclosing tracking frame.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    RT.with(|rt| rt.tracking.borrow_mut().push(Vec::new()));
    let out = f();
    RT.with(|rt| {
        rt.tracking.borrow_mut().pop();
    });
    out
}

/// A mutable value whose reads are tracked and whose writes notify
/// subscribed effects.
pub struct ObservableCell<T> {
    shared: Rc<CellShared<T>>,
}

struct CellShared<T> {
    id: u64,
    value: RefCell<T>,
}

impl<T> Clone for ObservableCell<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> ObservableCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            shared: Rc::new(CellShared {
                id: alloc_id(),
                value: RefCell::new(value),
            }),
        }
    }

    /// Tracked read by reference.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        report_observed(self.shared.id);
        f(&self.shared.value.borrow())
    }

    pub fn set(&self, value: T) {
        *self.shared.value.borrow_mut() = value;
        report_changed(self.shared.id);
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.shared.value.borrow_mut());
        report_changed(self.shared.id);
    }
}

impl<T: Clone> ObservableCell<T> {
    /// Tracked read.
    pub fn get(&self) -> T {
        report_observed(self.shared.id);
        self.shared.value.borrow().clone()
    }
}

impl<T> Drop for CellShared<T> {
    fn drop(&mut self) {
        let _ = RT.try_with(|rt| {
            rt.versions.borrow_mut().remove(&self.id);
            rt.subs.borrow_mut().remove(&self.id);
        });
    }
}

/// A lazy memoized derivation, revalidated against the versions of every
/// source it read during its last computation.
pub struct Computed<T> {
    shared: Rc<ComputedShared<T>>,
}

struct ComputedShared<T> {
    id: u64,
    derive: Box<dyn Fn() -> T>,
    cache: RefCell<Option<T>>,
    deps: RefCell<Vec<(u64, u64)>>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone> Computed<T> {
    pub fn new(derive: impl Fn() -> T + 'static) -> Self {
        Self {
            shared: Rc::new(ComputedShared {
                id: alloc_id(),
                derive: Box::new(derive),
                cache: RefCell::new(None),
                deps: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn get(&self) -> T {
        let stale = {
            let cache = self.shared.cache.borrow();
            match &*cache {
                None => true,
                Some(_) => self
                    .shared
                    .deps
                    .borrow()
                    .iter()
                    .any(|(id, seen)| current_version(*id) != *seen),
            }
        };
        if stale {
            RT.with(|rt| rt.tracking.borrow_mut().push(Vec::new()));
            let value = (self.shared.derive)();
            let frame = RT.with(|rt| rt.tracking.borrow_mut().pop().unwrap_or_default());
            *self.shared.deps.borrow_mut() = frame
                .iter()
                .map(|id| (*id, current_version(*id)))
                .collect();
            *self.shared.cache.borrow_mut() = Some(value);
            bump_version(self.shared.id);
        }
        // Flatten this computed's sources into the enclosing frame so that
        // effects subscribe to the leaves they transitively depend on.
        report_observed(self.shared.id);
        for (id, _) in self.shared.deps.borrow().iter() {
            report_observed(*id);
        }
        self.shared
            .cache
            .borrow()
            .clone()
            .expect("computed cache populated above")
    }
}

impl<T> Drop for ComputedShared<T> {
    fn drop(&mut self) {
        let _ = RT.try_with(|rt| {
            rt.versions.borrow_mut().remove(&self.id);
            rt.subs.borrow_mut().remove(&self.id);
        });
    }
}

/// A reaction that re-runs whenever any source it read changes.
///
/// The effect runs once on creation to establish its subscriptions and is
/// disposed on drop.
pub struct Effect {
    id: u64,
}

pub fn effect(f: impl FnMut() + 'static) -> Effect {
    let id = alloc_id();
    RT.with(|rt| {
        rt.effects.borrow_mut().insert(
            id,
            EffectEntry {
                body: Rc::new(RefCell::new(f)),
                deps: Vec::new(),
            },
        );
    });
    run_effect(id);
    Effect { id }
}

impl Effect {
    pub fn dispose(&self) {
        RT.with(|rt| {
            if let Some(entry) = rt.effects.borrow_mut().remove(&self.id) {
                let mut subs = rt.subs.borrow_mut();
                for dep in &entry.deps {
                    if let Some(set) = subs.get_mut(dep) {
                        set.remove(&self.id);
                    }
                }
            }
        });
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        self.dispose();
    }
}
