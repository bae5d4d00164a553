use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, OnceLock};

use crate::engine::ChangeDetector;
use crate::error::ScriptError;
use crate::identifier::TaskId;
use crate::value::Value;

pub(crate) type Supplier<T> = Box<dyn FnOnce() -> Result<T, ScriptError> + Send>;

/// Receives the accesses made through tracked handles, so that the owning
/// task's dependencies can be recorded.
pub trait DependencySink: Send + Sync {
    /// Records the first retrieval through a handle and returns the slot the
    /// handle's change detector will be stored at.
    fn record_access(&self, task: &TaskId, observed: &Result<Value, ScriptError>) -> usize;

    /// Replaces the detector of a previously recorded access.
    fn record_detector(&self, slot: usize, detector: ChangeDetector);
}

/// Value cell with single-flight resolution.
///
/// The cell is pending while the supplier is stored, resolving while the
/// supplier runs under the lock, and resolved once the result is set.
struct Cell<T> {
    value: OnceLock<Result<T, ScriptError>>,
    supplier: Mutex<Option<Supplier<T>>>,
}

impl<T: Clone> Cell<T> {
    fn resolved(value: Result<T, ScriptError>) -> Self {
        Self {
            value: OnceLock::from(value),
            supplier: Mutex::new(None),
        }
    }

    fn pending(supplier: Supplier<T>) -> Self {
        Self {
            value: OnceLock::new(),
            supplier: Mutex::new(Some(supplier)),
        }
    }

    fn get(&self) -> Result<T, ScriptError> {
        if let Some(value) = self.value.get() {
            return value.clone();
        }

        let mut supplier = self
            .supplier
            .lock()
            .map_err(|_| ScriptError::HandleUsage("value supplier panicked"))?;

        // another handle over this cell may have resolved it while we waited
        if let Some(value) = self.value.get() {
            return value.clone();
        }

        let result = match supplier.take() {
            Some(supplier) => supplier(),
            None => Err(ScriptError::HandleUsage("value supplier is missing")),
        };

        let _ = self.value.set(result.clone());
        result
    }

    fn is_resolved(&self) -> bool {
        self.value.get().is_some()
    }
}

/// Accessor to the plain result of a task.
///
/// The value is computed at most once, on the first [`get`](Self::get) of any
/// handle sharing the same cell. Every handle carries its own change detector,
/// which can be installed once, after the value has been retrieved.
pub struct DependencyHandle {
    inner: HandleInner,
}

enum HandleInner {
    Direct(DirectHandle),
    Forwarding(ForwardingHandle),
}

struct DirectHandle {
    task: Option<TaskId>,
    cell: Arc<Cell<Value>>,
    sink: Option<Arc<dyn DependencySink>>,
    slot: OnceLock<Option<usize>>,
    detector: OnceLock<ChangeDetector>,
}

/// Handle whose target handle is itself produced lazily.
struct ForwardingHandle {
    source: Arc<Cell<DependencyHandle>>,
    own: OnceLock<Box<DependencyHandle>>,
}

impl DependencyHandle {
    /// Handle over an already known value.
    pub fn resolved(value: Value) -> Self {
        Self::direct(None, Cell::resolved(Ok(value)), None)
    }

    /// Handle computing its value on first access.
    pub fn lazy<F>(supplier: F) -> Self
    where
        F: FnOnce() -> Result<Value, ScriptError> + Send + 'static,
    {
        Self::direct(None, Cell::pending(Box::new(supplier)), None)
    }

    /// Handle over the result of `task`, reporting its accesses to `sink`.
    pub fn tracked<F>(task: TaskId, supplier: F, sink: Arc<dyn DependencySink>) -> Self
    where
        F: FnOnce() -> Result<Value, ScriptError> + Send + 'static,
    {
        Self::direct(Some(task), Cell::pending(Box::new(supplier)), Some(sink))
    }

    /// Handle forwarding to the handle produced by `supplier`.
    pub fn forwarding<F>(supplier: F) -> Self
    where
        F: FnOnce() -> Result<DependencyHandle, ScriptError> + Send + 'static,
    {
        Self {
            inner: HandleInner::Forwarding(ForwardingHandle {
                source: Arc::new(Cell::pending(Box::new(supplier))),
                own: OnceLock::new(),
            }),
        }
    }

    fn direct(task: Option<TaskId>, cell: Cell<Value>, sink: Option<Arc<dyn DependencySink>>) -> Self {
        Self {
            inner: HandleInner::Direct(DirectHandle {
                task,
                cell: Arc::new(cell),
                sink,
                slot: OnceLock::new(),
                detector: OnceLock::new(),
            }),
        }
    }

    pub fn get(&self) -> Result<Value, ScriptError> {
        match &self.inner {
            HandleInner::Direct(direct) => {
                let result = direct.cell.get();
                direct.slot.get_or_init(|| {
                    let task = direct.task.as_ref()?;
                    let sink = direct.sink.as_ref()?;
                    Some(sink.record_access(task, &result))
                });
                result
            }
            HandleInner::Forwarding(forwarding) => {
                let target = match forwarding.own.get() {
                    Some(target) => target,
                    None => {
                        let target = forwarding.source.get()?;
                        forwarding.own.get_or_init(|| Box::new(target))
                    }
                };
                target.get()
            }
        }
    }

    /// Installs the change detector of this handle.
    ///
    /// Fails if the value was not retrieved through this handle yet, or if a
    /// detector is already installed.
    pub fn set_detector(&self, detector: ChangeDetector) -> Result<(), ScriptError> {
        match &self.inner {
            HandleInner::Direct(direct) => {
                let Some(slot) = direct.slot.get() else {
                    return Err(ScriptError::HandleUsage(
                        "change detector set before the value was retrieved",
                    ));
                };

                direct
                    .detector
                    .set(detector.clone())
                    .map_err(|_| ScriptError::HandleUsage("change detector is already set"))?;

                if let (Some(sink), Some(slot)) = (&direct.sink, slot) {
                    sink.record_detector(*slot, detector);
                }

                Ok(())
            }
            HandleInner::Forwarding(forwarding) => match forwarding.own.get() {
                Some(target) => target.set_detector(detector),
                None => Err(ScriptError::HandleUsage(
                    "change detector set before the value was retrieved",
                )),
            },
        }
    }

    pub fn detector(&self) -> Option<ChangeDetector> {
        match &self.inner {
            HandleInner::Direct(direct) => direct.detector.get().cloned(),
            HandleInner::Forwarding(forwarding) => forwarding.own.get()?.detector(),
        }
    }

    /// The task whose result this handle reads, if it reads one directly.
    pub fn task_id(&self) -> Option<&TaskId> {
        match &self.inner {
            HandleInner::Direct(direct) => direct.task.as_ref(),
            HandleInner::Forwarding(forwarding) => forwarding.own.get()?.task_id(),
        }
    }

    /// Whether the value is already known, so that [`get`](Self::get) won't block.
    pub fn is_resolved(&self) -> bool {
        match &self.inner {
            HandleInner::Direct(direct) => direct.cell.is_resolved(),
            HandleInner::Forwarding(forwarding) => match forwarding.own.get() {
                Some(target) => target.is_resolved(),
                None => false,
            },
        }
    }
}

impl Clone for DependencyHandle {
    /// Independent handle over the same underlying value. The clone has no
    /// change detector, and never recomputes the value.
    fn clone(&self) -> Self {
        let inner = match &self.inner {
            HandleInner::Direct(direct) => HandleInner::Direct(DirectHandle {
                task: direct.task.clone(),
                cell: Arc::clone(&direct.cell),
                sink: direct.sink.clone(),
                slot: OnceLock::new(),
                detector: OnceLock::new(),
            }),
            HandleInner::Forwarding(forwarding) => HandleInner::Forwarding(ForwardingHandle {
                source: Arc::clone(&forwarding.source),
                own: OnceLock::new(),
            }),
        };

        Self { inner }
    }
}

impl Debug for DependencyHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyHandle")
            .field("task", &self.task_id())
            .field("resolved", &self.is_resolved())
            .field("detector", &self.detector())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        entries: Mutex<Vec<(TaskId, Option<ChangeDetector>)>>,
    }

    impl DependencySink for RecordingSink {
        fn record_access(&self, task: &TaskId, _: &Result<Value, ScriptError>) -> usize {
            let mut entries = self.entries.lock().unwrap();
            entries.push((task.clone(), None));
            entries.len() - 1
        }

        fn record_detector(&self, slot: usize, detector: ChangeDetector) {
            self.entries.lock().unwrap()[slot].1 = Some(detector);
        }
    }

    fn make_counting(counter: &Arc<AtomicUsize>) -> DependencyHandle {
        let counter = Arc::clone(counter);
        DependencyHandle::lazy(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::from("computed"))
        })
    }

    #[test]
    fn test_detector_before_get_is_rejected() {
        let handle = DependencyHandle::resolved(Value::Int(1));

        assert!(matches!(
            handle.set_detector(ChangeDetector::Never),
            Err(ScriptError::HandleUsage(_))
        ));
    }

    #[test]
    fn test_detector_set_twice_is_rejected() {
        let handle = DependencyHandle::resolved(Value::Int(1));
        handle.get().unwrap();

        handle.set_detector(ChangeDetector::Never).unwrap();
        assert!(handle.set_detector(ChangeDetector::Always).is_err());
        assert_eq!(handle.detector(), Some(ChangeDetector::Never));
    }

    #[test]
    fn test_clone_shares_value_not_detector() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = make_counting(&counter);
        let clone = handle.clone();

        assert!(!clone.is_resolved());
        assert_eq!(handle.get().unwrap(), Value::from("computed"));
        assert!(clone.is_resolved());
        assert_eq!(clone.get().unwrap(), Value::from("computed"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        handle.set_detector(ChangeDetector::Never).unwrap();
        clone.set_detector(ChangeDetector::Always).unwrap();
        assert_eq!(handle.detector(), Some(ChangeDetector::Never));
        assert_eq!(clone.detector(), Some(ChangeDetector::Always));
    }

    #[test]
    fn test_concurrent_get_runs_supplier_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = DependencyHandle::forwarding({
            let counter = Arc::clone(&counter);
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(10));
                Ok(DependencyHandle::resolved(Value::Int(7)))
            }
        });

        std::thread::scope(|s| {
            for _ in 0..8 {
                let clone = handle.clone();
                s.spawn(move || assert_eq!(clone.get().unwrap(), Value::Int(7)));
            }
        });

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_forwarding_detector_goes_to_own_target() {
        let handle = DependencyHandle::forwarding(|| Ok(DependencyHandle::resolved(Value::Int(1))));
        let clone = handle.clone();

        assert!(handle.set_detector(ChangeDetector::Never).is_err());
        handle.get().unwrap();
        clone.get().unwrap();
        handle.set_detector(ChangeDetector::Never).unwrap();

        assert_eq!(handle.detector(), Some(ChangeDetector::Never));
        assert_eq!(clone.detector(), None);
    }

    #[test]
    fn test_nested_forwarding_reaches_innermost_task() {
        let sink = Arc::new(RecordingSink::default());
        let inner_sink = Arc::clone(&sink) as Arc<dyn DependencySink>;
        let handle = DependencyHandle::forwarding(move || {
            Ok(DependencyHandle::forwarding(move || {
                Ok(DependencyHandle::tracked(TaskId::named("leaf"), || Ok(Value::Int(5)), inner_sink))
            }))
        });

        assert_eq!(handle.task_id(), None);
        assert_eq!(handle.get().unwrap(), Value::Int(5));
        assert_eq!(handle.task_id(), Some(&TaskId::named("leaf")));

        handle.set_detector(ChangeDetector::Never).unwrap();
        assert_eq!(sink.entries.lock().unwrap()[0].1, Some(ChangeDetector::Never));
    }

    #[test]
    fn test_tracked_access_is_recorded_once() {
        let sink = Arc::new(RecordingSink::default());
        let handle = DependencyHandle::tracked(
            TaskId::named("dep"),
            || Ok(Value::Int(3)),
            Arc::clone(&sink) as Arc<dyn DependencySink>,
        );

        handle.get().unwrap();
        handle.get().unwrap();
        handle
            .set_detector(ChangeDetector::Equality(Value::Int(3)))
            .unwrap();

        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, TaskId::named("dep"));
        assert_eq!(entries[0].1, Some(ChangeDetector::Equality(Value::Int(3))));
    }

    #[test]
    fn test_failed_supplier_is_cached() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = DependencyHandle::lazy({
            let counter = Arc::clone(&counter);
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ScriptError::configuration("broken"))
            }
        });

        assert!(handle.get().is_err());
        assert!(handle.clone().get().is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
